//! Paired loss statistics and standard-normal helpers.
//!
//! All procedures reduce a candidate/baseline comparison to the per-unit loss
//! difference `d_i = loss(candidate)_i - loss(baseline)_i` and the
//! standardized improvement statistic
//!
//! ```text
//! z = -mean(d) / sqrt(var(d) / n)        (population variance)
//! ```
//!
//! so that large positive `z` means the candidate is better. Under the
//! boundary null `E[d] = 0` the statistic is approximately standard normal.

use std::f64::consts::SQRT_2;

use serde::{Deserialize, Serialize};
use statrs::function::erf::{erfc, erfc_inv};

use crate::error::{ConfigurationError, MtpError, NumericalError};

/// Probabilities are clipped to `[PROB_CLIP, 1 - PROB_CLIP]` before taking logs.
pub const PROB_CLIP: f64 = 1e-10;

const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;

/// Symmetry tolerance when validating a correlation matrix.
const CORR_TOL: f64 = 1e-8;

/// Standard normal CDF `Φ(x)`.
#[must_use]
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / SQRT_2)
}

/// Standard normal survival function `1 - Φ(x)`, accurate in the upper tail.
#[must_use]
pub fn normal_sf(x: f64) -> f64 {
    0.5 * erfc(x / SQRT_2)
}

/// Standard normal density.
#[must_use]
pub fn normal_pdf(x: f64) -> f64 {
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

/// Standard normal quantile `Φ⁻¹(p)`; `±∞` at the endpoints.
#[must_use]
pub fn normal_quantile(p: f64) -> f64 {
    if p <= 0.0 {
        f64::NEG_INFINITY
    } else if p >= 1.0 {
        f64::INFINITY
    } else {
        -SQRT_2 * erfc_inv(2.0 * p)
    }
}

/// Upper-tail critical value `Φ⁻¹(1 - alpha)`.
///
/// Computed without forming `1 - alpha`, so Bonferroni-sized levels such as
/// `0.1 / 2^20` keep full precision. `alpha <= 0` yields `+∞` (never accept).
#[must_use]
pub fn upper_critical_value(alpha: f64) -> f64 {
    if alpha <= 0.0 {
        f64::INFINITY
    } else if alpha >= 1.0 {
        f64::NEG_INFINITY
    } else {
        SQRT_2 * erfc_inv(2.0 * alpha)
    }
}

/// Per-unit binary negative log-likelihood of `probabilities` against 0/1 `labels`.
pub fn log_losses(labels: &[f64], probabilities: &[f64]) -> Result<Vec<f64>, MtpError> {
    if labels.len() != probabilities.len() {
        return Err(ConfigurationError::LengthMismatch {
            expected: labels.len(),
            actual: probabilities.len(),
        }
        .into());
    }
    labels
        .iter()
        .zip(probabilities)
        .enumerate()
        .map(|(index, (&y, &p))| {
            if !p.is_finite() {
                return Err(NumericalError::NonFiniteObservation { index, value: p }.into());
            }
            let p = p.clamp(PROB_CLIP, 1.0 - PROB_CLIP);
            Ok(-(y * p.ln() + (1.0 - y) * (1.0 - p).ln()))
        })
        .collect()
}

/// Summary of one paired candidate-versus-baseline comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossComparison {
    /// `candidate - baseline` per unit.
    pub diffs: Vec<f64>,
    pub mean: f64,
    /// Population variance of `diffs`.
    pub variance: f64,
    /// `sqrt(variance / n)`.
    pub std_err: f64,
}

impl LossComparison {
    /// Pair `candidate` and `baseline` losses by index.
    pub fn new(candidate: &[f64], baseline: &[f64]) -> Result<Self, MtpError> {
        if candidate.len() != baseline.len() {
            return Err(ConfigurationError::LengthMismatch {
                expected: baseline.len(),
                actual: candidate.len(),
            }
            .into());
        }
        let diffs: Vec<f64> = candidate
            .iter()
            .zip(baseline)
            .map(|(c, b)| c - b)
            .collect();
        Self::from_diffs(diffs)
    }

    /// Build from already-differenced losses.
    pub fn from_diffs(diffs: Vec<f64>) -> Result<Self, MtpError> {
        let n = diffs.len();
        if n < 2 {
            return Err(ConfigurationError::TooFewObservations(n).into());
        }
        if let Some((index, &value)) = diffs.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(NumericalError::NonFiniteObservation { index, value }.into());
        }
        let (mean, variance) = mean_and_variance(&diffs);
        if variance <= 0.0 {
            return Err(NumericalError::ZeroVariance.into());
        }
        let std_err = (variance / n as f64).sqrt();
        Ok(Self {
            diffs,
            mean,
            variance,
            std_err,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }

    /// Standardized improvement statistic `-mean / se`.
    pub fn z_statistic(&self) -> Result<f64, NumericalError> {
        let z = -self.mean / self.std_err;
        if z.is_finite() {
            Ok(z)
        } else {
            Err(NumericalError::NonFiniteStatistic(z))
        }
    }

    /// One-sided upper confidence bound on `mean(diffs)` at level `alpha`.
    #[must_use]
    pub fn upper_confidence_bound(&self, alpha: f64) -> f64 {
        self.mean + self.std_err * upper_critical_value(alpha)
    }
}

/// Mean and population variance in one pass (Welford).
#[must_use]
pub fn mean_and_variance(xs: &[f64]) -> (f64, f64) {
    let mut mean = 0.0;
    let mut m2 = 0.0;
    for (i, &x) in xs.iter().enumerate() {
        let delta = x - mean;
        mean += delta / (i + 1) as f64;
        m2 += delta * (x - mean);
    }
    if xs.is_empty() {
        (0.0, 0.0)
    } else {
        (mean, m2 / xs.len() as f64)
    }
}

/// Dense symmetric correlation matrix, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    dim: usize,
    data: Vec<f64>,
}

impl CorrelationMatrix {
    /// Validate and wrap a row-major `dim x dim` correlation matrix.
    pub fn new(dim: usize, data: Vec<f64>) -> Result<Self, NumericalError> {
        if dim == 0 || data.len() != dim * dim {
            return Err(NumericalError::MalformedCorrelation(format!(
                "expected {dim}x{dim} entries, got {}",
                data.len()
            )));
        }
        for i in 0..dim {
            let diag = data[i * dim + i];
            if (diag - 1.0).abs() > CORR_TOL {
                return Err(NumericalError::MalformedCorrelation(format!(
                    "diagonal entry {i} is {diag}, expected 1"
                )));
            }
            for j in 0..i {
                let (a, b) = (data[i * dim + j], data[j * dim + i]);
                if !a.is_finite() || (a - b).abs() > CORR_TOL || a.abs() > 1.0 + CORR_TOL {
                    return Err(NumericalError::MalformedCorrelation(format!(
                        "entry ({i},{j}) = {a} vs ({j},{i}) = {b}"
                    )));
                }
            }
        }
        Ok(Self { dim, data })
    }

    #[must_use]
    pub fn identity(dim: usize) -> Self {
        let mut data = vec![0.0; dim * dim];
        for i in 0..dim {
            data[i * dim + i] = 1.0;
        }
        Self { dim, data }
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[must_use]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.dim + j]
    }

    /// Principal submatrix on `indices` (kept in the given order).
    #[must_use]
    pub fn select(&self, indices: &[usize]) -> Self {
        let dim = indices.len();
        let mut data = Vec::with_capacity(dim * dim);
        for &i in indices {
            for &j in indices {
                data.push(self.get(i, j));
            }
        }
        Self { dim, data }
    }
}

/// Pearson correlation between equally long sample vectors.
///
/// The order of `rows` is preserved: callers put prior statistics first and
/// the statistic under test last.
pub fn correlation_matrix(rows: &[&[f64]]) -> Result<CorrelationMatrix, MtpError> {
    let dim = rows.len();
    let Some(first) = rows.first() else {
        return Err(NumericalError::MalformedCorrelation("no samples".to_string()).into());
    };
    let n = first.len();
    for row in rows {
        if row.len() != n {
            return Err(ConfigurationError::LengthMismatch {
                expected: n,
                actual: row.len(),
            }
            .into());
        }
    }
    if n < 2 {
        return Err(ConfigurationError::TooFewObservations(n).into());
    }

    let centered: Vec<Vec<f64>> = rows
        .iter()
        .map(|row| {
            let (mean, _) = mean_and_variance(row);
            row.iter().map(|x| x - mean).collect()
        })
        .collect();
    let norms: Vec<f64> = centered
        .iter()
        .map(|c| c.iter().map(|x| x * x).sum::<f64>().sqrt())
        .collect();
    if norms.iter().any(|&s| s <= 0.0 || !s.is_finite()) {
        return Err(NumericalError::ZeroVariance.into());
    }

    let mut data = vec![0.0; dim * dim];
    for i in 0..dim {
        data[i * dim + i] = 1.0;
        for j in 0..i {
            let dot: f64 = centered[i]
                .iter()
                .zip(&centered[j])
                .map(|(a, b)| a * b)
                .sum();
            let r = (dot / (norms[i] * norms[j])).clamp(-1.0, 1.0);
            data[i * dim + j] = r;
            data[j * dim + i] = r;
        }
    }
    Ok(CorrelationMatrix::new(dim, data)?)
}
