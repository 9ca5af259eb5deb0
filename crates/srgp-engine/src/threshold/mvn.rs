//! Conditional multivariate-normal upper quantile.
//!
//! Let `Z ~ N(0, R)` with the statistic under test in the last coordinate
//! and `k` prior statistics before it. We want `t` with
//!
//! ```text
//! P(Z_k > t | Z_i <= c_i for all i < k) = alpha.
//! ```
//!
//! Write `Z = L y` with `L` the lower Cholesky factor of `R` and `y` i.i.d.
//! standard normal. Genz's separation of variables turns the conditioning
//! event into a product of one-dimensional factors: for a point `w` in the
//! unit cube,
//!
//! ```text
//! e_i = Φ((c_i - Σ_{j<i} L_ij y_j) / L_ii),   y_i = Φ⁻¹(w_i e_i),
//! ```
//!
//! and `Π e_i` is an unbiased weight for the event. Given the prior `y`,
//! the current statistic is exactly normal with mean `Σ_{j<k} L_kj y_j` and
//! standard deviation `L_kk`, so the conditional tail is a weighted mixture
//! of normal tails and the root in `t` is found without re-sampling.
//!
//! When `L_kk` vanishes the current statistic is a linear function of the
//! priors (a resubmitted or rescaled candidate). The mixture components are
//! then point masses and the critical value is their weighted upper
//! quantile.
//!
//! Points come from a randomly shifted Richtmyer lattice
//! `w_i(s) = frac(s * sqrt(p_i) + shift_i)`; the shift is drawn from a
//! ChaCha stream seeded by the caller, so a solve is a pure function of its
//! inputs and seed.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::error::NumericalError;
use crate::stats::{
    CorrelationMatrix, normal_cdf, normal_pdf, normal_quantile, normal_sf, upper_critical_value,
};

/// Pivot below which a Cholesky column is treated as exactly degenerate.
const PIVOT_EPS: f64 = 1e-12;
/// Negative pivots down to this size are rounding noise, not indefiniteness.
const PSD_TOL: f64 = 1e-10;
/// Conditional standard deviation below which components are point masses.
const SIGMA_EPS: f64 = 1e-10;
/// Smallest conditioning probability the estimate is trusted for.
const MIN_EVENT_PROB: f64 = 1e-12;

const MAX_ITERATIONS: usize = 200;
const T_TOL: f64 = 1e-10;

/// Lower Cholesky factor, row-major, allowing exactly singular (PSD) input.
pub fn cholesky(corr: &CorrelationMatrix) -> Result<Vec<f64>, NumericalError> {
    let n = corr.dim();
    let mut l = vec![0.0; n * n];
    for i in 0..n {
        let mut pivot = corr.get(i, i);
        for k in 0..i {
            pivot -= l[i * n + k] * l[i * n + k];
        }
        if pivot < -PSD_TOL {
            return Err(NumericalError::NotPositiveSemiDefinite { row: i, pivot });
        }
        if pivot <= PIVOT_EPS {
            // Column i is a combination of earlier ones; the remaining
            // residuals in it must vanish too.
            for j in i + 1..n {
                let mut residual = corr.get(j, i);
                for k in 0..i {
                    residual -= l[j * n + k] * l[i * n + k];
                }
                if residual.abs() > 1e-8 {
                    return Err(NumericalError::NotPositiveSemiDefinite { row: i, pivot });
                }
            }
            continue;
        }
        let d = pivot.sqrt();
        l[i * n + i] = d;
        for j in i + 1..n {
            let mut v = corr.get(j, i);
            for k in 0..i {
                v -= l[j * n + k] * l[i * n + k];
            }
            l[j * n + i] = v / d;
        }
    }
    Ok(l)
}

fn first_primes(count: usize) -> Vec<u64> {
    let mut primes = Vec::with_capacity(count);
    let mut candidate = 2u64;
    while primes.len() < count {
        if primes
            .iter()
            .take_while(|p| *p * *p <= candidate)
            .all(|p| candidate % p != 0)
        {
            primes.push(candidate);
        }
        candidate += 1;
    }
    primes
}

/// Normal mixture describing the current statistic given the conditioning event.
#[derive(Debug, Clone)]
pub(crate) struct ConditionalMixture {
    weights: Vec<f64>,
    means: Vec<f64>,
    /// Zero when the current statistic is determined by the priors.
    sigma: f64,
    total: f64,
}

impl ConditionalMixture {
    pub(crate) fn build(
        corr: &CorrelationMatrix,
        prior_thresholds: &[f64],
        samples: usize,
        seed: u64,
    ) -> Result<Self, NumericalError> {
        let k = prior_thresholds.len();
        let n = corr.dim();
        if n != k + 1 {
            return Err(NumericalError::MalformedCorrelation(format!(
                "{n}x{n} matrix for {k} prior statistics"
            )));
        }
        let l = cholesky(corr)?;
        let sigma = if l[k * n + k] < SIGMA_EPS {
            0.0
        } else {
            l[k * n + k]
        };

        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let shifts: Vec<f64> = (0..k).map(|_| rng.gen_range(0.0..1.0)).collect();
        let generators: Vec<f64> = first_primes(k).iter().map(|p| (*p as f64).sqrt()).collect();

        let mut weights = Vec::with_capacity(samples);
        let mut means = Vec::with_capacity(samples);
        let mut y = vec![0.0; k];
        for s in 1..=samples {
            let mut weight = 1.0;
            for i in 0..k {
                let partial: f64 = (0..i).map(|j| l[i * n + j] * y[j]).sum();
                let diag = l[i * n + i];
                if diag > 0.0 {
                    let e = normal_cdf((prior_thresholds[i] - partial) / diag);
                    weight *= e;
                    if weight == 0.0 {
                        break;
                    }
                    let w = (s as f64 * generators[i] + shifts[i]).fract();
                    y[i] = normal_quantile((w * e).max(f64::MIN_POSITIVE));
                } else {
                    if partial > prior_thresholds[i] {
                        weight = 0.0;
                        break;
                    }
                    y[i] = 0.0;
                }
            }
            if weight > 0.0 {
                let mean: f64 = (0..k).map(|j| l[k * n + j] * y[j]).sum();
                weights.push(weight);
                means.push(mean);
            }
        }

        let total: f64 = weights.iter().sum();
        let probability = total / samples as f64;
        if probability < MIN_EVENT_PROB {
            return Err(NumericalError::NegligibleConditioningEvent { probability });
        }
        Ok(Self {
            weights,
            means,
            sigma,
            total,
        })
    }

    /// Estimated `P(current > t | event)`.
    pub(crate) fn tail(&self, t: f64) -> f64 {
        self.weights
            .iter()
            .zip(&self.means)
            .map(|(w, m)| {
                if self.sigma > 0.0 {
                    w * normal_sf((t - m) / self.sigma)
                } else if *m > t {
                    *w
                } else {
                    0.0
                }
            })
            .sum::<f64>()
            / self.total
    }

    /// Smallest atom `t` with `P(current > t) <= alpha` for a point-mass mixture.
    fn atomic_upper_quantile(&self, alpha: f64) -> f64 {
        let mut atoms: Vec<(f64, f64)> = self
            .means
            .iter()
            .copied()
            .zip(self.weights.iter().copied())
            .collect();
        atoms.sort_by(|a, b| b.0.total_cmp(&a.0));
        let budget = alpha * self.total;
        let mut above = 0.0;
        for (mean, weight) in &atoms {
            if above + weight > budget {
                return *mean;
            }
            above += weight;
        }
        atoms.last().map_or(f64::NEG_INFINITY, |(mean, _)| *mean)
    }

    fn tail_derivative(&self, t: f64) -> f64 {
        -self
            .weights
            .iter()
            .zip(&self.means)
            .map(|(w, m)| w * normal_pdf((t - m) / self.sigma))
            .sum::<f64>()
            / (self.sigma * self.total)
    }

    /// Solve `tail(t) = alpha` by safeguarded Newton steps inside a bracket.
    pub(crate) fn upper_quantile(&self, alpha: f64) -> Result<f64, NumericalError> {
        if self.sigma == 0.0 {
            return Ok(self.atomic_upper_quantile(alpha));
        }
        let z = upper_critical_value(alpha);
        let (min_mean, max_mean) = self
            .means
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), m| {
                (lo.min(*m), hi.max(*m))
            });
        // Each component tail is >= alpha at lo and <= alpha at hi.
        let mut lo = min_mean + self.sigma * z;
        let mut hi = max_mean + self.sigma * z;
        if hi - lo <= T_TOL {
            return Ok(0.5 * (lo + hi));
        }

        let mut t = 0.5 * (lo + hi);
        for _ in 0..MAX_ITERATIONS {
            let f = self.tail(t) - alpha;
            if f.abs() <= alpha * 1e-12 {
                return Ok(t);
            }
            if f > 0.0 {
                lo = t;
            } else {
                hi = t;
            }
            if hi - lo <= T_TOL {
                return Ok(0.5 * (lo + hi));
            }
            let slope = self.tail_derivative(t);
            let newton = t - f / slope;
            t = if slope < 0.0 && newton > lo && newton < hi {
                newton
            } else {
                0.5 * (lo + hi)
            };
        }
        Err(NumericalError::NonConvergence {
            iterations: MAX_ITERATIONS,
        })
    }

    /// Estimated probability of the conditioning event.
    pub(crate) fn event_probability(&self, samples: usize) -> f64 {
        self.total / samples as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corr2(rho: f64) -> CorrelationMatrix {
        CorrelationMatrix::new(2, vec![1.0, rho, rho, 1.0]).unwrap()
    }

    #[test]
    fn cholesky_reconstructs_matrix() {
        let corr = CorrelationMatrix::new(
            3,
            vec![1.0, 0.5, 0.2, 0.5, 1.0, 0.3, 0.2, 0.3, 1.0],
        )
        .unwrap();
        let l = cholesky(&corr).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let v: f64 = (0..3).map(|k| l[i * 3 + k] * l[j * 3 + k]).sum();
                assert!((v - corr.get(i, j)).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn cholesky_rejects_indefinite() {
        let corr = CorrelationMatrix::new(
            3,
            vec![1.0, 0.9, -0.9, 0.9, 1.0, 0.9, -0.9, 0.9, 1.0],
        )
        .unwrap();
        assert!(matches!(
            cholesky(&corr),
            Err(NumericalError::NotPositiveSemiDefinite { .. })
        ));
    }

    #[test]
    fn cholesky_accepts_singular_psd() {
        let l = cholesky(&corr2(1.0)).unwrap();
        assert_eq!(l[3], 0.0);
    }

    #[test]
    fn perfectly_correlated_current_matches_closed_form() {
        // With rho = 1 the current statistic equals the prior, so
        // P(Z > t | Z <= c) = alpha at Φ(t) = Φ(c)(1 - alpha).
        let (c, alpha) = (1.0, 0.05);
        let mix = ConditionalMixture::build(&corr2(1.0), &[c], 8192, 2).unwrap();
        let t = mix.upper_quantile(alpha).unwrap();
        let exact = normal_quantile(normal_cdf(c) * (1.0 - alpha));
        assert!(t < c);
        assert!((t - exact).abs() < 5e-3, "{t} vs {exact}");
        assert!(mix.tail(t) <= alpha);
    }

    #[test]
    fn perfectly_anticorrelated_current_is_solvable() {
        // Z = -Z0 given Z0 <= c, so P(Z > t) = Φ(-t) / Φ(c) once -t < c.
        let (c, alpha) = (0.5, 0.05);
        let mix = ConditionalMixture::build(&corr2(-1.0), &[c], 8192, 5).unwrap();
        let t = mix.upper_quantile(alpha).unwrap();
        let exact = -normal_quantile(alpha * normal_cdf(c));
        assert!((t - exact).abs() < 1e-2, "{t} vs {exact}");
    }

    #[test]
    fn independent_prior_leaves_quantile_unchanged() {
        let mix = ConditionalMixture::build(&corr2(0.0), &[0.5], 256, 3).unwrap();
        let t = mix.upper_quantile(0.05).unwrap();
        assert!((t - upper_critical_value(0.05)).abs() < 1e-8);
    }

    #[test]
    fn positive_correlation_with_failed_prior_lowers_threshold() {
        // Knowing a positively correlated prior stayed low makes the current
        // statistic less likely to be large, so the critical value shrinks.
        let mix = ConditionalMixture::build(&corr2(0.6), &[1.28], 2048, 1).unwrap();
        let t = mix.upper_quantile(0.05).unwrap();
        assert!(t < upper_critical_value(0.05));
        assert!((mix.tail(t) - 0.05).abs() < 1e-9);
    }

    #[test]
    fn tail_matches_bivariate_closed_form_at_zero_threshold() {
        // For rho = 0.5 and c = 0: P(Z1 > 0, Z0 <= 0) = 1/4 - asin(0.5)/(2π) = 1/6,
        // and P(Z0 <= 0) = 1/2, so the conditional tail at t = 0 is 1/3.
        let mix = ConditionalMixture::build(&corr2(0.5), &[0.0], 4096, 7).unwrap();
        assert!((mix.tail(0.0) - 1.0 / 3.0).abs() < 5e-3);
        assert!((mix.event_probability(4096) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn deterministic_for_fixed_seed() {
        let corr = CorrelationMatrix::new(
            3,
            vec![1.0, 0.4, 0.3, 0.4, 1.0, 0.5, 0.3, 0.5, 1.0],
        )
        .unwrap();
        let a = ConditionalMixture::build(&corr, &[1.0, 1.5], 512, 9)
            .unwrap()
            .upper_quantile(0.01)
            .unwrap();
        let b = ConditionalMixture::build(&corr, &[1.0, 1.5], 512, 9)
            .unwrap()
            .upper_quantile(0.01)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn negligible_event_is_reported() {
        let err = ConditionalMixture::build(&corr2(0.3), &[-40.0], 64, 0).unwrap_err();
        assert!(matches!(err, NumericalError::NegligibleConditioningEvent { .. }));
    }

    #[test]
    fn primes_are_primes() {
        assert_eq!(first_primes(6), vec![2, 3, 5, 7, 11, 13]);
    }
}
