//! Correlation-aware critical values.
//!
//! [`ThresholdSolver::solve`] returns the `t` for which the statistic under
//! test exceeds `t` with probability `local_alpha`, conditional on every
//! prior statistic having stayed at or below the threshold it was tested
//! against, with all hypotheses null and jointly normal.
//!
//! [`ThresholdSolver::solve_robust`] additionally guards against unknown
//! non-null priors: it re-solves with random subsets of the priors removed
//! and keeps the most stringent (largest) critical value seen. The number
//! of subsets is a heuristic knob (`robustness_tries`), not a worst-case
//! bound.

pub mod mvn;

use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::MtpConfig;
use crate::error::{ConfigurationError, NumericalError, Result};
use crate::stats::{CorrelationMatrix, upper_critical_value};

use self::mvn::ConditionalMixture;

/// Critical-value solver owned by one procedure run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSolver {
    samples: usize,
    seed: u64,
    robustness_tries: usize,
    rng: ChaCha20Rng,
    solves: u64,
}

impl ThresholdSolver {
    pub fn new(samples: usize, seed: u64, robustness_tries: usize) -> Result<Self> {
        if samples == 0 {
            return Err(ConfigurationError::ZeroSamples.into());
        }
        Ok(Self {
            samples,
            seed,
            robustness_tries,
            rng: ChaCha20Rng::seed_from_u64(seed),
            solves: 0,
        })
    }

    pub fn from_config(config: &MtpConfig) -> Result<Self> {
        Self::new(config.mvn_samples, config.seed, config.robustness_tries)
    }

    /// Critical value at `local_alpha` given prior statistics.
    ///
    /// `corr` orders the prior statistics first and the current one last;
    /// `prior_thresholds[i]` belongs to row `i`. Priors tested against `+∞`
    /// impose no condition and are dropped.
    pub fn solve(
        &self,
        corr: &CorrelationMatrix,
        prior_thresholds: &[f64],
        local_alpha: f64,
    ) -> Result<f64> {
        if local_alpha <= 0.0 {
            return Ok(f64::INFINITY);
        }
        if corr.dim() != prior_thresholds.len() + 1 {
            return Err(NumericalError::MalformedCorrelation(format!(
                "{}x{} matrix for {} prior statistics",
                corr.dim(),
                corr.dim(),
                prior_thresholds.len()
            ))
            .into());
        }
        if let Some(t) = prior_thresholds.iter().find(|t| t.is_nan()) {
            return Err(NumericalError::NonFiniteStatistic(*t).into());
        }

        let mut keep: Vec<usize> = (0..prior_thresholds.len())
            .filter(|&i| prior_thresholds[i] < f64::INFINITY)
            .collect();
        if keep.is_empty() {
            return Ok(upper_critical_value(local_alpha));
        }
        let thresholds: Vec<f64> = keep.iter().map(|&i| prior_thresholds[i]).collect();
        keep.push(prior_thresholds.len());
        let corr = if keep.len() == corr.dim() {
            corr.clone()
        } else {
            corr.select(&keep)
        };

        let mixture = ConditionalMixture::build(&corr, &thresholds, self.samples, self.seed)?;
        let t = mixture.upper_quantile(local_alpha)?;
        debug!(
            priors = thresholds.len(),
            local_alpha,
            threshold = t,
            event_probability = mixture.event_probability(self.samples),
            "conditional critical value"
        );
        Ok(t)
    }

    /// [`solve`](Self::solve), then the most stringent value over random non-null subsets.
    ///
    /// Needs at least two priors; subsets have size `1 ..= priors / 2` and
    /// are drawn without replacement from this solver's own RNG stream.
    pub fn solve_robust(
        &mut self,
        corr: &CorrelationMatrix,
        prior_thresholds: &[f64],
        local_alpha: f64,
    ) -> Result<f64> {
        self.solves += 1;
        let all_null = self.solve(corr, prior_thresholds, local_alpha)?;
        let k = prior_thresholds.len();
        if self.robustness_tries == 0 || k < 2 || !all_null.is_finite() {
            return Ok(all_null);
        }

        let mut best = all_null;
        for _ in 0..self.robustness_tries {
            let size = self.rng.gen_range(1..=k / 2);
            let mut non_null = index::sample(&mut self.rng, k, size).into_vec();
            non_null.sort_unstable();
            let mut rows: Vec<usize> = (0..k)
                .filter(|i| non_null.binary_search(i).is_err())
                .collect();
            let thresholds: Vec<f64> = rows.iter().map(|&i| prior_thresholds[i]).collect();
            rows.push(k);
            let t = self.solve(&corr.select(&rows), &thresholds, local_alpha)?;
            best = best.max(t);
        }
        if best > all_null {
            warn!(
                all_null,
                robust = best,
                tries = self.robustness_tries,
                "robustness sampling raised the critical value"
            );
        }
        Ok(best)
    }

    /// Number of `solve_robust` calls served.
    #[must_use]
    pub fn solves(&self) -> u64 {
        self.solves
    }

    #[must_use]
    pub fn robustness_tries(&self) -> usize {
        self.robustness_tries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solver(tries: usize) -> ThresholdSolver {
        ThresholdSolver::new(1024, 11, tries).unwrap()
    }

    fn equicorrelated(dim: usize, rho: f64) -> CorrelationMatrix {
        let mut data = vec![rho; dim * dim];
        for i in 0..dim {
            data[i * dim + i] = 1.0;
        }
        CorrelationMatrix::new(dim, data).unwrap()
    }

    #[test]
    fn base_case_is_normal_quantile() {
        let s = solver(0);
        let t = s
            .solve(&CorrelationMatrix::identity(1), &[], 0.05)
            .unwrap();
        assert!((t - 1.644_853_626_951_472_2).abs() < 1e-9);
    }

    #[test]
    fn base_case_strictly_decreasing_in_alpha() {
        let s = solver(0);
        let one = CorrelationMatrix::identity(1);
        let mut last = f64::INFINITY;
        for alpha in [1e-6, 1e-4, 0.001, 0.01, 0.05, 0.1, 0.3] {
            let t = s.solve(&one, &[], alpha).unwrap();
            assert!(t < last, "alpha={alpha}");
            last = t;
        }
    }

    #[test]
    fn zero_alpha_never_accepts() {
        let s = solver(0);
        assert_eq!(
            s.solve(&CorrelationMatrix::identity(1), &[], 0.0).unwrap(),
            f64::INFINITY
        );
    }

    #[test]
    fn infinite_prior_thresholds_are_ignored() {
        let s = solver(0);
        let t = s.solve(&equicorrelated(2, 0.7), &[f64::INFINITY], 0.02).unwrap();
        assert!((t - upper_critical_value(0.02)).abs() < 1e-12);
    }

    #[test]
    fn shape_mismatch_is_numerical_error() {
        let s = solver(0);
        let err = s.solve(&equicorrelated(3, 0.2), &[1.0], 0.05).unwrap_err();
        assert!(matches!(
            err,
            crate::error::MtpError::Numerical(NumericalError::MalformedCorrelation(_))
        ));
    }

    #[test]
    fn correlated_failed_priors_relax_threshold() {
        let s = solver(0);
        let base = upper_critical_value(0.01);
        let t = s
            .solve(&equicorrelated(4, 0.5), &[1.0, 1.2, 1.4], 0.01)
            .unwrap();
        assert!(t < base);
        assert!(t > base - 1.0);
    }

    #[test]
    fn robust_threshold_never_below_all_null() {
        let corr = equicorrelated(5, 0.4);
        let thresholds = [0.5, 0.8, 1.0, 1.2];
        let all_null = solver(0).solve(&corr, &thresholds, 0.01).unwrap();
        let mut robust = solver(6);
        let t = robust.solve_robust(&corr, &thresholds, 0.01).unwrap();
        assert!(t >= all_null);
        // Dropping failed, positively correlated priors removes downward
        // conditioning, so some sampled configuration is stricter.
        assert!(t > all_null);
        assert_eq!(robust.solves(), 1);
    }

    #[test]
    fn robustness_skipped_with_single_prior() {
        let corr = equicorrelated(2, 0.4);
        let mut a = solver(5);
        let b = solver(0);
        assert_eq!(
            a.solve_robust(&corr, &[1.5], 0.05).unwrap(),
            b.solve(&corr, &[1.5], 0.05).unwrap()
        );
    }

    #[test]
    fn zero_samples_rejected() {
        assert!(ThresholdSolver::new(0, 0, 0).is_err());
    }
}
