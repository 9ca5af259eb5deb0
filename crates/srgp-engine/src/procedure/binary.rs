//! Fixed-level baselines: no correction and static Bonferroni.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{MechanismKind, MtpConfig};
use crate::error::Result;
use crate::procedure::{DecisionLog, MultipleTestingProcedure, Verdict};
use crate::stats::{LossComparison, upper_critical_value};

/// Accept iff the one-sided upper confidence bound on the mean loss
/// difference at `level` is below zero.
fn fixed_level_decision(candidate: &[f64], baseline: &[f64], level: f64) -> Result<(Verdict, f64)> {
    let cmp = LossComparison::new(candidate, baseline)?;
    cmp.z_statistic()?;
    let upper = cmp.upper_confidence_bound(level);
    let verdict = Verdict::from_accepted(upper < 0.0);
    debug!(mean = cmp.mean, std_err = cmp.std_err, level, upper, ?verdict, "fixed-level test");
    Ok((verdict, upper_critical_value(level)))
}

/// Tests every candidate at the full `global_alpha`.
///
/// Upper bound on power; does not control the family-wise error rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryThreshold {
    config: MtpConfig,
    log: DecisionLog,
}

impl BinaryThreshold {
    pub fn new(config: MtpConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            log: DecisionLog::default(),
        })
    }
}

impl MultipleTestingProcedure for BinaryThreshold {
    fn name(&self) -> &'static str {
        MechanismKind::BinaryThreshold.name()
    }

    fn initialize(&mut self, num_total_queries: usize) -> Result<()> {
        self.log.reset(num_total_queries)
    }

    fn decide(
        &mut self,
        candidate: &[f64],
        baseline: &[f64],
        _prespecified: Option<&[f64]>,
    ) -> Result<Verdict> {
        self.log.ensure_open()?;
        let (verdict, threshold) =
            fixed_level_decision(candidate, baseline, self.config.global_alpha)?;
        self.log.push(verdict, threshold);
        Ok(verdict)
    }

    fn outcomes(&self) -> &[Verdict] {
        self.log.outcomes()
    }

    fn thresholds(&self) -> &[f64] {
        self.log.thresholds()
    }
}

/// Tests every candidate at `global_alpha / 2^Q`, fixed when the run is planned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bonferroni {
    config: MtpConfig,
    level: Option<f64>,
    log: DecisionLog,
}

impl Bonferroni {
    pub fn new(config: MtpConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            level: None,
            log: DecisionLog::default(),
        })
    }

    /// Per-test level, once initialized.
    #[must_use]
    pub fn level(&self) -> Option<f64> {
        self.level
    }
}

impl MultipleTestingProcedure for Bonferroni {
    fn name(&self) -> &'static str {
        MechanismKind::Bonferroni.name()
    }

    fn initialize(&mut self, num_total_queries: usize) -> Result<()> {
        self.log.reset(num_total_queries)?;
        let exponent = i32::try_from(num_total_queries).unwrap_or(i32::MAX);
        let level = self.config.global_alpha / 2f64.powi(exponent);
        self.level = Some(level);
        info!(num_total_queries, level, "bonferroni level fixed");
        Ok(())
    }

    fn decide(
        &mut self,
        candidate: &[f64],
        baseline: &[f64],
        _prespecified: Option<&[f64]>,
    ) -> Result<Verdict> {
        self.log.ensure_open()?;
        let level = self.level.unwrap_or(0.0);
        let (verdict, threshold) = fixed_level_decision(candidate, baseline, level)?;
        self.log.push(verdict, threshold);
        Ok(verdict)
    }

    fn outcomes(&self) -> &[Verdict] {
        self.log.outcomes()
    }

    fn thresholds(&self) -> &[f64] {
        self.log.thresholds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MtpError, NumericalError};

    /// Differences with exactly the requested mean and population sd.
    fn diffs_with(mean: f64, sd: f64, n: usize) -> (Vec<f64>, Vec<f64>) {
        let candidate = (0..n)
            .map(|i| mean + if i % 2 == 0 { sd } else { -sd })
            .collect();
        (candidate, vec![0.0; n])
    }

    #[test]
    fn binary_accepts_clear_improvement() {
        let mut p = BinaryThreshold::new(MtpConfig::default()).unwrap();
        p.initialize(3).unwrap();
        let (c, b) = diffs_with(-0.5, 1.0, 100);
        assert_eq!(p.decide(&c, &b, None).unwrap(), Verdict::Accept);
        let (c, b) = diffs_with(0.1, 1.0, 100);
        assert_eq!(p.decide(&c, &b, None).unwrap(), Verdict::Reject);
        assert_eq!(p.outcomes(), &[Verdict::Accept, Verdict::Reject]);
        assert!((p.thresholds()[0] - upper_critical_value(0.1)).abs() < 1e-12);
    }

    #[test]
    fn bonferroni_level_is_alpha_over_two_to_q() {
        let mut p = Bonferroni::new(MtpConfig::default()).unwrap();
        p.initialize(3).unwrap();
        assert!((p.level().unwrap() - 0.0125).abs() < 1e-15);
    }

    #[test]
    fn bonferroni_rejects_what_binary_accepts() {
        // z = 2.0 sits between Φ⁻¹(0.9) ≈ 1.28 and Φ⁻¹(1 - 0.0125) ≈ 2.24.
        let (c, b) = diffs_with(-0.2, 1.0, 100);
        let mut binary = BinaryThreshold::new(MtpConfig::default()).unwrap();
        binary.initialize(3).unwrap();
        let mut bonf = Bonferroni::new(MtpConfig::default()).unwrap();
        bonf.initialize(3).unwrap();
        for _ in 0..3 {
            assert_eq!(binary.decide(&c, &b, None).unwrap(), Verdict::Accept);
            assert_eq!(bonf.decide(&c, &b, None).unwrap(), Verdict::Reject);
        }
        for t in bonf.thresholds() {
            assert!((t - upper_critical_value(0.0125)).abs() < 1e-12);
        }
    }

    #[test]
    fn zero_variance_is_surfaced() {
        let mut p = BinaryThreshold::new(MtpConfig::default()).unwrap();
        p.initialize(1).unwrap();
        let err = p.decide(&[0.1; 10], &[0.2; 10], None).unwrap_err();
        assert_eq!(err, MtpError::Numerical(NumericalError::ZeroVariance));
        assert_eq!(p.query_count(), 0);
    }
}
