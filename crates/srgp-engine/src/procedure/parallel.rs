//! Prespecified chain running alongside an adaptive spending tree.
//!
//! The global alpha is split up front: `parallel_ratio` of it funds a
//! [`PrespecifiedChain`] that tests a developer-fixed sequence of updates,
//! the rest funds an adaptive [`BudgetTree`] with FFS mechanics. Each call
//! tests the prespecified candidate first, then the adaptive candidate, and
//! advances both structures by one step. A call that fails advances neither.
//!
//! The adaptive critical value conditions on its own failed siblings and on
//! every prespecified node that has been tested and not approved, including
//! the one tested in the same call. Approved prespecified nodes impose no
//! `Z <= t` condition and are left out. A passing prespecified node earns
//! its weight into the next chain node.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::budget_tree::BudgetTree;
use crate::config::{MechanismKind, MtpConfig};
use crate::error::{ConfigurationError, Result};
use crate::node::Step;
use crate::prespec_chain::PrespecifiedChain;
use crate::procedure::graphical::{conditional_decision, prior_tests};
use crate::procedure::{DecisionLog, MultipleTestingProcedure, Verdict};
use crate::stats::LossComparison;
use crate::threshold::ThresholdSolver;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphicalParallel {
    chain: PrespecifiedChain,
    tree: BudgetTree,
    solver: ThresholdSolver,
    log: DecisionLog,
    prespecified_log: DecisionLog,
}

impl GraphicalParallel {
    pub fn new(config: MtpConfig) -> Result<Self> {
        config.validate()?;
        let chain = PrespecifiedChain::new(
            config.global_alpha,
            config.parallel_ratio,
            config.first_prespecified_weight,
        )?;
        let tree = BudgetTree::new(config.global_alpha, config.success_fraction)?
            .with_root_weight(1.0 - config.parallel_ratio);
        Ok(Self {
            chain,
            tree,
            solver: ThresholdSolver::from_config(&config)?,
            log: DecisionLog::default(),
            prespecified_log: DecisionLog::default(),
        })
    }

    #[must_use]
    pub fn chain(&self) -> &PrespecifiedChain {
        &self.chain
    }

    #[must_use]
    pub fn tree(&self) -> &BudgetTree {
        &self.tree
    }

    /// Verdicts of the prespecified chain, one per call.
    #[must_use]
    pub fn prespecified_outcomes(&self) -> &[Verdict] {
        self.prespecified_log.outcomes()
    }

    #[must_use]
    pub fn prespecified_thresholds(&self) -> &[f64] {
        self.prespecified_log.thresholds()
    }

    /// Chain outcomes as recorded on its nodes.
    #[must_use]
    pub fn prespecified_steps(&self) -> Vec<Step> {
        self.chain.outcomes()
    }

    /// Verdict and critical value for the prespecified candidate, without recording it.
    fn stage_prespecified(
        &self,
        solver: &mut ThresholdSolver,
        cmp: &LossComparison,
    ) -> Result<(Verdict, f64)> {
        let active = self.chain.active_id()?;
        let local_alpha = self.chain.current_local_alpha()?;
        let priors = self.chain.failed_before(active);
        let (prior_obs, prior_thresholds) =
            prior_tests(priors.iter().map(|id| self.chain.node(*id)));
        let (verdict, threshold) =
            conditional_decision(solver, &prior_obs, &prior_thresholds, cmp, local_alpha)?;
        debug!(
            query = self.log.outcomes().len(),
            priors = prior_thresholds.len(),
            local_alpha,
            threshold,
            ?verdict,
            "prespecified test"
        );
        Ok((verdict, threshold))
    }

    /// Verdict and critical value for the adaptive candidate, given the
    /// staged prespecified result of the same call.
    fn stage_adaptive(
        &self,
        solver: &mut ThresholdSolver,
        cmp: &LossComparison,
        prespecified: (&LossComparison, Verdict, f64),
    ) -> Result<(Verdict, f64)> {
        let active = self.tree.active_id()?;
        let local_alpha = self.tree.current_local_alpha()?;
        let chain_priors = self.chain.failed_nodes();
        let own_priors = self.tree.prior_siblings(active);

        let (mut prior_obs, mut prior_thresholds) =
            prior_tests(chain_priors.iter().map(|id| self.chain.node(*id)));
        let (pre_cmp, pre_verdict, pre_threshold) = prespecified;
        if !pre_verdict.is_accept() {
            prior_obs.push(&pre_cmp.diffs);
            prior_thresholds.push(pre_threshold);
        }
        let (own_obs, own_thresholds) =
            prior_tests(own_priors.iter().map(|id| self.tree.node(*id)));
        prior_obs.extend(own_obs);
        prior_thresholds.extend(own_thresholds);

        let (verdict, threshold) =
            conditional_decision(solver, &prior_obs, &prior_thresholds, cmp, local_alpha)?;
        debug!(
            query = self.log.outcomes().len(),
            chain_priors = chain_priors.len() + usize::from(!pre_verdict.is_accept()),
            own_priors = own_priors.len(),
            local_alpha,
            threshold,
            ?verdict,
            "adaptive test"
        );
        Ok((verdict, threshold))
    }
}

impl MultipleTestingProcedure for GraphicalParallel {
    fn name(&self) -> &'static str {
        MechanismKind::GraphicalParallel.name()
    }

    fn initialize(&mut self, num_total_queries: usize) -> Result<()> {
        self.chain.initialize(num_total_queries)?;
        self.tree.initialize(num_total_queries)?;
        self.log.reset(num_total_queries)?;
        self.prespecified_log.reset(num_total_queries)?;
        info!(
            mechanism = self.name(),
            num_total_queries,
            ratio = self.chain.ratio(),
            first_prespecified_alpha = self.chain.current_local_alpha()?,
            first_adaptive_alpha = self.tree.current_local_alpha()?,
            "procedure initialized"
        );
        Ok(())
    }

    /// Returns the adaptive verdict; the prespecified one is kept in
    /// [`GraphicalParallel::prespecified_outcomes`].
    fn decide(
        &mut self,
        candidate: &[f64],
        baseline: &[f64],
        prespecified: Option<&[f64]>,
    ) -> Result<Verdict> {
        self.log.ensure_open()?;
        let prespecified = prespecified.ok_or(ConfigurationError::MissingPrespecified {
            mechanism: MechanismKind::GraphicalParallel.name(),
        })?;
        for losses in [candidate, prespecified] {
            if losses.len() != baseline.len() {
                return Err(ConfigurationError::LengthMismatch {
                    expected: baseline.len(),
                    actual: losses.len(),
                }
                .into());
            }
        }
        let prespecified = LossComparison::new(prespecified, baseline)?;
        let adaptive = LossComparison::new(candidate, baseline)?;

        // Both verdicts are computed before either structure changes; the
        // solver copy is committed only if both succeed.
        let mut solver = self.solver.clone();
        let (pre_verdict, pre_threshold) = self.stage_prespecified(&mut solver, &prespecified)?;
        let (verdict, threshold) = self.stage_adaptive(
            &mut solver,
            &adaptive,
            (&prespecified, pre_verdict, pre_threshold),
        )?;

        self.solver = solver;
        self.chain.record_test(prespecified.diffs, pre_threshold)?;
        self.chain.record_outcome(pre_verdict.is_accept())?;
        self.prespecified_log.push(pre_verdict, pre_threshold);
        self.tree.record_test(adaptive.diffs, threshold)?;
        self.tree.record_outcome(verdict.is_accept())?;
        self.log.push(verdict, threshold);
        Ok(verdict)
    }

    fn outcomes(&self) -> &[Verdict] {
        self.log.outcomes()
    }

    fn thresholds(&self) -> &[f64] {
        self.log.thresholds()
    }

    fn requires_prespecified(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MtpError;
    use crate::stats::upper_critical_value;

    fn wavy(mean: f64, salt: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| mean + ((i as f64 + 1.0) * salt).sin())
            .collect()
    }

    fn procedure(queries: usize) -> GraphicalParallel {
        let mut p = GraphicalParallel::new(MtpConfig::default()).unwrap();
        p.initialize(queries).unwrap();
        p
    }

    #[test]
    fn requires_prespecified_losses() {
        let mut p = procedure(2);
        let c = wavy(-0.2, 0.7, 60);
        let err = p.decide(&c, &vec![0.0; 60], None).unwrap_err();
        assert_eq!(
            err,
            MtpError::Configuration(ConfigurationError::MissingPrespecified {
                mechanism: "graphical_par"
            })
        );
        assert!(p.requires_prespecified());
    }

    #[test]
    fn initial_levels_split_alpha() {
        let p = procedure(4);
        assert!((p.chain().current_local_alpha().unwrap() - 0.045).abs() < 1e-12);
        assert!((p.tree().current_local_alpha().unwrap() - 0.008).abs() < 1e-12);
    }

    #[test]
    fn first_call_levels_match_unconditional_quantiles() {
        let mut p = procedure(3);
        let zeros = vec![0.0; 200];
        let pre = wavy(-0.3, 0.7, 200);
        let cand = wavy(-0.3, 1.9, 200);
        p.decide(&cand, &zeros, Some(&pre)).unwrap();
        assert_eq!(p.prespecified_outcomes(), &[Verdict::Accept]);
        // The prespecified node passed, so the adaptive test had no priors.
        assert!((p.prespecified_thresholds()[0] - upper_critical_value(0.045)).abs() < 1e-12);
        assert!((p.thresholds()[0] - upper_critical_value(0.008)).abs() < 1e-12);
    }

    #[test]
    fn passing_prespecified_node_earns_forward() {
        let mut p = procedure(3);
        let zeros = vec![0.0; 200];
        p.decide(&wavy(0.5, 1.9, 200), &zeros, Some(&wavy(-0.3, 0.7, 200)))
            .unwrap();
        let next = p.chain().active_node().unwrap();
        assert!((next.earned - 0.45).abs() < 1e-12);
        assert!((next.weight - (0.225 + 0.45)).abs() < 1e-12);
    }

    #[test]
    fn failed_prespecified_node_conditions_adaptive_test() {
        let mut p = procedure(3);
        let zeros = vec![0.0; 200];
        let base = wavy(0.0, 0.7, 200);
        let noise = wavy(0.0, 2.3, 200);
        let pre: Vec<f64> = base.iter().map(|x| x + 0.2).collect();
        let cand: Vec<f64> = base
            .iter()
            .zip(&noise)
            .map(|(x, y)| 0.9 * x + 0.3 * y - 0.01)
            .collect();
        p.decide(&cand, &zeros, Some(&pre)).unwrap();
        assert_eq!(p.prespecified_outcomes(), &[Verdict::Reject]);
        assert_eq!(p.prespecified_steps(), vec![Step::Failure]);
        assert!(p.thresholds()[0] < upper_critical_value(0.008));
    }

    #[test]
    fn length_checked_before_variance() {
        // The prespecified differences are constant, but the mismatched
        // candidate is reported first.
        let mut p = procedure(2);
        let err = p
            .decide(&[0.1, 0.2, 0.3], &[0.1, 0.2], Some(&[0.1, 0.2]))
            .unwrap_err();
        assert_eq!(
            err,
            MtpError::Configuration(ConfigurationError::LengthMismatch {
                expected: 2,
                actual: 3
            })
        );
    }

    #[test]
    fn adaptive_failure_leaves_both_structures_untouched() {
        let mut p = procedure(2);
        // Plan the adaptive tree for one query so the second call fails on
        // the adaptive side after the prespecified test has been solved.
        p.tree.initialize(1).unwrap();
        let zeros = vec![0.0; 120];
        p.decide(&wavy(0.2, 0.7, 120), &zeros, Some(&wavy(0.2, 1.3, 120)))
            .unwrap();

        let before = p.clone();
        let err = p
            .decide(&wavy(0.2, 1.1, 120), &zeros, Some(&wavy(0.2, 1.9, 120)))
            .unwrap_err();
        assert_eq!(
            err,
            MtpError::BudgetExhausted {
                num_total_queries: 1
            }
        );
        assert_eq!(p, before);
        assert_eq!(p.prespecified_outcomes().len(), 1);
        assert_eq!(p.prespecified_steps().len(), 1);
        assert_eq!(p.query_count(), 1);
    }

    #[test]
    fn both_structures_exhaust_together() {
        let mut p = procedure(2);
        let zeros = vec![0.0; 120];
        for k in 0..2 {
            let k = f64::from(k);
            p.decide(
                &wavy(0.2, 0.7 + 0.4 * k, 120),
                &zeros,
                Some(&wavy(0.2, 1.3 + 0.6 * k, 120)),
            )
            .unwrap();
        }
        assert!(p.chain().is_terminal());
        assert!(p.tree().is_terminal());
        let err = p
            .decide(&wavy(0.0, 3.1, 120), &zeros, Some(&wavy(0.0, 3.7, 120)))
            .unwrap_err();
        assert_eq!(
            err,
            MtpError::BudgetExhausted {
                num_total_queries: 2
            }
        );
    }
}
