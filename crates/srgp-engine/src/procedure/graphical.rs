//! Spending-tree procedures.
//!
//! Both variants walk a [`BudgetTree`]: the active node's weight times the
//! global alpha is the level for the current test. [`GraphicalBonf`] treats
//! tests as independent. [`GraphicalFfs`] instead solves for the critical
//! value conditional on the failed sibling tests under the same parent,
//! using the empirical correlation of their loss differences.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::budget_tree::BudgetTree;
use crate::config::{MechanismKind, MtpConfig};
use crate::error::Result;
use crate::node::{AlphaNode, NodeId};
use crate::procedure::{DecisionLog, MultipleTestingProcedure, Verdict};
use crate::stats::{LossComparison, correlation_matrix, upper_critical_value};
use crate::threshold::ThresholdSolver;

/// Tree walk with independence assumed between tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphicalBonf {
    tree: BudgetTree,
    log: DecisionLog,
}

impl GraphicalBonf {
    pub fn new(config: MtpConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            tree: BudgetTree::new(config.global_alpha, config.success_fraction)?,
            log: DecisionLog::default(),
        })
    }

    #[must_use]
    pub fn tree(&self) -> &BudgetTree {
        &self.tree
    }
}

impl MultipleTestingProcedure for GraphicalBonf {
    fn name(&self) -> &'static str {
        MechanismKind::GraphicalBonf.name()
    }

    fn initialize(&mut self, num_total_queries: usize) -> Result<()> {
        self.tree.initialize(num_total_queries)?;
        self.log.reset(num_total_queries)?;
        info!(
            mechanism = self.name(),
            num_total_queries,
            first_local_alpha = self.tree.current_local_alpha()?,
            "procedure initialized"
        );
        Ok(())
    }

    fn decide(
        &mut self,
        candidate: &[f64],
        baseline: &[f64],
        _prespecified: Option<&[f64]>,
    ) -> Result<Verdict> {
        self.log.ensure_open()?;
        let local_alpha = self.tree.current_local_alpha()?;
        let cmp = LossComparison::new(candidate, baseline)?;
        cmp.z_statistic()?;
        let upper = cmp.upper_confidence_bound(local_alpha);
        let verdict = Verdict::from_accepted(upper < 0.0);
        let threshold = upper_critical_value(local_alpha);
        debug!(
            query = self.log.outcomes().len(),
            local_alpha,
            upper,
            ?verdict,
            "graphical bonferroni test"
        );

        self.tree.record_test(cmp.diffs, threshold)?;
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
}

/// Tree walk with correlation-aware critical values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphicalFfs {
    tree: BudgetTree,
    solver: ThresholdSolver,
    log: DecisionLog,
}

impl GraphicalFfs {
    pub fn new(config: MtpConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            tree: BudgetTree::new(config.global_alpha, config.success_fraction)?,
            solver: ThresholdSolver::from_config(&config)?,
            log: DecisionLog::default(),
        })
    }

    #[must_use]
    pub fn tree(&self) -> &BudgetTree {
        &self.tree
    }
}

/// Retained observations and thresholds of the given tested nodes, in order.
pub(crate) fn prior_tests<'a>(
    nodes: impl IntoIterator<Item = &'a AlphaNode>,
) -> (Vec<&'a [f64]>, Vec<f64>) {
    nodes
        .into_iter()
        .filter_map(|node| Some((node.observations.as_deref()?, node.threshold?)))
        .unzip()
}

/// Critical value for `current` given the prior tests, then the verdict.
pub(crate) fn conditional_decision(
    solver: &mut ThresholdSolver,
    prior_obs: &[&[f64]],
    prior_thresholds: &[f64],
    current: &LossComparison,
    local_alpha: f64,
) -> Result<(Verdict, f64)> {
    let z = current.z_statistic()?;
    let mut rows: Vec<&[f64]> = prior_obs.to_vec();
    rows.push(&current.diffs);
    let corr = correlation_matrix(&rows)?;
    let threshold = solver.solve_robust(&corr, prior_thresholds, local_alpha)?;
    Ok((Verdict::from_accepted(z > threshold), threshold))
}

impl MultipleTestingProcedure for GraphicalFfs {
    fn name(&self) -> &'static str {
        MechanismKind::GraphicalFfs.name()
    }

    fn initialize(&mut self, num_total_queries: usize) -> Result<()> {
        self.tree.initialize(num_total_queries)?;
        self.log.reset(num_total_queries)?;
        info!(
            mechanism = self.name(),
            num_total_queries,
            first_local_alpha = self.tree.current_local_alpha()?,
            robustness_tries = self.solver.robustness_tries(),
            "procedure initialized"
        );
        Ok(())
    }

    fn decide(
        &mut self,
        candidate: &[f64],
        baseline: &[f64],
        _prespecified: Option<&[f64]>,
    ) -> Result<Verdict> {
        self.log.ensure_open()?;
        let active = self.tree.active_id()?;
        let local_alpha = self.tree.current_local_alpha()?;
        let cmp = LossComparison::new(candidate, baseline)?;

        let priors: Vec<NodeId> = self.tree.prior_siblings(active);
        let (prior_obs, prior_thresholds) =
            prior_tests(priors.iter().map(|id| self.tree.node(*id)));
        let (verdict, threshold) = conditional_decision(
            &mut self.solver,
            &prior_obs,
            &prior_thresholds,
            &cmp,
            local_alpha,
        )?;
        debug!(
            query = self.log.outcomes().len(),
            priors = prior_thresholds.len(),
            local_alpha,
            threshold,
            ?verdict,
            "graphical ffs test"
        );

        self.tree.record_test(cmp.diffs, threshold)?;
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
}
