//! Always-advancing prespecified chain used by the parallel procedure.
//!
//! The chain is laid out in full at initialization: node 0 holds
//! `first_weight * ratio`, nodes `1..Q` share `(1 - first_weight) * ratio`
//! evenly with the last node absorbing rounding slack. One node is consumed
//! per call regardless of outcome. When a node passes, its weight is moved
//! forward with [`PrespecifiedChain::transfer_budget`] instead of being
//! re-split.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{ConfigurationError, MtpError, Result};
use crate::node::{AlphaNode, NodeId, Step};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrespecifiedChain {
    global_alpha: f64,
    ratio: f64,
    first_weight: f64,
    num_total_queries: Option<usize>,
    nodes: Vec<AlphaNode>,
    active: Option<NodeId>,
}

impl PrespecifiedChain {
    pub fn new(global_alpha: f64, ratio: f64, first_weight: f64) -> Result<Self> {
        if !(global_alpha > 0.0 && global_alpha < 1.0) {
            return Err(ConfigurationError::AlphaOutOfRange(global_alpha).into());
        }
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigurationError::ParallelRatioOutOfRange(ratio).into());
        }
        if !(0.0..=1.0).contains(&first_weight) {
            return Err(ConfigurationError::FirstPrespecifiedWeightOutOfRange(first_weight).into());
        }
        Ok(Self {
            global_alpha,
            ratio,
            first_weight,
            num_total_queries: None,
            nodes: Vec::new(),
            active: None,
        })
    }

    pub fn initialize(&mut self, num_total_queries: usize) -> Result<()> {
        if num_total_queries == 0 {
            return Err(ConfigurationError::ZeroQueries.into());
        }
        self.nodes.clear();
        self.num_total_queries = Some(num_total_queries);
        for (i, weight) in self.planned_weights(num_total_queries).into_iter().enumerate() {
            let parent = i.checked_sub(1).map(NodeId);
            let history = vec![Step::Unknown; i];
            self.nodes.push(AlphaNode::new(weight, 1.0, parent, i, history));
        }
        for i in 1..num_total_queries {
            self.nodes[i - 1].children.push(NodeId(i));
        }
        self.active = Some(NodeId(0));
        trace!(num_total_queries, ratio = self.ratio, "prespecified chain initialized");
        Ok(())
    }

    fn planned_weights(&self, count: usize) -> Vec<f64> {
        if count == 1 {
            return vec![self.ratio];
        }
        let head = self.first_weight * self.ratio;
        let each = (1.0 - self.first_weight) * self.ratio / (count - 1) as f64;
        let mut weights = Vec::with_capacity(count);
        weights.push(head);
        weights.extend(std::iter::repeat_n(each, count - 2));
        let assigned: f64 = weights.iter().sum();
        weights.push(self.ratio - assigned);
        weights
    }

    fn planned_queries(&self) -> Result<usize> {
        self.num_total_queries
            .ok_or(MtpError::Configuration(ConfigurationError::NotInitialized))
    }

    pub fn active_id(&self) -> Result<NodeId> {
        let num_total_queries = self.planned_queries()?;
        self.active
            .ok_or(MtpError::BudgetExhausted { num_total_queries })
    }

    pub fn active_node(&self) -> Result<&AlphaNode> {
        Ok(&self.nodes[self.active_id()?.index()])
    }

    pub fn current_local_alpha(&self) -> Result<f64> {
        Ok(self.active_node()?.local_alpha(self.global_alpha))
    }

    pub fn record_test(&mut self, observations: Vec<f64>, threshold: f64) -> Result<()> {
        let id = self.active_id()?;
        let node = &mut self.nodes[id.index()];
        node.observations = Some(observations);
        node.threshold = Some(threshold);
        Ok(())
    }

    /// Consume the active node; on success its weight is earned by the next one.
    pub fn record_outcome(&mut self, accepted: bool) -> Result<()> {
        let id = self.active_id()?;
        self.nodes[id.index()].outcome = Some(Step::from_accepted(accepted));
        let next = self.nodes[id.index()].children.first().copied();
        if let (true, Some(next)) = (accepted, next) {
            self.transfer_budget(id, next)?;
        }
        self.active = next;
        Ok(())
    }

    /// Add the full weight of `from` to the untested node `to`; returns the amount.
    ///
    /// `from` keeps its recorded weight as history. Only a tested, passing
    /// node may give its budget away, and only to a node that is still ahead.
    pub fn transfer_budget(&mut self, from: NodeId, to: NodeId) -> Result<f64> {
        let valid = to > from
            && to.index() < self.nodes.len()
            && self.nodes[from.index()].accepted()
            && !self.nodes[to.index()].is_tested();
        if !valid {
            return Err(ConfigurationError::InvalidTransfer {
                from: from.index(),
                to: to.index(),
            }
            .into());
        }
        let amount = self.nodes[from.index()].weight;
        let dest = &mut self.nodes[to.index()];
        dest.weight += amount;
        dest.earned += amount;
        trace!(from = from.index(), to = to.index(), amount, "budget earned");
        Ok(amount)
    }

    /// Chain nodes before `id` that were tested and not approved.
    #[must_use]
    pub fn failed_before(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes[..id.index().min(self.nodes.len())]
            .iter()
            .enumerate()
            .filter(|(_, n)| n.outcome == Some(Step::Failure))
            .map(|(i, _)| NodeId(i))
            .collect()
    }

    /// Every tested, non-approved node so far.
    #[must_use]
    pub fn failed_nodes(&self) -> Vec<NodeId> {
        self.failed_before(NodeId(self.nodes.len()))
    }

    /// Outcomes of the tested nodes, in order.
    #[must_use]
    pub fn outcomes(&self) -> Vec<Step> {
        self.nodes.iter().filter_map(|n| n.outcome).collect()
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &AlphaNode {
        &self.nodes[id.index()]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &AlphaNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    #[must_use]
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.num_total_queries.is_some() && self.active.is_none()
    }
}
