//! Lazily materialized alpha-spending tree.
//!
//! Only the realized path is ever built. When the active node passes its
//! test, its weight is split geometrically over a fresh chain of
//! continuation children (one per remaining query) and the first child
//! becomes active. When it fails, the next pre-existing sibling becomes
//! active with the weight it was given when its parent was split.
//!
//! ## Invariants
//!
//! 1. The children of any node sum to that node's weight (the last child
//!    absorbs floating-point slack).
//! 2. Weights are never recomputed after a node is created.
//! 3. Exactly `num_total_queries` outcomes can be recorded; the tree is
//!    terminal afterwards.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{ConfigurationError, MtpError, Result};
use crate::node::{AlphaNode, NodeId, Step, geometric_split};

/// Arena-backed spending tree for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetTree {
    global_alpha: f64,
    success_fraction: f64,
    root_weight: f64,
    num_total_queries: Option<usize>,
    nodes: Vec<AlphaNode>,
    active: Option<NodeId>,
    query_count: usize,
}

impl BudgetTree {
    /// Uninitialized tree spending a root weight of 1.
    pub fn new(global_alpha: f64, success_fraction: f64) -> Result<Self> {
        if !(global_alpha > 0.0 && global_alpha < 1.0) {
            return Err(ConfigurationError::AlphaOutOfRange(global_alpha).into());
        }
        if !(0.0..=1.0).contains(&success_fraction) {
            return Err(ConfigurationError::SuccessFractionOutOfRange(success_fraction).into());
        }
        Ok(Self {
            global_alpha,
            success_fraction,
            root_weight: 1.0,
            num_total_queries: None,
            nodes: Vec::new(),
            active: None,
            query_count: 0,
        })
    }

    /// Spend only `root_weight` of the global alpha (parallel variant).
    #[must_use]
    pub fn with_root_weight(mut self, root_weight: f64) -> Self {
        self.root_weight = root_weight;
        self
    }

    /// Reset to a fresh root planned for `num_total_queries` tests.
    ///
    /// The root itself is never tested: it is split as if it had passed, so
    /// the first active node is its first child with weight
    /// `root_weight * success_fraction`.
    pub fn initialize(&mut self, num_total_queries: usize) -> Result<()> {
        if num_total_queries == 0 {
            return Err(ConfigurationError::ZeroQueries.into());
        }
        self.nodes.clear();
        self.query_count = 0;
        self.num_total_queries = Some(num_total_queries);
        self.nodes.push(AlphaNode::new(
            self.root_weight,
            self.success_fraction,
            None,
            0,
            Vec::new(),
        ));
        let root = NodeId(0);
        let children = self.split(root, 0, num_total_queries, Vec::new());
        self.active = children.first().copied();
        trace!(
            num_total_queries,
            root_weight = self.root_weight,
            "budget tree initialized"
        );
        Ok(())
    }

    /// Materialize `count` children of `parent`, the first tested at `first_query`.
    fn split(
        &mut self,
        parent: NodeId,
        first_query: usize,
        count: usize,
        prefix: Vec<Step>,
    ) -> Vec<NodeId> {
        let weight = self.nodes[parent.index()].weight;
        let ids: Vec<NodeId> = geometric_split(weight, self.success_fraction, count)
            .into_iter()
            .enumerate()
            .map(|(i, w)| {
                let mut history = prefix.clone();
                history.extend(std::iter::repeat_n(Step::Failure, i));
                let id = NodeId(self.nodes.len());
                self.nodes.push(AlphaNode::new(
                    w,
                    self.success_fraction,
                    Some(parent),
                    first_query + i,
                    history,
                ));
                id
            })
            .collect();
        self.nodes[parent.index()].children = ids.clone();
        ids
    }

    fn planned_queries(&self) -> Result<usize> {
        self.num_total_queries
            .ok_or(MtpError::Configuration(ConfigurationError::NotInitialized))
    }

    /// The node whose test is next, or `BudgetExhausted` once terminal.
    pub fn active_id(&self) -> Result<NodeId> {
        let num_total_queries = self.planned_queries()?;
        self.active
            .ok_or(MtpError::BudgetExhausted { num_total_queries })
    }

    pub fn active_node(&self) -> Result<&AlphaNode> {
        Ok(&self.nodes[self.active_id()?.index()])
    }

    /// `active.weight * global_alpha`.
    pub fn current_local_alpha(&self) -> Result<f64> {
        Ok(self.active_node()?.local_alpha(self.global_alpha))
    }

    /// Retain the active node's test inputs for later correlation lookups.
    pub fn record_test(&mut self, observations: Vec<f64>, threshold: f64) -> Result<()> {
        let id = self.active_id()?;
        let node = &mut self.nodes[id.index()];
        node.observations = Some(observations);
        node.threshold = Some(threshold);
        Ok(())
    }

    /// Apply the outcome of the active node's test and advance one edge.
    pub fn record_outcome(&mut self, accepted: bool) -> Result<()> {
        let num_total_queries = self.planned_queries()?;
        let id = self.active_id()?;
        let step = Step::from_accepted(accepted);
        self.nodes[id.index()].outcome = Some(step);
        self.query_count += 1;

        if self.query_count >= num_total_queries {
            self.active = None;
            return Ok(());
        }

        let next = if accepted {
            let mut prefix = self.nodes[id.index()].history.clone();
            prefix.push(Step::Success);
            let remaining = num_total_queries - self.query_count;
            self.split(id, self.query_count, remaining, prefix)
                .first()
                .copied()
        } else {
            self.next_sibling(id)
        };
        self.active = Some(next.ok_or(MtpError::BudgetExhausted { num_total_queries })?);
        trace!(
            query = self.query_count,
            accepted,
            weight = self.nodes[self.active_id()?.index()].weight,
            "budget tree advanced"
        );
        Ok(())
    }

    fn position(&self, id: NodeId) -> Option<(NodeId, usize)> {
        let parent = self.nodes[id.index()].parent?;
        let pos = self.nodes[parent.index()]
            .children
            .iter()
            .position(|c| *c == id)?;
        Some((parent, pos))
    }

    fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        let (parent, pos) = self.position(id)?;
        self.nodes[parent.index()].children.get(pos + 1).copied()
    }

    /// Siblings under the same parent tested before `id`, in test order.
    #[must_use]
    pub fn prior_siblings(&self, id: NodeId) -> Vec<NodeId> {
        match self.position(id) {
            Some((parent, pos)) => self.nodes[parent.index()].children[..pos].to_vec(),
            None => Vec::new(),
        }
    }

    /// Weight still reachable: the active node plus its untested later siblings.
    #[must_use]
    pub fn frontier_weight(&self) -> f64 {
        let Some(active) = self.active else {
            return 0.0;
        };
        match self.position(active) {
            Some((parent, pos)) => self.nodes[parent.index()].children[pos..]
                .iter()
                .map(|c| self.nodes[c.index()].weight)
                .sum(),
            None => self.nodes[active.index()].weight,
        }
    }

    #[must_use]
    pub fn children_weight_sum(&self, id: NodeId) -> f64 {
        self.nodes[id.index()]
            .children
            .iter()
            .map(|c| self.nodes[c.index()].weight)
            .sum()
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &AlphaNode {
        &self.nodes[id.index()]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &AlphaNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    #[must_use]
    pub fn root(&self) -> Option<NodeId> {
        (!self.nodes.is_empty()).then_some(NodeId(0))
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.num_total_queries.is_some()
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.is_initialized() && self.active.is_none()
    }

    #[must_use]
    pub fn query_count(&self) -> usize {
        self.query_count
    }

    #[must_use]
    pub fn num_total_queries(&self) -> Option<usize> {
        self.num_total_queries
    }

    #[must_use]
    pub fn global_alpha(&self) -> f64 {
        self.global_alpha
    }

    #[must_use]
    pub fn success_fraction(&self) -> f64 {
        self.success_fraction
    }

    #[must_use]
    pub fn root_weight(&self) -> f64 {
        self.root_weight
    }
}
