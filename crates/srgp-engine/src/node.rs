//! Arena vertices shared by the spending tree and the prespecified chain.

use serde::{Deserialize, Serialize};

/// Index of a node inside its owning arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub usize);

impl NodeId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// One entry of the outcome path that led to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Failure,
    Success,
    /// Outcome not known when the node was laid out (prespecified chain).
    Unknown,
}

impl Step {
    #[must_use]
    pub const fn from_accepted(accepted: bool) -> Self {
        if accepted { Self::Success } else { Self::Failure }
    }

    /// `0`, `1`, or `None` for [`Step::Unknown`].
    #[must_use]
    pub const fn as_int(self) -> Option<u8> {
        match self {
            Self::Failure => Some(0),
            Self::Success => Some(1),
            Self::Unknown => None,
        }
    }
}

/// A single vertex of the alpha-spending structure.
///
/// Nodes are never dropped while their arena lives; once tested they are
/// read-only history used by later correlation lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlphaNode {
    /// Share of the global alpha held when the node becomes active.
    pub weight: f64,
    /// Budget added by an explicit transfer after the node was laid out.
    pub earned: f64,
    pub success_fraction: f64,
    pub parent: Option<NodeId>,
    /// Materialized only when the node passes its test.
    pub children: Vec<NodeId>,
    /// Zero-based query index at which this node is (or would be) tested.
    pub query_index: usize,
    pub history: Vec<Step>,
    /// Loss differences retained after the node's test.
    pub observations: Option<Vec<f64>>,
    pub threshold: Option<f64>,
    pub outcome: Option<Step>,
}

impl AlphaNode {
    pub(crate) fn new(
        weight: f64,
        success_fraction: f64,
        parent: Option<NodeId>,
        query_index: usize,
        history: Vec<Step>,
    ) -> Self {
        Self {
            weight,
            earned: 0.0,
            success_fraction,
            parent,
            children: Vec::new(),
            query_index,
            history,
            observations: None,
            threshold: None,
            outcome: None,
        }
    }

    #[must_use]
    pub fn failure_fraction(&self) -> f64 {
        1.0 - self.success_fraction
    }

    /// `weight * global_alpha`.
    #[must_use]
    pub fn local_alpha(&self, global_alpha: f64) -> f64 {
        self.weight * global_alpha
    }

    #[must_use]
    pub fn is_tested(&self) -> bool {
        self.outcome.is_some()
    }

    #[must_use]
    pub fn accepted(&self) -> bool {
        self.outcome == Some(Step::Success)
    }
}

/// Geometric split of `weight` into `count` parts.
///
/// Part `i` receives `weight * s * (1 - s)^i`; the last part receives
/// whatever remains so the parts sum to `weight` exactly in floating point.
#[must_use]
pub fn geometric_split(weight: f64, success_fraction: f64, count: usize) -> Vec<f64> {
    if count == 0 {
        return Vec::new();
    }
    let mut parts = Vec::with_capacity(count);
    let mut assigned = 0.0;
    let mut decay = 1.0;
    for _ in 0..count - 1 {
        let part = weight * success_fraction * decay;
        parts.push(part);
        assigned += part;
        decay *= 1.0 - success_fraction;
    }
    parts.push(weight - assigned);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_matches_geometric_series() {
        let parts = geometric_split(1.0, 0.8, 3);
        assert_eq!(parts.len(), 3);
        assert!((parts[0] - 0.8).abs() < 1e-15);
        assert!((parts[1] - 0.16).abs() < 1e-15);
        assert!((parts[2] - 0.04).abs() < 1e-15);
    }

    #[test]
    fn split_remainder_lands_on_last_part() {
        for (w, s, n) in [(1.0, 0.8, 20), (0.37, 0.3, 7), (0.1, 0.999, 5), (1.0, 0.0, 4)] {
            let parts = geometric_split(w, s, n);
            let sum: f64 = parts.iter().sum();
            assert!((sum - w).abs() < 1e-12, "w={w} s={s} n={n} sum={sum}");
            assert!(parts.iter().all(|p| *p >= -1e-15));
        }
    }

    #[test]
    fn single_part_takes_everything() {
        assert_eq!(geometric_split(0.6, 0.8, 1), vec![0.6]);
        assert!(geometric_split(0.6, 0.8, 0).is_empty());
    }

    #[test]
    fn step_int_encoding() {
        assert_eq!(Step::from_accepted(true).as_int(), Some(1));
        assert_eq!(Step::from_accepted(false).as_int(), Some(0));
        assert_eq!(Step::Unknown.as_int(), None);
    }

    #[test]
    fn local_alpha_scales_weight() {
        let node = AlphaNode::new(0.25, 0.8, None, 0, Vec::new());
        assert!((node.local_alpha(0.1) - 0.025).abs() < 1e-15);
        assert!((node.failure_fraction() - 0.2).abs() < 1e-15);
        assert!(!node.is_tested());
    }
}
