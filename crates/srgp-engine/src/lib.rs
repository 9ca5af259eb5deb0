//! Online sequential multiple-testing engine for model updates.
//!
//! A model-development loop proposes candidate modifications to a deployed
//! predictive model one at a time. For each candidate it hands this crate the
//! per-unit losses of the candidate and of the currently approved model on a
//! shared held-out set, and gets back a single approve/reject verdict. Across
//! the whole stream, the probability of ever approving a candidate that is
//! not actually better stays below `global_alpha`.
//!
//! # Architecture
//!
//! - **Nodes** (`node`): arena vertices holding a share of the alpha budget
//! - **Spending tree** (`budget_tree`): lazily built sequentially rejective
//!   graph; conserves weight on every success/failure transition
//! - **Prespecified chain** (`prespec_chain`): always-advancing sequence with
//!   explicit budget transfers
//! - **Threshold solver** (`threshold`): conditional multivariate-normal
//!   critical values with randomized robustness sampling
//! - **Procedures** (`procedure`): Binary, Bonferroni, GraphicalBonf,
//!   GraphicalFfs and GraphicalParallel behind one trait
//! - **Statistics** (`stats`): paired loss differences, correlation, normal helpers
//! - **Configuration** (`config`): typed parameters with `SRGP_*` overrides
//!
//! Every instance is single-threaded and exclusively owned; all state
//! derives `serde` so a run can be persisted and resumed.

#![forbid(unsafe_code)]

pub mod budget_tree;
pub mod config;
pub mod error;
pub mod node;
pub mod prespec_chain;
pub mod procedure;
pub mod stats;
pub mod threshold;

pub use budget_tree::BudgetTree;
pub use config::{MechanismKind, MtpConfig};
pub use error::{ConfigurationError, MtpError, NumericalError, Result};
pub use node::{AlphaNode, NodeId, Step};
pub use prespec_chain::PrespecifiedChain;
pub use procedure::{
    BinaryThreshold, Bonferroni, GraphicalBonf, GraphicalFfs, GraphicalParallel,
    MultipleTestingProcedure, Procedure, Verdict, build_procedure,
};
pub use stats::{CorrelationMatrix, LossComparison};
pub use threshold::ThresholdSolver;
