//! Simulation harness for the SRGP multiple-testing engine.
//!
//! This crate provides:
//! - Null simulation: empirical family-wise error under i.i.d. null candidates
//! - Adversary simulation: a developer reusing one held-out set, walking
//!   feature directions that look good on it
//! - Structured logging: JSONL run events plus a SHA-256 artifact index
//! - The `srgp-harness` CLI wiring all of the above

#![forbid(unsafe_code)]

pub mod error;
pub mod simulation;
pub mod structured_log;

pub use error::HarnessError;
pub use simulation::{
    Scenario, SimulationParams, SimulationReport, simulate_adversary, simulate_null,
    wilson_upper_bound,
};
