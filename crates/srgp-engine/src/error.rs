//! Error taxonomy for the testing engine.
//!
//! Every variant is fatal to the current run; nothing is retried or clamped.

use thiserror::Error;

/// Invalid setup or malformed call arguments.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("query budget not initialized; call initialize() first")]
    NotInitialized,
    #[error("global alpha must lie in (0, 1), got {0}")]
    AlphaOutOfRange(f64),
    #[error("success fraction must lie in [0, 1], got {0}")]
    SuccessFractionOutOfRange(f64),
    #[error("parallel ratio must lie in [0, 1], got {0}")]
    ParallelRatioOutOfRange(f64),
    #[error("first prespecified weight must lie in [0, 1], got {0}")]
    FirstPrespecifiedWeightOutOfRange(f64),
    #[error("number of total queries must be positive")]
    ZeroQueries,
    #[error("multivariate normal sample count must be positive")]
    ZeroSamples,
    #[error("observation vectors differ in length: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("observation vectors must contain at least two units, got {0}")]
    TooFewObservations(usize),
    #[error("prespecified candidate losses are required by {mechanism}")]
    MissingPrespecified { mechanism: &'static str },
    #[error("unknown mechanism '{0}'")]
    UnknownMechanism(String),
    #[error("budget transfer from node {from} to node {to} is not allowed")]
    InvalidTransfer { from: usize, to: usize },
    #[error("environment variable {var} has malformed value '{value}'")]
    MalformedEnv { var: &'static str, value: String },
}

/// Numerical failures while computing statistics or critical values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NumericalError {
    #[error("sample variance is zero; the standardized statistic is undefined")]
    ZeroVariance,
    #[error("observation {index} is not finite ({value})")]
    NonFiniteObservation { index: usize, value: f64 },
    #[error("test statistic is not finite ({0})")]
    NonFiniteStatistic(f64),
    #[error("correlation matrix is malformed: {0}")]
    MalformedCorrelation(String),
    #[error("correlation matrix is not positive semi-definite (pivot {pivot:.3e} at row {row})")]
    NotPositiveSemiDefinite { row: usize, pivot: f64 },
    #[error("conditioning event has negligible probability ({probability:.3e})")]
    NegligibleConditioningEvent { probability: f64 },
    #[error("critical value solver did not converge after {iterations} iterations")]
    NonConvergence { iterations: usize },
}

/// Top-level engine error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MtpError {
    #[error("configuration: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("query budget exhausted after {num_total_queries} queries")]
    BudgetExhausted { num_total_queries: usize },
    #[error("numerical: {0}")]
    Numerical(#[from] NumericalError),
}

impl MtpError {
    /// Short machine-readable family name for logs and reports.
    #[must_use]
    pub const fn family(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::BudgetExhausted { .. } => "budget_exhausted",
            Self::Numerical(_) => "numerical",
        }
    }
}

pub type Result<T, E = MtpError> = std::result::Result<T, E>;
