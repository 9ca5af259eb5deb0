//! Harness error type.

use std::path::PathBuf;

use srgp_engine::{ConfigurationError, MtpError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("engine: {0}")]
    Engine(#[from] MtpError),
    #[error("invalid simulation parameter: {0}")]
    InvalidParams(&'static str),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("log emission failed: {0}")]
    Log(#[source] std::io::Error),
    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<ConfigurationError> for HarnessError {
    fn from(err: ConfigurationError) -> Self {
        Self::Engine(MtpError::Configuration(err))
    }
}
