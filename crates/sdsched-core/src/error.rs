//! Error types for the scheduling core.

use thiserror::Error;

/// Broad failure classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or inconsistent configuration, or an engine used outside its run.
    Configuration,
    /// A tensor argument disagrees with the sampling configuration.
    ShapeMismatch,
    /// A step index outside `[0, step_count)`.
    IndexRange,
    /// Failure inside host numerics or a compiled-module invocation.
    BackendExecution,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown scheduler identifier: {0}")]
    UnknownScheduler(String),

    #[error("Shape mismatch for {argument}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        argument: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Step index {index} out of range for {step_count} steps")]
    StepIndexOutOfRange { index: usize, step_count: usize },

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConfigError(_) | Error::UnknownScheduler(_) | Error::Io(_) | Error::Json(_) => {
                ErrorKind::Configuration
            }
            Error::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
            Error::StepIndexOutOfRange { .. } => ErrorKind::IndexRange,
            Error::BackendError(_) | Error::Tensor(_) => ErrorKind::BackendExecution,
        }
    }

    pub(crate) fn shape(argument: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Error::ShapeMismatch {
            argument,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
