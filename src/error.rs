use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidInput,
    NotEstimated,
    NotFound,
    Io,
    Internal,
}

/// Configuration error raised by `estimate` or `apply`.
///
/// This is the only error kind that flips a workflow item to the invalid
/// state; everything else an operation encounters is either converted into
/// one of these or reported as a warning.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct OpError {
    pub code: ErrorCode,
    pub message: String,
}

impl OpError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn not_estimated(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotEstimated, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Io, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn no_experiment() -> Self {
        Self::invalid("No experiment specified")
    }
}

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("No result to plot; the workflow item is not valid")]
    NoResult,
    #[error("View error: {0}")]
    Invalid(String),
    #[error(transparent)]
    Op(#[from] OpError),
}

#[derive(Debug, Error)]
pub enum CytoflowError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Configuration load error: {0}")]
    Config(#[from] figment::Error),
    #[error("Workflow document error: {0}")]
    Document(String),
    #[error("Item index {index} is out of range for a workflow of {len} item(s)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error(transparent)]
    Op(#[from] OpError),
    #[error(transparent)]
    View(#[from] ViewError),
}
