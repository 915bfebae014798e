//! Error types for the capture pipeline.

use serde::Serialize;
use thiserror::Error;

/// Failures of the detection store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Body for failed store reads (statistics, clear).
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error: "store_unavailable",
            message: self.to_string(),
        }
    }
}

/// Pipeline error taxonomy surfaced to control callers.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The frame source could not be opened or read.
    #[error("frame source unavailable: {0}")]
    SourceUnavailable(String),

    /// The inference engine could not process a frame.
    #[error("inference failed: {0}")]
    InferenceFailure(String),

    /// Accepted detections could not be persisted.
    #[error("detections were not persisted: {0}")]
    StoreWriteFailure(#[from] StoreError),

    /// Rejected upload (unsupported type, oversize, corrupt image).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::SourceUnavailable(_) => "source_unavailable",
            PipelineError::InferenceFailure(_) => "inference_failure",
            PipelineError::StoreWriteFailure(_) => "store_write_failure",
            PipelineError::InvalidInput(_) => "invalid_input",
            PipelineError::Config(_) => "config",
        }
    }

    /// Structured error object for control-surface responses.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error: self.code(),
            message: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}
