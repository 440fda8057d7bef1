//! Error types for the ETL pipeline

use std::path::PathBuf;

use thiserror::Error;

use crate::record::RecordKind;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Main error type for the ETL pipeline
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Storage error during {op} of '{key}': {message}")]
    Storage {
        op: &'static str,
        key: String,
        message: String,
    },

    #[error("Object not found: {0}")]
    NotFound(String),

    /// A merge input could not be read. Fatal for the run: skipping the file
    /// would drop rows whose keys are about to be recorded as processed.
    #[error("Failed to merge {kind} input {}: {source}", path.display())]
    Merge {
        kind: RecordKind,
        path: PathBuf,
        #[source]
        source: Box<EtlError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl EtlError {
    pub fn storage(op: &'static str, key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        EtlError::Storage {
            op,
            key: key.into(),
            message: err.to_string(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        EtlError::Config(message.into())
    }
}

impl From<tokio::task::JoinError> for EtlError {
    fn from(err: tokio::task::JoinError) -> Self {
        EtlError::Task(err.to_string())
    }
}
