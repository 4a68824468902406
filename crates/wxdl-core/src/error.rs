//! Error types for the core crate.

use thiserror::Error;

/// Errors raised while persisting profiles.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error (creating directories, writing files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
