//! Error types for Notesync Core.

use thiserror::Error;

/// Errors raised while encoding or decoding rows.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record must encode to a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("row {id} could not be decoded: {reason}")]
    MalformedRow { id: String, reason: String },
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
