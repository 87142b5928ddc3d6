//! Error types for the Notesync shell.

use notesync_store::StoreError;
use notesync_sync::{RemoteError, SyncError};
use thiserror::Error;

/// Errors surfaced by the shell, document sync and registry.
#[derive(Debug, Error)]
pub enum NotesyncError {
    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Remote call failed.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// No local copy of a document to push.
    #[error("no local document for key {0}")]
    MissingDocument(String),
}

/// Result type for shell operations.
pub type Result<T> = std::result::Result<T, NotesyncError>;
