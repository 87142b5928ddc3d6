//! Error types for the sync module.

use thiserror::Error;

/// Failures reported by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The call never completed (offline, timeout, 5xx).
    #[error("network failure: {0}")]
    Network(String),

    /// The remote rejected a mutating push, e.g. a resource is already active.
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Remote call failed.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] notesync_store::StoreError),

    /// Record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] notesync_core::CoreError),

    /// A bus signal could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A conflicting start could not be compensated; local state was
    /// rolled back.
    #[error("compensation failed, rolled back: {reason}")]
    CompensationFailed { reason: String },

    /// A patch targeted a row that has been deleted.
    #[error("row {id} in {table} is deleted")]
    RowDeleted { table: String, id: String },

    /// The table is not part of this coordinator's module group.
    #[error("unknown table: {0}")]
    UnknownTable(String),
}

impl SyncError {
    /// Whether this is a transient network failure that the next poll
    /// will recover from.
    pub fn is_network(&self) -> bool {
        matches!(self, SyncError::Remote(RemoteError::Network(_)))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Remote(RemoteError::Conflict(_)))
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Result type for remote calls.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;
