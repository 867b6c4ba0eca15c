//! Error types for the sync coordinator.

use expensync_core::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while coordinating with the remote.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The local store failed. Never absorbed by the queue.
    #[error("local store error: {0}")]
    Store(#[from] StoreError),

    /// The remote rejected or failed a request.
    #[error("remote error: {message}")]
    Remote {
        /// Error message.
        message: String,
    },

    /// The remote refused a write because the row already exists.
    #[error("remote conflict: {0}")]
    Conflict(String),

    /// The remote cannot be reached.
    #[error("not connected to remote")]
    NotConnected,

    /// The remote did not answer in time.
    #[error("remote operation timed out")]
    Timeout,

    /// The caller supplied something that can never be written.
    #[error("validation error: {0}")]
    Validation(String),

    /// A queued operation could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Creates a remote error.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Creates a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Returns true for failures of the remote side. These are absorbed by
    /// queueing the operation for a later replay.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            SyncError::Remote { .. }
                | SyncError::Conflict(_)
                | SyncError::NotConnected
                | SyncError::Timeout
        )
    }
}
