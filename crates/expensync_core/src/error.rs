//! Error types for the local store.

use std::io;
use thiserror::Error;

/// Result type for local store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the local durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] expensync_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record or batch could not be (de)serialized.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A complete journal frame failed validation.
    #[error("journal corruption at offset {offset}: {message}")]
    JournalCorruption {
        /// Byte offset of the bad frame.
        offset: u64,
        /// What was wrong with it.
        message: String,
    },

    /// The named collection does not exist.
    #[error("collection not found: {name}")]
    CollectionNotFound {
        /// Collection name.
        name: String,
    },

    /// A record has no usable key.
    #[error("record in '{collection}' has no usable key field '{field}'")]
    MissingKey {
        /// Collection the record was written to.
        collection: String,
        /// Key field that was missing or not a string/integer.
        field: String,
    },

    /// A value could not be treated as a record.
    #[error("invalid record: {message}")]
    InvalidRecord {
        /// Description of the problem.
        message: String,
    },

    /// Another process holds the store directory lock.
    #[error("store locked: another process has exclusive access")]
    Locked,

    /// Invalid on-disk format.
    #[error("invalid store format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// The store on disk is newer than the schema used to open it.
    #[error("schema downgrade: store is at version {stored}, requested {requested}")]
    SchemaDowngrade {
        /// Version recorded in the store.
        stored: u32,
        /// Version of the schema passed to `open`.
        requested: u32,
    },

    /// A migration could not be registered or applied.
    #[error("migration failed: {message}")]
    MigrationFailed {
        /// Description of the failure.
        message: String,
    },

    /// The operation is not valid for this collection or state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// The store has been closed.
    #[error("store is closed")]
    Closed,
}

impl StoreError {
    /// Creates a journal corruption error.
    pub fn journal_corruption(offset: u64, message: impl Into<String>) -> Self {
        Self::JournalCorruption {
            offset,
            message: message.into(),
        }
    }

    /// Creates a collection-not-found error.
    pub fn collection_not_found(name: impl Into<String>) -> Self {
        Self::CollectionNotFound { name: name.into() }
    }

    /// Creates an invalid record error.
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates a migration failed error.
    pub fn migration_failed(message: impl Into<String>) -> Self {
        Self::MigrationFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if the error means the store can no longer be trusted.
    ///
    /// Corruption, lock contention and format errors fall in this class;
    /// per-record problems such as a missing key do not.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Storage(_)
                | Self::Io(_)
                | Self::JournalCorruption { .. }
                | Self::Locked
                | Self::InvalidFormat { .. }
                | Self::SchemaDowngrade { .. }
                | Self::Closed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = StoreError::journal_corruption(42, "crc mismatch");
        assert_eq!(err.to_string(), "journal corruption at offset 42: crc mismatch");

        let err = StoreError::SchemaDowngrade {
            stored: 4,
            requested: 3,
        };
        assert!(err.to_string().contains("version 4"));
    }

    #[test]
    fn fatal_classification() {
        assert!(StoreError::Locked.is_fatal());
        assert!(StoreError::journal_corruption(0, "x").is_fatal());
        assert!(!StoreError::collection_not_found("expenses").is_fatal());
        assert!(!StoreError::invalid_record("not an object").is_fatal());
    }
}
