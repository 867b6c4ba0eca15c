//! Multi-op atomic writes.

use crate::record::{Key, Record};

/// A single mutation queued in a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert or overwrite a record.
    Put {
        /// Target collection.
        collection: String,
        /// Record to store.
        record: Record,
    },
    /// Delete a record; absent keys are ignored.
    Delete {
        /// Target collection.
        collection: String,
        /// Key to delete.
        key: Key,
    },
    /// Delete every record of a collection.
    Clear {
        /// Target collection.
        collection: String,
    },
}

/// Mutations that commit as one journal batch.
///
/// Readers observe either none or all of them.
///
/// ```rust
/// use expensync_core::{Record, WriteBatch};
/// use serde_json::json;
///
/// let batch = WriteBatch::new()
///     .delete("pending_operations", 7u64)
///     .put("dead_letters", Record::from_value(json!({"operation_id": 7})).unwrap());
/// assert_eq!(batch.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a put.
    #[must_use]
    pub fn put(mut self, collection: impl Into<String>, record: Record) -> Self {
        self.ops.push(WriteOp::Put {
            collection: collection.into(),
            record,
        });
        self
    }

    /// Adds a delete.
    #[must_use]
    pub fn delete(mut self, collection: impl Into<String>, key: impl Into<Key>) -> Self {
        self.ops.push(WriteOp::Delete {
            collection: collection.into(),
            key: key.into(),
        });
        self
    }

    /// Adds a clear.
    #[must_use]
    pub fn clear(mut self, collection: impl Into<String>) -> Self {
        self.ops.push(WriteOp::Clear {
            collection: collection.into(),
        });
        self
    }

    /// Number of queued ops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}
