//! Journal batch contents.

use crate::migration::SchemaVersion;
use crate::record::Record;
use serde::{Deserialize, Serialize};

/// One mutation inside a committed batch.
///
/// Keys are stored in their encoded form (see [`crate::Key::encode`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BatchOp {
    /// Insert or overwrite a record.
    Put {
        /// Collection name.
        collection: String,
        /// Encoded key.
        key: String,
        /// Full record.
        record: Record,
    },
    /// Remove a record if present.
    Delete {
        /// Collection name.
        collection: String,
        /// Encoded key.
        key: String,
    },
    /// Remove every record of a collection.
    Clear {
        /// Collection name.
        collection: String,
    },
    /// Remove a collection entirely.
    Drop {
        /// Collection name.
        collection: String,
    },
    /// Raise the auto-increment high-water mark of a collection.
    Counter {
        /// Collection name.
        collection: String,
        /// Next key to hand out.
        next: u64,
    },
    /// Record the schema version of the store.
    Version {
        /// New schema version.
        version: SchemaVersion,
    },
}

impl BatchOp {
    /// Collection the op touches, if any.
    #[must_use]
    pub fn collection(&self) -> Option<&str> {
        match self {
            Self::Put { collection, .. }
            | Self::Delete { collection, .. }
            | Self::Clear { collection }
            | Self::Drop { collection }
            | Self::Counter { collection, .. } => Some(collection),
            Self::Version { .. } => None,
        }
    }
}

/// A group of ops committed together under one sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Strictly increasing commit sequence.
    pub sequence: u64,
    /// Ops in application order.
    pub ops: Vec<BatchOp>,
}
