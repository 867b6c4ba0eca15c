//! Notifications published by the coordinator.

use crate::queue::{DeadLetter, OperationKind};
use crate::state::{ConnectivityState, ReplayReport};

/// An event on the coordinator's broadcast channel.
///
/// Subscribers that fall behind the channel capacity miss events and see
/// a lag error from `recv`; a `ReplayFinished` or `CacheRefreshed` after
/// that is the cue to re-read.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connectivity state changed.
    StatusChanged(ConnectivityState),
    /// A mutation was appended to the queue.
    OperationQueued {
        /// Queue position.
        operation_id: u64,
        /// Target collection.
        collection: String,
        /// Kind of mutation.
        kind: OperationKind,
    },
    /// A queued operation hit the retry ceiling.
    OperationAbandoned(DeadLetter),
    /// A replay pass completed. Views should refresh.
    ReplayFinished(ReplayReport),
    /// A remote read replaced the local copy of a collection.
    CacheRefreshed {
        /// Collection refreshed.
        collection: String,
        /// Rows returned to the caller.
        count: usize,
    },
}
