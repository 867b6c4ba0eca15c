//! Connectivity state and replay bookkeeping.

use serde::Serialize;
use std::fmt;
use std::time::Instant;

/// Connectivity state of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// The remote is believed reachable.
    Online,
    /// The remote is believed unreachable. Writes go to the queue.
    Offline,
    /// Online, with a replay pass running.
    Syncing,
}

impl ConnectivityState {
    /// Returns true if the remote is believed reachable.
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectivityState::Online | ConnectivityState::Syncing)
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            ConnectivityState::Online => "online",
            ConnectivityState::Offline => "offline",
            ConnectivityState::Syncing => "syncing",
        })
    }
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Whether a pass actually ran. False when offline, already syncing,
    /// or the queue was empty.
    pub started: bool,
    /// Operations sent to the remote.
    pub attempted: usize,
    /// Operations acknowledged and removed from the queue.
    pub succeeded: usize,
    /// Operations that failed this pass.
    pub failed: usize,
    /// Failed operations moved to dead letters.
    pub abandoned: usize,
    /// Operations held back because an earlier one for the same record failed.
    pub deferred: usize,
    /// Queue length after the pass.
    pub remaining: usize,
}

impl ReplayReport {
    /// Returns true if the pass left nothing queued.
    pub fn is_drained(&self) -> bool {
        self.remaining == 0
    }
}

/// Counters over the lifetime of a coordinator.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Replay passes completed.
    pub passes_completed: u64,
    /// Queued operations acknowledged by the remote.
    pub operations_replayed: u64,
    /// Failed replay attempts.
    pub replay_failures: u64,
    /// Operations moved to dead letters.
    pub operations_abandoned: u64,
    /// Operations appended to the queue.
    pub operations_queued: u64,
    /// Writes that reached the remote directly.
    pub remote_writes: u64,
    /// Reads answered from the local store after a remote failure.
    pub fallback_reads: u64,
    /// Consecutive passes that left failed operations behind.
    pub consecutive_failed_passes: u32,
    /// When the last pass finished.
    pub last_pass: Option<Instant>,
    /// Most recent remote failure.
    pub last_error: Option<String>,
}
