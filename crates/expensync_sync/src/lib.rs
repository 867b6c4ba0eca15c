//! # Expensync Sync
//!
//! Reconciles the local store of the expensync engine with a remote
//! authoritative store.
//!
//! This crate provides:
//! - A write-through coordinator (local first, then remote)
//! - A durable FIFO queue of mutations the remote has not acknowledged
//! - Replay with a retry ceiling and dead letters for abandoned operations
//! - Exponential backoff with jitter between replay passes
//! - A connectivity-driven background task
//! - A broadcast channel of sync events
//!
//! ## Key Invariants
//!
//! - The local store is written before the remote is contacted
//! - Remote failures never fail a write; they queue it
//! - Operations replay in the order they were queued
//! - Operations for one record never overtake each other
//! - Nothing is dropped silently: abandoned operations become dead letters

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod coordinator;
mod error;
mod events;
mod queue;
mod remote;
mod state;

pub use config::{RetryConfig, SyncConfig};
pub use coordinator::SyncCoordinator;
pub use error::{SyncError, SyncResult};
pub use events::SyncEvent;
pub use queue::{DeadLetter, OperationKind, PendingOperation, PendingQueue};
pub use remote::{CallKind, Filter, MemoryRemote, RemoteCall, RemoteStore};
pub use state::{ConnectivityState, ReplayReport, SyncStats};
