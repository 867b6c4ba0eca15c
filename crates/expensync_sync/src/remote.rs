//! The authoritative remote store, as seen by the coordinator.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use expensync_core::{Record, ID_FIELD};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Equality predicate on a row field.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    /// Field name.
    pub field: String,
    /// Required value.
    pub value: Value,
}

impl Filter {
    /// Matches rows whose `field` equals `value`.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Returns true if `record` satisfies the predicate.
    pub fn matches(&self, record: &Record) -> bool {
        record.get(&self.field) == Some(&self.value)
    }
}

/// Row-based CRUD access to the remote backend.
///
/// Rows are addressed by their `id` field. Implementations surface every
/// failure as an error; transient ones should be [`SyncError::Remote`],
/// [`SyncError::NotConnected`] or [`SyncError::Timeout`] so the coordinator
/// queues the write instead of failing the caller.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Rows of `collection` matching every filter.
    async fn select(&self, collection: &str, filters: &[Filter]) -> SyncResult<Vec<Record>>;

    /// Writes a full row. A row with the same id is overwritten.
    async fn insert(&self, collection: &str, record: &Record) -> SyncResult<()>;

    /// Shallow-merges `patch` into the row `id`. A missing row is not an error.
    async fn update(&self, collection: &str, id: &str, patch: &Record) -> SyncResult<()>;

    /// Deletes the row `id`. A missing row is not an error.
    async fn delete(&self, collection: &str, id: &str) -> SyncResult<()>;
}

/// Kind of a call received by [`MemoryRemote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// `select`
    Select,
    /// `insert`
    Insert,
    /// `update`
    Update,
    /// `delete`
    Delete,
}

/// One call received by [`MemoryRemote`], whether or not it succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    /// Call kind.
    pub kind: CallKind,
    /// Target collection.
    pub collection: String,
    /// Target row, for writes.
    pub id: Option<String>,
    /// Row or patch sent, for inserts and updates.
    pub payload: Option<Record>,
    /// Whether the call was applied.
    pub accepted: bool,
}

/// An in-process remote for tests and demos.
///
/// Supports an offline switch, failure injection, a fixed per-call latency
/// and a duplicate-rejecting mode in which inserting an existing id fails
/// with [`SyncError::Conflict`].
#[derive(Debug, Default)]
pub struct MemoryRemote {
    tables: Mutex<BTreeMap<String, BTreeMap<String, Record>>>,
    offline: AtomicBool,
    fail_next: AtomicU32,
    failing: Mutex<HashSet<String>>,
    reject_duplicates: AtomicBool,
    latency: Mutex<Option<Duration>>,
    calls: Mutex<Vec<RemoteCall>>,
}

impl MemoryRemote {
    /// Creates an empty, reachable remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with [`SyncError::NotConnected`] while offline.
    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    /// Fails the next `n` calls with a remote error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fails every call touching `collection` until healed.
    pub fn fail_collection(&self, collection: impl Into<String>) {
        self.failing.lock().insert(collection.into());
    }

    /// Stops failing calls touching `collection`.
    pub fn heal_collection(&self, collection: &str) {
        self.failing.lock().remove(collection);
    }

    /// Switches insert from upsert to reject-on-duplicate.
    pub fn reject_duplicates(&self, reject: bool) {
        self.reject_duplicates.store(reject, Ordering::SeqCst);
    }

    /// Delays every call by `latency` before it is answered.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Stores a row directly, bypassing failure injection and the call log.
    pub fn seed(&self, collection: &str, record: Record) {
        if let Some(id) = record.id().map(str::to_string) {
            self.tables
                .lock()
                .entry(collection.to_string())
                .or_default()
                .insert(id, record);
        }
    }

    /// A stored row.
    pub fn row(&self, collection: &str, id: &str) -> Option<Record> {
        self.tables.lock().get(collection)?.get(id).cloned()
    }

    /// Every stored row of a collection, by id.
    pub fn rows(&self, collection: &str) -> Vec<Record> {
        self.tables
            .lock()
            .get(collection)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Calls received so far, in order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().clone()
    }

    /// Forgets the call log.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    async fn pause(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check(&self, collection: &str) -> SyncResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(SyncError::NotConnected)
        } else if self.failing.lock().contains(collection) {
            Err(SyncError::remote(format!("{collection} is unavailable")))
        } else if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(SyncError::remote("injected failure"))
        } else {
            Ok(())
        }
    }

    fn log(
        &self,
        kind: CallKind,
        collection: &str,
        id: Option<&str>,
        payload: Option<&Record>,
        outcome: &SyncResult<()>,
    ) {
        self.calls.lock().push(RemoteCall {
            kind,
            collection: collection.to_string(),
            id: id.map(str::to_string),
            payload: payload.cloned(),
            accepted: outcome.is_ok(),
        });
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn select(&self, collection: &str, filters: &[Filter]) -> SyncResult<Vec<Record>> {
        self.pause().await;
        let outcome = self.check(collection);
        self.log(CallKind::Select, collection, None, None, &outcome);
        outcome?;

        Ok(self
            .rows(collection)
            .into_iter()
            .filter(|r| filters.iter().all(|f| f.matches(r)))
            .collect())
    }

    async fn insert(&self, collection: &str, record: &Record) -> SyncResult<()> {
        let id = record
            .id()
            .ok_or_else(|| SyncError::validation(format!("row for {collection} has no {ID_FIELD}")))?
            .to_string();

        self.pause().await;
        let outcome = self.check(collection).and_then(|()| {
            if self.reject_duplicates.load(Ordering::SeqCst) && self.row(collection, &id).is_some() {
                Err(SyncError::conflict(format!("{collection}/{id} already exists")))
            } else {
                Ok(())
            }
        });
        self.log(CallKind::Insert, collection, Some(&id), Some(record), &outcome);
        outcome?;

        self.tables
            .lock()
            .entry(collection.to_string())
            .or_default()
            .insert(id, record.clone());
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, patch: &Record) -> SyncResult<()> {
        self.pause().await;
        let outcome = self.check(collection);
        self.log(CallKind::Update, collection, Some(id), Some(patch), &outcome);
        outcome?;

        let mut tables = self.tables.lock();
        if let Some(row) = tables.get_mut(collection).and_then(|t| t.get_mut(id)) {
            row.merge(patch);
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> SyncResult<()> {
        self.pause().await;
        let outcome = self.check(collection);
        self.log(CallKind::Delete, collection, Some(id), None, &outcome);
        outcome?;

        if let Some(table) = self.tables.lock().get_mut(collection) {
            table.remove(id);
        }
        Ok(())
    }
}
