//! The sync coordinator.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::queue::{record_id, DeadLetter, OperationKind, PendingOperation, PendingQueue};
use crate::remote::{Filter, RemoteStore};
use crate::state::{ConnectivityState, ReplayReport, SyncStats};
use expensync_core::{
    CollectionSpec, Document, LocalStore, Record, DEAD_LETTERS, ID_FIELD, PENDING_OPERATIONS,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Write-through front of the local store, reconciling with a remote.
///
/// Every mutation lands in the [`LocalStore`] first. While online it is
/// then sent to the [`RemoteStore`]; if that fails, or while offline, it is
/// appended to the durable pending-operation queue and replayed later in
/// FIFO order. Reads prefer the remote when online and fall back to the
/// local copy when the remote fails.
///
/// A coordinator is created once and shared through an [`Arc`]:
///
/// ```rust
/// use expensync_core::{Expense, LocalStore, Schema};
/// use expensync_sync::{MemoryRemote, SyncCoordinator};
/// use std::sync::Arc;
///
/// # tokio_test_block(async {
/// let store = Arc::new(LocalStore::open_in_memory(Schema::expense_tracker()).unwrap());
/// let remote = Arc::new(MemoryRemote::new());
/// let sync = Arc::new(SyncCoordinator::new(store, remote, false).unwrap());
///
/// sync.insert(&Expense::new("u1", 12.0, "2024-06-01")).await.unwrap();
/// assert_eq!(sync.pending_count().unwrap(), 1);
/// # });
/// # fn tokio_test_block(f: impl std::future::Future<Output = ()>) {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
pub struct SyncCoordinator {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    queue: PendingQueue,
    config: SyncConfig,
    online: AtomicBool,
    syncing: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
    stats: Mutex<SyncStats>,
    /// Signalled whenever an operation is queued, so an idle driver
    /// schedules a pass.
    queued_wake: Notify,
}

impl SyncCoordinator {
    /// Creates a coordinator with the default configuration. `online` is
    /// the connectivity reported by the platform at startup.
    ///
    /// # Errors
    ///
    /// Fails if the store lacks the queue or dead-letter collections.
    pub fn new(store: Arc<LocalStore>, remote: Arc<dyn RemoteStore>, online: bool) -> SyncResult<Self> {
        Self::with_config(store, remote, online, SyncConfig::default())
    }

    /// Creates a coordinator with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Fails if the store lacks the queue or dead-letter collections.
    pub fn with_config(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteStore>,
        online: bool,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        if !store.spec(PENDING_OPERATIONS)?.key.is_auto_increment() {
            return Err(SyncError::validation(format!(
                "{PENDING_OPERATIONS} must use an auto-increment key"
            )));
        }
        store.spec(DEAD_LETTERS)?;

        let (events, _) = broadcast::channel(config.event_capacity);
        let pending = store.count(PENDING_OPERATIONS)?;
        info!(online, pending, "sync coordinator ready");

        Ok(Self {
            queue: PendingQueue::new(Arc::clone(&store)),
            store,
            remote,
            config,
            online: AtomicBool::new(online),
            syncing: AtomicBool::new(false),
            events,
            stats: Mutex::new(SyncStats::default()),
            queued_wake: Notify::new(),
        })
    }

    /// The underlying local store.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Current configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // Typed façade

    /// Writes a document locally and forwards it to the remote.
    ///
    /// # Errors
    ///
    /// Fails only on validation or local store errors. Remote failures
    /// queue the write.
    pub async fn insert<T: Document>(&self, doc: &T) -> SyncResult<T> {
        let stored = self.insert_record(T::COLLECTION, doc.to_record()?).await?;
        Ok(T::from_record(&stored)?)
    }

    /// Merges `patch` into the document `id` and forwards the patch.
    ///
    /// # Errors
    ///
    /// As [`SyncCoordinator::update_record`]. Also fails if the merged row
    /// does not decode as `T`, which happens when `id` was absent locally and
    /// the patch is partial; the write has been applied and forwarded then.
    pub async fn update<T: Document, P: Serialize + ?Sized>(&self, id: &str, patch: &P) -> SyncResult<T> {
        let patch = Record::from_serializable(patch)?;
        let merged = self.update_record(T::COLLECTION, id, patch).await?;
        Ok(T::from_record(&merged)?)
    }

    /// Deletes the document `id` locally and forwards the delete.
    ///
    /// # Errors
    ///
    /// Fails only on local store errors.
    pub async fn delete<T: Document>(&self, id: &str) -> SyncResult<()> {
        self.delete_record(T::COLLECTION, id).await
    }

    /// Every document of `T`'s collection, optionally only `owner`'s.
    ///
    /// # Errors
    ///
    /// Fails on local store errors, or rows that do not decode as `T`.
    pub async fn get_all<T: Document>(&self, owner: Option<&str>) -> SyncResult<Vec<T>> {
        self.get_all_records(T::COLLECTION, owner)
            .await?
            .iter()
            .map(|r| T::from_record(r).map_err(SyncError::from))
            .collect()
    }

    // Record façade

    /// Writes a record locally and forwards it to the remote. Returns the
    /// local copy.
    ///
    /// # Errors
    ///
    /// [`SyncError::Validation`] if the record has no string `id`, in which
    /// case nothing is written.
    pub async fn insert_record(&self, collection: &str, record: Record) -> SyncResult<Record> {
        self.domain_collection(collection)?;
        let id = record_id(collection, &record)?;

        let stored = self.store.put(collection, record)?;
        debug!(collection, id = %id, "stored locally");
        self.forward(OperationKind::Insert, collection, &id, Some(stored.clone()))
            .await?;
        Ok(stored)
    }

    /// Shallow-merges `patch` into the record `id` locally and forwards the
    /// patch. A record absent locally is created from the patch.
    ///
    /// # Errors
    ///
    /// [`SyncError::Validation`] if the patch carries a different `id`.
    pub async fn update_record(&self, collection: &str, id: &str, patch: Record) -> SyncResult<Record> {
        self.domain_collection(collection)?;
        if id.is_empty() {
            return Err(SyncError::validation(format!("update of {collection} needs an id")));
        }
        if let Some(value) = patch.get(ID_FIELD) {
            if value.as_str() != Some(id) {
                return Err(SyncError::validation(format!(
                    "patch for {collection}/{id} changes its id to {value}"
                )));
            }
        }

        let merged = self.store.merge(collection, id, &patch)?;
        self.forward(OperationKind::Update, collection, id, Some(patch))
            .await?;
        Ok(merged)
    }

    /// Deletes the record `id` locally and forwards the delete.
    ///
    /// # Errors
    ///
    /// Fails only on validation or local store errors.
    pub async fn delete_record(&self, collection: &str, id: &str) -> SyncResult<()> {
        self.domain_collection(collection)?;
        if id.is_empty() {
            return Err(SyncError::validation(format!("delete from {collection} needs an id")));
        }

        self.store.delete(collection, id)?;
        self.forward(OperationKind::Delete, collection, id, None).await
    }

    /// Reads a collection, optionally only `owner`'s records.
    ///
    /// Online, the remote answer is overlaid with still-queued local
    /// mutations, written to the local cache, and returned. If the remote
    /// fails, or while offline, the local copy is returned.
    ///
    /// # Errors
    ///
    /// Fails on local store errors, or if `owner` is given for a collection
    /// that is not partitioned by owner.
    pub async fn get_all_records(&self, collection: &str, owner: Option<&str>) -> SyncResult<Vec<Record>> {
        let spec = self.domain_collection(collection)?;
        let filter = match owner {
            None => None,
            Some(owner) => {
                let field = spec.owner_field.ok_or_else(|| {
                    SyncError::validation(format!("{collection} is not partitioned by owner"))
                })?;
                Some(Filter::eq(field, owner))
            }
        };

        if !self.is_online() {
            return Ok(self.store.get_all(collection, owner)?);
        }

        let filters: Vec<Filter> = filter.iter().cloned().collect();
        match self.remote.select(collection, &filters).await {
            Ok(rows) => self.refresh_cache(collection, owner, filter.as_ref(), rows),
            Err(e) if e.is_remote() => {
                warn!(collection, error = %e, "remote read failed, serving local data");
                {
                    let mut stats = self.stats.lock();
                    stats.fallback_reads += 1;
                    stats.last_error = Some(e.to_string());
                }
                Ok(self.store.get_all(collection, owner)?)
            }
            Err(e) => Err(e),
        }
    }

    // Replay

    /// Runs one FIFO pass over the queue.
    ///
    /// Acknowledged operations are removed. A failed one has its retry
    /// count raised, and on reaching the retry ceiling is moved to the dead
    /// letters. After a failure, later operations for the same record wait
    /// for the next pass. Returns a report with `started == false` when
    /// offline, already replaying, or nothing is queued.
    ///
    /// # Errors
    ///
    /// Fails only on local store errors; the pass stops there.
    pub async fn replay(&self) -> SyncResult<ReplayReport> {
        if !self.is_online() {
            debug!("offline, replay skipped");
            return Ok(ReplayReport::default());
        }
        if self.queue.is_empty()? {
            self.stats.lock().consecutive_failed_passes = 0;
            return Ok(ReplayReport::default());
        }
        let Some(guard) = PassGuard::acquire(&self.syncing) else {
            debug!("replay already running");
            return Ok(ReplayReport::default());
        };

        self.emit(SyncEvent::StatusChanged(ConnectivityState::Syncing));
        let outcome = self.run_pass().await;
        drop(guard);
        self.emit(SyncEvent::StatusChanged(self.status()));

        let report = outcome?;
        {
            let mut stats = self.stats.lock();
            stats.passes_completed += 1;
            stats.operations_replayed += report.succeeded as u64;
            stats.replay_failures += report.failed as u64;
            stats.last_pass = Some(Instant::now());
            if report.failed > 0 && !report.is_drained() {
                stats.consecutive_failed_passes = stats.consecutive_failed_passes.saturating_add(1);
            } else {
                stats.consecutive_failed_passes = 0;
            }
        }
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            abandoned = report.abandoned,
            deferred = report.deferred,
            remaining = report.remaining,
            "replay pass finished"
        );
        self.emit(SyncEvent::ReplayFinished(report.clone()));
        Ok(report)
    }

    async fn run_pass(&self) -> SyncResult<ReplayReport> {
        let ops = self.queue.list()?;
        let max_attempts = self.config.retry.max_attempts;
        let mut report = ReplayReport {
            started: true,
            ..ReplayReport::default()
        };
        let mut failed_targets: HashSet<(String, String)> = HashSet::new();
        debug!(queued = ops.len(), "replay pass started");

        for op in ops {
            let id = op.target_id().unwrap_or_default().to_string();
            let target = (op.collection.clone(), id.clone());
            if failed_targets.contains(&target) {
                report.deferred += 1;
                continue;
            }

            report.attempted += 1;
            match self.send(op.kind, &op.collection, &id, op.payload.as_ref()).await {
                Ok(()) => {
                    self.queue.remove(op.operation_id)?;
                    report.succeeded += 1;
                    debug!(operation_id = op.operation_id, kind = %op.kind, "replayed");
                }
                Err(SyncError::Conflict(message)) if op.kind == OperationKind::Insert => {
                    debug!(operation_id = op.operation_id, %message, "row already on remote");
                    self.queue.remove(op.operation_id)?;
                    report.succeeded += 1;
                }
                Err(e) if e.is_remote() => {
                    report.failed += 1;
                    failed_targets.insert(target);
                    self.stats.lock().last_error = Some(e.to_string());
                    if op.retry_count.saturating_add(1) >= max_attempts {
                        self.abandon(&op, &e.to_string())?;
                        report.abandoned += 1;
                    } else {
                        let updated = self.queue.record_failure(&op, &e.to_string())?;
                        debug!(
                            operation_id = op.operation_id,
                            retry_count = updated.retry_count,
                            error = %e,
                            "replay failed"
                        );
                    }
                }
                Err(SyncError::Validation(message)) => {
                    report.failed += 1;
                    failed_targets.insert(target);
                    self.abandon(&op, &message)?;
                    report.abandoned += 1;
                }
                Err(e) => return Err(e),
            }
        }

        report.remaining = self.queue.len()?;
        Ok(report)
    }

    fn abandon(&self, op: &PendingOperation, reason: &str) -> SyncResult<()> {
        let letter = self.queue.abandon(op, reason)?;
        warn!(
            operation_id = op.operation_id,
            kind = %op.kind,
            collection = %op.collection,
            attempts = letter.operation.retry_count,
            reason,
            "operation moved to dead letters"
        );
        self.stats.lock().operations_abandoned += 1;
        self.emit(SyncEvent::OperationAbandoned(letter));
        Ok(())
    }

    // Connectivity

    /// Applies a connectivity signal. Going online with a non-empty queue
    /// runs a replay pass, whose report is returned.
    ///
    /// # Errors
    ///
    /// Fails if that pass hits a local store error.
    pub async fn set_online(&self, online: bool) -> SyncResult<Option<ReplayReport>> {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online == online {
            return Ok(None);
        }

        if online {
            info!("connectivity restored");
        } else {
            info!("connectivity lost, writes will be queued");
        }
        self.emit(SyncEvent::StatusChanged(self.status()));

        if online && !self.queue.is_empty()? {
            return self.replay().await.map(Some);
        }
        Ok(None)
    }

    /// Returns true if the remote is believed reachable.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Current connectivity state.
    pub fn status(&self) -> ConnectivityState {
        if !self.is_online() {
            ConnectivityState::Offline
        } else if self.syncing.load(Ordering::SeqCst) {
            ConnectivityState::Syncing
        } else {
            ConnectivityState::Online
        }
    }

    /// Spawns a task that follows `signal`, replays on reconnect and retries
    /// with backoff while anything is queued, including writes queued after
    /// a failed direct send. The task ends when the sender is dropped.
    pub fn spawn_driver(self: &Arc<Self>, mut signal: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let initial = *signal.borrow_and_update();
            this.follow_signal(initial).await;

            loop {
                let backoff = this.backoff();
                tokio::select! {
                    changed = signal.changed() => {
                        if changed.is_err() {
                            debug!("connectivity signal closed, driver stopping");
                            break;
                        }
                        let online = *signal.borrow_and_update();
                        this.follow_signal(online).await;
                    }
                    _ = sleep_for(backoff) => {
                        debug!(delay = ?backoff, "backoff elapsed, replaying");
                        if let Err(e) = this.replay().await {
                            warn!(error = %e, "replay pass failed");
                        }
                    }
                    // Re-evaluates the backoff once something is queued.
                    _ = this.queued_wake.notified(), if backoff.is_none() => {}
                }
            }
        })
    }

    async fn follow_signal(&self, online: bool) {
        let outcome = match self.set_online(online).await {
            Ok(None) if online => self.replay().await.map(drop),
            other => other.map(drop),
        };
        if let Err(e) = outcome {
            warn!(error = %e, "replay after connectivity change failed");
        }
    }

    /// Delay before the next scheduled pass, or `None` when there is
    /// nothing to retry.
    fn backoff(&self) -> Option<Duration> {
        if !self.is_online() {
            return None;
        }
        let attempt = self.stats.lock().consecutive_failed_passes;
        if attempt == 0 && !matches!(self.queue.is_empty(), Ok(false)) {
            return None;
        }
        Some(self.config.retry.delay_for_attempt(attempt.max(1)))
    }

    // Queue inspection

    /// Number of queued operations.
    ///
    /// # Errors
    ///
    /// Fails on local store errors.
    pub fn pending_count(&self) -> SyncResult<usize> {
        self.queue.len()
    }

    /// Queued operations in replay order.
    ///
    /// # Errors
    ///
    /// Fails on local store errors.
    pub fn pending(&self) -> SyncResult<Vec<PendingOperation>> {
        self.queue.list()
    }

    /// Abandoned operations.
    ///
    /// # Errors
    ///
    /// Fails on local store errors.
    pub fn dead_letters(&self) -> SyncResult<Vec<DeadLetter>> {
        self.queue.dead_letters()
    }

    /// Puts a dead letter back at the end of the queue with its retry count
    /// reset. Returns `None` if there is no such dead letter.
    ///
    /// # Errors
    ///
    /// Fails on local store errors.
    pub fn requeue_dead_letter(&self, operation_id: u64) -> SyncResult<Option<PendingOperation>> {
        let requeued = self.queue.requeue(operation_id)?;
        if let Some(op) = &requeued {
            info!(from = operation_id, to = op.operation_id, "dead letter requeued");
            self.queued(op);
        }
        Ok(requeued)
    }

    /// Deletes a dead letter. Returns false if there was none.
    ///
    /// # Errors
    ///
    /// Fails on local store errors.
    pub fn discard_dead_letter(&self, operation_id: u64) -> SyncResult<bool> {
        self.queue.discard(operation_id)
    }

    /// Subscribes to coordinator events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> SyncStats {
        self.stats.lock().clone()
    }

    // Internals

    fn domain_collection(&self, collection: &str) -> SyncResult<CollectionSpec> {
        if collection == PENDING_OPERATIONS || collection == DEAD_LETTERS {
            return Err(SyncError::validation(format!(
                "{collection} is managed by the coordinator"
            )));
        }
        Ok(self.store.spec(collection)?)
    }

    async fn forward(
        &self,
        kind: OperationKind,
        collection: &str,
        id: &str,
        payload: Option<Record>,
    ) -> SyncResult<()> {
        if !self.is_online() {
            return self.enqueue(kind, collection, id, payload, None);
        }
        if self.queue.has_pending(collection, id)? {
            debug!(collection, id, "earlier changes still queued, queueing behind them");
            return self.enqueue(kind, collection, id, payload, None);
        }

        match self.send(kind, collection, id, payload.as_ref()).await {
            Ok(()) => {
                self.stats.lock().remote_writes += 1;
                debug!(collection, id, %kind, "written to remote");
                Ok(())
            }
            Err(e) if e.is_remote() => {
                info!(collection, id, %kind, error = %e, "remote write failed, queued for replay");
                self.stats.lock().last_error = Some(e.to_string());
                self.enqueue(kind, collection, id, payload, Some(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn send(
        &self,
        kind: OperationKind,
        collection: &str,
        id: &str,
        payload: Option<&Record>,
    ) -> SyncResult<()> {
        if id.is_empty() {
            return Err(SyncError::validation(format!("{kind} on {collection} has no target id")));
        }
        match (kind, payload) {
            (OperationKind::Insert, Some(row)) => self.remote.insert(collection, row).await,
            (OperationKind::Update, Some(patch)) => self.remote.update(collection, id, patch).await,
            (OperationKind::Delete, _) => self.remote.delete(collection, id).await,
            (kind, None) => Err(SyncError::validation(format!(
                "{kind} of {collection}/{id} has no payload"
            ))),
        }
    }

    fn enqueue(
        &self,
        kind: OperationKind,
        collection: &str,
        id: &str,
        payload: Option<Record>,
        last_error: Option<String>,
    ) -> SyncResult<()> {
        let record_id = (kind != OperationKind::Insert).then_some(id);
        let op = self.queue.enqueue(kind, collection, record_id, payload, last_error)?;
        self.queued(&op);
        Ok(())
    }

    fn queued(&self, op: &PendingOperation) {
        self.stats.lock().operations_queued += 1;
        self.queued_wake.notify_one();
        self.emit(SyncEvent::OperationQueued {
            operation_id: op.operation_id,
            collection: op.collection.clone(),
            kind: op.kind,
        });
    }

    fn refresh_cache(
        &self,
        collection: &str,
        owner: Option<&str>,
        filter: Option<&Filter>,
        mut rows: Vec<Record>,
    ) -> SyncResult<Vec<Record>> {
        for op in self.queue.for_collection(collection)? {
            self.overlay(&mut rows, &op)?;
        }
        if let Some(filter) = filter {
            rows.retain(|r| filter.matches(r));
        }

        let cached = match owner {
            Some(owner) => self.store.replace_owned(collection, owner, rows.clone()),
            None => self.store.replace_all(collection, rows.clone()),
        };
        match cached {
            Ok(_) => {
                debug!(collection, count = rows.len(), "local cache refreshed");
                self.emit(SyncEvent::CacheRefreshed {
                    collection: collection.to_string(),
                    count: rows.len(),
                });
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => warn!(collection, error = %e, "remote rows not cached"),
        }
        Ok(rows)
    }

    fn overlay(&self, rows: &mut Vec<Record>, op: &PendingOperation) -> SyncResult<()> {
        let Some(id) = op.target_id() else {
            return Ok(());
        };
        let position = rows.iter().position(|r| r.id() == Some(id));

        match (op.kind, position) {
            (OperationKind::Insert, Some(i)) => {
                if let Some(row) = &op.payload {
                    rows[i] = row.clone();
                }
            }
            (OperationKind::Insert, None) => rows.extend(op.payload.clone()),
            (OperationKind::Update, Some(i)) => {
                if let Some(patch) = &op.payload {
                    rows[i].merge(patch);
                }
            }
            (OperationKind::Update, None) => rows.extend(self.store.get(&op.collection, id)?),
            (OperationKind::Delete, Some(i)) => {
                rows.remove(i);
            }
            (OperationKind::Delete, None) => {}
        }
        Ok(())
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("status", &self.status())
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Holds the replay flag for the duration of a pass.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending::<()>().await,
    }
}
