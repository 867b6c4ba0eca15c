//! The durable pending-operation queue and its dead letters.
//!
//! Both live in the local store: queued operations in
//! `pending_operations`, whose auto-increment key gives FIFO order, and
//! abandoned ones in `dead_letters` under their original queue position.
//! Moving an operation between the two is a single store batch.

use crate::error::{SyncError, SyncResult};
use expensync_core::{Key, LocalStore, Record, WriteBatch, DEAD_LETTERS, ID_FIELD, PENDING_OPERATIONS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

const OPERATION_ID: &str = "operation_id";

/// Kind of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Full-row write.
    Insert,
    /// Partial update.
    Update,
    /// Row removal.
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        })
    }
}

/// A mutation waiting to be acknowledged by the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Queue position, assigned by the store.
    pub operation_id: u64,
    /// Kind of mutation.
    pub kind: OperationKind,
    /// Target collection.
    pub collection: String,
    /// Full row for inserts, changed fields for updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Record>,
    /// Target row for updates and deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    /// Milliseconds since the epoch when queued.
    pub enqueued_at: u64,
    /// Failed replays so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PendingOperation {
    /// The row this operation targets.
    pub fn target_id(&self) -> Option<&str> {
        match self.kind {
            OperationKind::Insert => self.payload.as_ref().and_then(Record::id),
            OperationKind::Update | OperationKind::Delete => self.record_id.as_deref(),
        }
    }

    fn to_record(&self) -> SyncResult<Record> {
        Ok(Record::from_value(serde_json::to_value(self)?)?)
    }

    fn from_record(record: Record) -> SyncResult<Self> {
        Ok(serde_json::from_value(record.into_value())?)
    }
}

/// An operation that hit the retry ceiling, kept for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The operation as it was last queued.
    #[serde(flatten)]
    pub operation: PendingOperation,
    /// Milliseconds since the epoch when abandoned.
    pub abandoned_at: u64,
    /// Why it was abandoned.
    pub reason: String,
}

impl DeadLetter {
    /// Queue position of the abandoned operation.
    pub fn operation_id(&self) -> u64 {
        self.operation.operation_id
    }
}

/// Queue handle over a shared [`LocalStore`].
#[derive(Debug, Clone)]
pub struct PendingQueue {
    store: Arc<LocalStore>,
}

impl PendingQueue {
    /// Creates a queue handle.
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    /// Appends an operation and returns it with its assigned position.
    pub fn enqueue(
        &self,
        kind: OperationKind,
        collection: &str,
        record_id: Option<&str>,
        payload: Option<Record>,
        last_error: Option<String>,
    ) -> SyncResult<PendingOperation> {
        let op = PendingOperation {
            operation_id: 0,
            kind,
            collection: collection.to_string(),
            payload,
            record_id: record_id.map(str::to_string),
            enqueued_at: now_millis(),
            retry_count: 0,
            last_error,
        };
        self.append(op)
    }

    fn append(&self, op: PendingOperation) -> SyncResult<PendingOperation> {
        let mut record = op.to_record()?;
        record.remove(OPERATION_ID);
        let stored = PendingOperation::from_record(self.store.put(PENDING_OPERATIONS, record)?)?;
        debug!(
            operation_id = stored.operation_id,
            kind = %stored.kind,
            collection = %stored.collection,
            "operation queued"
        );
        Ok(stored)
    }

    /// Every queued operation in FIFO order.
    pub fn list(&self) -> SyncResult<Vec<PendingOperation>> {
        self.store
            .get_all(PENDING_OPERATIONS, None)?
            .into_iter()
            .map(PendingOperation::from_record)
            .collect()
    }

    /// Queued operations for one collection, in FIFO order.
    pub fn for_collection(&self, collection: &str) -> SyncResult<Vec<PendingOperation>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|op| op.collection == collection)
            .collect())
    }

    /// Returns true if any queued operation targets `collection/id`.
    pub fn has_pending(&self, collection: &str, id: &str) -> SyncResult<bool> {
        Ok(self
            .list()?
            .iter()
            .any(|op| op.collection == collection && op.target_id() == Some(id)))
    }

    /// Number of queued operations.
    pub fn len(&self) -> SyncResult<usize> {
        Ok(self.store.count(PENDING_OPERATIONS)?)
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Removes an acknowledged operation.
    pub fn remove(&self, operation_id: u64) -> SyncResult<bool> {
        Ok(self.store.delete(PENDING_OPERATIONS, operation_id)?)
    }

    /// Records a failed replay in place.
    pub fn record_failure(&self, op: &PendingOperation, error: &str) -> SyncResult<PendingOperation> {
        let mut updated = op.clone();
        updated.retry_count = op.retry_count.saturating_add(1);
        updated.last_error = Some(error.to_string());
        self.store.put(PENDING_OPERATIONS, updated.to_record()?)?;
        Ok(updated)
    }

    /// Moves an operation to the dead letters in one batch.
    pub fn abandon(&self, op: &PendingOperation, reason: &str) -> SyncResult<DeadLetter> {
        let mut operation = op.clone();
        operation.retry_count = op.retry_count.saturating_add(1);
        operation.last_error = Some(reason.to_string());
        let letter = DeadLetter {
            operation,
            abandoned_at: now_millis(),
            reason: reason.to_string(),
        };

        let batch = WriteBatch::new()
            .delete(PENDING_OPERATIONS, op.operation_id)
            .put(DEAD_LETTERS, Record::from_value(serde_json::to_value(&letter)?)?);
        self.store.write(batch)?;
        Ok(letter)
    }

    /// Every dead letter, oldest queue position first.
    pub fn dead_letters(&self) -> SyncResult<Vec<DeadLetter>> {
        self.store
            .get_all(DEAD_LETTERS, None)?
            .into_iter()
            .map(|r| serde_json::from_value(r.into_value()).map_err(SyncError::from))
            .collect()
    }

    fn dead_letter(&self, operation_id: u64) -> SyncResult<Option<DeadLetter>> {
        self.store
            .get(DEAD_LETTERS, operation_id)?
            .map(|r| serde_json::from_value(r.into_value()).map_err(SyncError::from))
            .transpose()
    }

    /// Puts a dead letter back at the end of the queue with a fresh retry
    /// budget. Returns `None` if there is no such dead letter.
    pub fn requeue(&self, operation_id: u64) -> SyncResult<Option<PendingOperation>> {
        let Some(letter) = self.dead_letter(operation_id)? else {
            return Ok(None);
        };

        let mut op = letter.operation;
        op.retry_count = 0;
        op.last_error = None;
        op.enqueued_at = now_millis();
        let mut record = op.to_record()?;
        record.remove(OPERATION_ID);

        let batch = WriteBatch::new()
            .delete(DEAD_LETTERS, Key::Int(operation_id))
            .put(PENDING_OPERATIONS, record);
        let stored = self
            .store
            .write(batch)?
            .pop()
            .ok_or_else(|| SyncError::validation("requeue wrote nothing"))?;
        Ok(Some(PendingOperation::from_record(stored)?))
    }

    /// Deletes a dead letter. Returns false if there was none.
    pub fn discard(&self, operation_id: u64) -> SyncResult<bool> {
        Ok(self.store.delete(DEAD_LETTERS, operation_id)?)
    }
}

/// Returns the row id of a record, which must be a non-empty string.
pub(crate) fn record_id(collection: &str, record: &Record) -> SyncResult<String> {
    record
        .get(ID_FIELD)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            SyncError::validation(format!("record for {collection} needs a string '{ID_FIELD}'"))
        })
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use expensync_core::Schema;
    use serde_json::json;

    fn queue() -> PendingQueue {
        PendingQueue::new(Arc::new(
            LocalStore::open_in_memory(Schema::expense_tracker()).unwrap(),
        ))
    }

    fn rec(value: serde_json::Value) -> Record {
        Record::from_value(value).unwrap()
    }

    #[test]
    fn positions_increase() {
        let q = queue();
        let a = q
            .enqueue(OperationKind::Insert, "expenses", None, Some(rec(json!({"id": "e1"}))), None)
            .unwrap();
        let b = q.enqueue(OperationKind::Delete, "expenses", Some("e1"), None, None).unwrap();
        assert!(b.operation_id > a.operation_id);
        assert_eq!(a.target_id(), Some("e1"));
        assert_eq!(b.target_id(), Some("e1"));

        let listed: Vec<u64> = q.list().unwrap().iter().map(|op| op.operation_id).collect();
        assert_eq!(listed, vec![a.operation_id, b.operation_id]);
        assert!(q.has_pending("expenses", "e1").unwrap());
        assert!(!q.has_pending("budgets", "e1").unwrap());
    }

    #[test]
    fn failure_is_recorded_in_place() {
        let q = queue();
        let op = q.enqueue(OperationKind::Delete, "expenses", Some("e1"), None, None).unwrap();
        let updated = q.record_failure(&op, "boom").unwrap();

        let listed = q.list().unwrap();
        assert_eq!(listed, vec![updated.clone()]);
        assert_eq!(updated.retry_count, 1);
        assert_eq!(updated.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn abandon_then_requeue() {
        let q = queue();
        let op = q
            .enqueue(OperationKind::Update, "expenses", Some("e1"), Some(rec(json!({"amount": 5}))), None)
            .unwrap();
        let letter = q.abandon(&op, "rejected").unwrap();
        assert!(q.is_empty().unwrap());
        assert_eq!(q.dead_letters().unwrap(), vec![letter.clone()]);
        assert_eq!(letter.operation_id(), op.operation_id);

        let requeued = q.requeue(op.operation_id).unwrap().unwrap();
        assert!(requeued.operation_id > op.operation_id);
        assert_eq!(requeued.retry_count, 0);
        assert_eq!(requeued.payload, op.payload);
        assert!(q.dead_letters().unwrap().is_empty());
        assert!(q.requeue(op.operation_id).unwrap().is_none());
    }

    #[test]
    fn discard_removes_dead_letter() {
        let q = queue();
        let op = q.enqueue(OperationKind::Delete, "expenses", Some("e1"), None, None).unwrap();
        q.abandon(&op, "gone").unwrap();
        assert!(q.discard(op.operation_id).unwrap());
        assert!(!q.discard(op.operation_id).unwrap());
    }

    #[test]
    fn record_id_must_be_a_string() {
        assert_eq!(record_id("expenses", &rec(json!({"id": "e1"}))).unwrap(), "e1");
        assert!(record_id("expenses", &rec(json!({"id": 7}))).is_err());
        assert!(record_id("expenses", &rec(json!({"id": ""}))).is_err());
        assert!(record_id("expenses", &rec(json!({}))).is_err());
    }
}
