//! Append-only journal of committed batches.

mod batch;
mod frame;

pub use batch::{Batch, BatchOp};
pub use frame::{compute_crc32, encode_frame, scan, Scan, JOURNAL_MAGIC, JOURNAL_VERSION};

use crate::error::StoreResult;
use expensync_storage::StorageBackend;
use tracing::{debug, warn};

/// Summary of a journal produced by [`verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalReport {
    /// Number of complete batches.
    pub batches: usize,
    /// Number of ops across all batches.
    pub operations: usize,
    /// Sequence of the last batch, if any.
    pub last_sequence: Option<u64>,
    /// Length of the valid prefix.
    pub valid_bytes: u64,
    /// Length of an incomplete trailing frame.
    pub torn_bytes: u64,
}

/// Checks journal bytes without modifying anything.
///
/// # Errors
///
/// Returns [`crate::StoreError::JournalCorruption`] on the first bad frame.
pub fn verify(bytes: &[u8]) -> StoreResult<JournalReport> {
    let scan = scan(bytes)?;
    Ok(JournalReport {
        batches: scan.batches.len(),
        operations: scan.batches.iter().map(|b| b.ops.len()).sum(),
        last_sequence: scan.batches.last().map(|b| b.sequence),
        valid_bytes: scan.valid_len,
        torn_bytes: scan.torn_bytes,
    })
}

/// Writer side of the journal.
pub(crate) struct Journal {
    backend: Box<dyn StorageBackend>,
    next_sequence: u64,
    sync_on_commit: bool,
    /// Size right after recovery or the last rewrite.
    baseline: u64,
}

impl Journal {
    /// Reads every committed batch from `backend` and cuts off a torn tail.
    pub(crate) fn recover(
        mut backend: Box<dyn StorageBackend>,
        sync_on_commit: bool,
    ) -> StoreResult<(Self, Vec<Batch>)> {
        let bytes = backend.read_all()?;
        let scan = scan(&bytes)?;
        if scan.torn_bytes > 0 {
            warn!(
                torn_bytes = scan.torn_bytes,
                valid_bytes = scan.valid_len,
                "discarding incomplete journal tail"
            );
            backend.truncate(scan.valid_len)?;
        }

        let next_sequence = scan.batches.last().map_or(1, |b| b.sequence + 1);
        debug!(batches = scan.batches.len(), next_sequence, "journal recovered");

        Ok((
            Self {
                backend,
                next_sequence,
                sync_on_commit,
                baseline: scan.valid_len,
            },
            scan.batches,
        ))
    }

    /// Appends one batch. Nothing is written if encoding fails, and a
    /// partially written frame is cut off again on I/O failure.
    pub(crate) fn commit(&mut self, ops: Vec<BatchOp>) -> StoreResult<Batch> {
        let batch = Batch {
            sequence: self.next_sequence,
            ops,
        };
        let frame = encode_frame(&batch)?;

        let before = self.backend.size()?;
        let written = self.backend.append(&frame).and_then(|_| {
            if self.sync_on_commit {
                self.backend.flush()?;
                self.backend.sync()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            if let Err(cleanup) = self.backend.truncate(before) {
                warn!(error = %cleanup, "could not roll back partial journal frame");
            }
            return Err(e.into());
        }

        self.next_sequence += 1;
        Ok(batch)
    }

    /// Replaces the whole journal with a single batch.
    pub(crate) fn rewrite(&mut self, ops: Vec<BatchOp>) -> StoreResult<Batch> {
        let batch = Batch {
            sequence: self.next_sequence,
            ops,
        };
        let frame = encode_frame(&batch)?;
        self.backend.replace(&frame)?;
        self.next_sequence += 1;
        self.baseline = frame.len() as u64;
        Ok(batch)
    }

    pub(crate) fn size(&self) -> StoreResult<u64> {
        Ok(self.backend.size()?)
    }

    /// True once the journal is over `threshold` and has at least doubled
    /// since it was last rewritten. Zero disables the check.
    pub(crate) fn should_compact(&self, threshold: u64) -> StoreResult<bool> {
        if threshold == 0 {
            return Ok(false);
        }
        let size = self.size()?;
        Ok(size > threshold && size >= self.baseline.saturating_mul(2))
    }

    pub(crate) fn last_sequence(&self) -> u64 {
        self.next_sequence - 1
    }

    pub(crate) fn sync(&mut self) -> StoreResult<()> {
        self.backend.flush()?;
        self.backend.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expensync_storage::InMemoryBackend;

    fn clear(collection: &str) -> BatchOp {
        BatchOp::Clear {
            collection: collection.into(),
        }
    }

    #[test]
    fn commit_assigns_sequences() {
        let (mut journal, batches) =
            Journal::recover(Box::new(InMemoryBackend::new()), true).unwrap();
        assert!(batches.is_empty());
        assert_eq!(journal.last_sequence(), 0);

        assert_eq!(journal.commit(vec![clear("a")]).unwrap().sequence, 1);
        assert_eq!(journal.commit(vec![clear("b")]).unwrap().sequence, 2);
        assert_eq!(journal.last_sequence(), 2);
    }

    #[test]
    fn recover_truncates_torn_tail() {
        let mut bytes = encode_frame(&Batch {
            sequence: 7,
            ops: vec![clear("a")],
        })
        .unwrap();
        let good = bytes.len() as u64;
        bytes.extend_from_slice(&JOURNAL_MAGIC);

        let (mut journal, batches) =
            Journal::recover(Box::new(InMemoryBackend::with_data(bytes)), true).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(journal.size().unwrap(), good);
        assert_eq!(journal.commit(vec![]).unwrap().sequence, 8);
    }

    #[test]
    fn rewrite_leaves_single_batch() {
        let (mut journal, _) = Journal::recover(Box::new(InMemoryBackend::new()), false).unwrap();
        for name in ["a", "b", "c"] {
            journal.commit(vec![clear(name)]).unwrap();
        }
        let snapshot = journal.rewrite(vec![clear("z")]).unwrap();
        assert_eq!(snapshot.sequence, 4);

        let frame = encode_frame(&snapshot).unwrap();
        assert_eq!(journal.size().unwrap(), frame.len() as u64);
    }

    #[test]
    fn verify_summarises() {
        let mut bytes = Vec::new();
        for seq in 1..=3 {
            bytes.extend(
                encode_frame(&Batch {
                    sequence: seq,
                    ops: vec![clear("a"), clear("b")],
                })
                .unwrap(),
            );
        }
        bytes.push(b'E');

        let report = verify(&bytes).unwrap();
        assert_eq!(report.batches, 3);
        assert_eq!(report.operations, 6);
        assert_eq!(report.last_sequence, Some(3));
        assert_eq!(report.torn_bytes, 1);
    }
}
