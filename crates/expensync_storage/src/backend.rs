//! The storage backend trait.

use crate::error::StorageResult;

/// An append-oriented byte store.
///
/// The local store writes its journal through this trait. A backend only
/// guarantees that bytes read back at an offset are the bytes that were
/// appended there; framing, checksums and recovery belong to the caller.
///
/// # Invariants
///
/// - `append` returns the offset the data starts at, which is the size
///   before the call
/// - `sync` makes every appended byte survive process termination
/// - `replace` is all-or-nothing: after a crash the backend holds either
///   the old or the new contents
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range extends past
    /// the current size, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset it was written at.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Flushes data and metadata to durable media.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Drops every byte at or after `new_size`.
    ///
    /// Used to cut a torn trailing write off the journal.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` exceeds the current size or the
    /// truncation fails.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Atomically replaces the whole contents with `data`.
    ///
    /// Used when the journal is compacted into a single snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the new contents cannot be written.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Reads the whole contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        self.read_at(0, size as usize)
    }
}
