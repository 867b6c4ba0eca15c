//! # Expensync Storage
//!
//! Byte-level storage for the expensync local store.
//!
//! Backends here know nothing about journals, records or collections. They
//! hold a single growable byte sequence that the store appends committed
//! batches to, reads back on recovery, truncates after a torn write and
//! rewrites wholesale on compaction.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - ephemeral stores and tests
//! - [`FileBackend`] - one file on disk
//!
//! ## Example
//!
//! ```rust
//! use expensync_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"batch-1").unwrap();
//! assert_eq!(backend.read_at(offset, 7).unwrap(), b"batch-1");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
