//! # Expensync Core
//!
//! The local durable store of the expensync offline-first engine.
//!
//! The store keeps named collections of JSON records in memory and persists
//! every change as a checksummed batch in an append-only journal. On open
//! the journal is replayed, a torn trailing write is discarded, and the
//! schema is upgraded through registered migrations.
//!
//! ## Guarantees
//!
//! - A committed batch survives process termination
//! - Readers never observe part of a batch
//! - Auto-increment keys never move backwards, even across restarts
//! - Each migration takes effect exactly once
//!
//! ## Example
//!
//! ```rust
//! use expensync_core::{Expense, LocalStore, Schema};
//!
//! let store = LocalStore::open_in_memory(Schema::expense_tracker()).unwrap();
//! let expenses = store.collection::<Expense>();
//! expenses.put(&Expense::new("u1", 4.5, "2024-05-01")).unwrap();
//! assert_eq!(expenses.all_owned("u1").unwrap().len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
pub mod dir;
mod error;
pub mod journal;
mod manifest;
pub mod migration;
mod model;
mod record;
mod schema;
mod state;
mod store;
mod typed;
mod write;

pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use manifest::Manifest;
pub use migration::{Migration, MigrationContext, SchemaVersion, UpgradeReport};
pub use model::{Budget, Category, Expense, ExpensePatch, Subcategory};
pub use record::{new_record_id, Key, Record, ID_FIELD};
pub use schema::{
    CollectionSpec, KeyPath, RefreshBusinessCategories, Schema, SchemaBuilder, BUDGETS,
    CATEGORIES, DEAD_LETTERS, EXPENSES, EXPENSE_TRACKER_VERSION, PENDING_OPERATIONS,
    SUBCATEGORIES,
};
pub use store::{CompactionReport, LocalStore, StoreStats};
pub use typed::{Collection, Document};
pub use write::{WriteBatch, WriteOp};
