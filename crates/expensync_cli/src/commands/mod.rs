//! CLI command implementations.

pub mod compact;
pub mod dead_letters;
pub mod inspect;
pub mod queue;
pub mod verify;

use expensync_core::{LocalStore, Schema, StoreConfig};
use std::path::Path;

/// Opens an existing store with the expense tracker schema.
///
/// Opening upgrades an older store, exactly as the application would.
pub(crate) fn open_store(path: &Path) -> Result<LocalStore, Box<dyn std::error::Error>> {
    if !expensync_core::dir::journal_path(path).exists() {
        return Err(format!("No store found at {}", path.display()).into());
    }
    let config = StoreConfig::new().create_if_missing(false);
    Ok(LocalStore::open_with_config(
        path,
        Schema::expense_tracker(),
        config,
    )?)
}

/// Human-readable byte count.
pub(crate) fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
