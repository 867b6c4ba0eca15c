//! Inspect command implementation.

use super::{format_size, open_store};
use expensync_core::{DEAD_LETTERS, PENDING_OPERATIONS};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Schema version after opening.
    pub schema_version: u32,
    /// Schema version before opening, when an upgrade ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgraded_from: Option<u32>,
    /// Journal size in bytes.
    pub journal_bytes: u64,
    /// Sequence of the last committed batch.
    pub last_sequence: u64,
    /// Operations waiting for the remote.
    pub pending_operations: usize,
    /// Abandoned operations.
    pub dead_letters: usize,
    /// Record counts (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collections: Option<BTreeMap<String, usize>>,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_collections: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(path, show_collections)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn inspect(path: &Path, show_collections: bool) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let stats = store.stats()?;
    let upgrade = store.upgrade_report();

    let result = InspectResult {
        path: path.display().to_string(),
        schema_version: stats.schema_version,
        upgraded_from: upgrade.upgraded().then_some(upgrade.from_version),
        journal_bytes: stats.journal_bytes,
        last_sequence: stats.last_sequence,
        pending_operations: stats.collections.get(PENDING_OPERATIONS).copied().unwrap_or(0),
        dead_letters: stats.collections.get(DEAD_LETTERS).copied().unwrap_or(0),
        collections: show_collections.then(|| stats.collections.clone()),
    };
    store.close()?;
    Ok(result)
}

fn print_text_output(result: &InspectResult) {
    println!("Expensync Store Inspection");
    println!("==========================");
    println!();
    println!("Path: {}", result.path);
    match result.upgraded_from {
        Some(from) => println!("Schema: v{} (upgraded from v{})", result.schema_version, from),
        None => println!("Schema: v{}", result.schema_version),
    }
    println!();
    println!("Journal:");
    println!("  Size:          {}", format_size(result.journal_bytes));
    println!("  Last sequence: {}", result.last_sequence);
    println!();
    println!("Sync:");
    println!("  Pending operations: {}", result.pending_operations);
    println!("  Dead letters:       {}", result.dead_letters);

    if let Some(collections) = &result.collections {
        println!();
        println!("Collections:");
        for (name, count) in collections {
            println!("  {name:<20} {count} records");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::seed_store;

    #[test]
    fn counts_collections() {
        let dir = tempfile::tempdir().unwrap();
        seed_store(dir.path());

        let result = inspect(dir.path(), true).unwrap();
        assert_eq!(result.schema_version, expensync_core::EXPENSE_TRACKER_VERSION);
        assert_eq!(result.pending_operations, 0);
        assert_eq!(result.collections.unwrap().get("expenses"), Some(&1));
        assert!(result.upgraded_from.is_none());
    }
}
