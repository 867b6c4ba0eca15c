//! Compact command implementation.

use super::{format_size, open_store};
use std::path::Path;

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Compacting journal at {}", path.display());
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let store = open_store(path)?;
    let stats = store.stats()?;
    let records: usize = stats.collections.values().sum();
    println!("  Journal size: {}", format_size(stats.journal_bytes));
    println!("  Live records: {records}");

    if !dry_run {
        let report = store.compact()?;
        let saved = report.before.saturating_sub(report.after);
        println!();
        println!("  Size after:   {}", format_size(report.after));
        println!(
            "  Space saved:  {} ({:.1}%)",
            format_size(saved),
            if report.before > 0 {
                saved as f64 / report.before as f64 * 100.0
            } else {
                0.0
            }
        );
        println!("✓ Compaction complete");
    }

    store.close()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::seed_store;
    use expensync_core::dir;

    #[test]
    fn compaction_keeps_store_readable() {
        let dir = tempfile::tempdir().unwrap();
        seed_store(dir.path());

        run(dir.path(), true).unwrap();
        run(dir.path(), false).unwrap();

        let store = open_store(dir.path()).unwrap();
        assert!(store.get("expenses", "e1").unwrap().is_some());
        assert!(std::fs::metadata(dir::journal_path(dir.path())).unwrap().len() > 0);
    }
}
