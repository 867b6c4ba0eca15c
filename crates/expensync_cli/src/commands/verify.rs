//! Verify command implementation.

use expensync_core::journal::{self, JournalReport};
use expensync_core::dir;
use expensync_storage::{FileBackend, StorageBackend};
use std::path::Path;

/// Verification result.
#[derive(Debug)]
pub struct VerifyResult {
    /// Journal summary, when the journal scanned cleanly.
    pub journal: Option<JournalReport>,
    /// Schema version recorded in the manifest.
    pub manifest_version: Option<u32>,
    /// Problems found.
    pub errors: Vec<String>,
    /// Things that recovery will fix on the next open.
    pub warnings: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying store at {}", path.display());
    println!();

    let result = verify(path)?;

    if let Some(version) = result.manifest_version {
        println!("Manifest: schema v{version}");
    }
    if let Some(report) = &result.journal {
        println!(
            "Journal:  {} batches, {} operations, {} valid bytes",
            report.batches, report.operations, report.valid_bytes
        );
    }
    for warning in &result.warnings {
        println!("  WARNING: {warning}");
    }
    for error in &result.errors {
        println!("  ERROR: {error}");
    }

    println!();
    if result.is_ok() {
        println!("✓ Store verification passed");
        Ok(())
    } else {
        println!("✗ Store verification failed");
        Err("Verification failed".into())
    }
}

fn verify(path: &Path) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let journal_path = dir::journal_path(path);
    if !journal_path.exists() {
        return Err(format!("No journal found at {}", journal_path.display()).into());
    }

    let mut result = VerifyResult {
        journal: None,
        manifest_version: None,
        errors: Vec::new(),
        warnings: Vec::new(),
    };

    match dir::read_manifest(path) {
        Ok(Some(manifest)) => result.manifest_version = Some(manifest.schema_version),
        Ok(None) => result.warnings.push("manifest missing".to_string()),
        Err(e) => result.errors.push(format!("manifest: {e}")),
    }

    let backend = FileBackend::open(&journal_path)?;
    let bytes = backend.read_all()?;
    match journal::verify(&bytes) {
        Ok(report) => {
            if report.torn_bytes > 0 {
                result.warnings.push(format!(
                    "{} byte incomplete trailing write, discarded on next open",
                    report.torn_bytes
                ));
            }
            result.journal = Some(report);
        }
        Err(e) => result.errors.push(e.to_string()),
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::seed_store;

    #[test]
    fn clean_store_passes() {
        let dir = tempfile::tempdir().unwrap();
        seed_store(dir.path());

        let result = verify(dir.path()).unwrap();
        assert!(result.is_ok());
        assert!(result.warnings.is_empty());
        assert!(result.journal.unwrap().batches > 0);
    }

    #[test]
    fn flipped_byte_fails() {
        let dir = tempfile::tempdir().unwrap();
        seed_store(dir.path());
        let journal = dir::journal_path(dir.path());
        let mut bytes = std::fs::read(&journal).unwrap();
        let at = bytes.len() - 6;
        bytes[at] ^= 0x55;
        std::fs::write(&journal, bytes).unwrap();

        let result = verify(dir.path()).unwrap();
        assert!(!result.is_ok());
    }
}
