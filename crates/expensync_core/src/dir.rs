//! Store directory layout and locking.
//!
//! ```text
//! <store>/
//! ├─ MANIFEST      # schema version and collection names
//! ├─ LOCK          # exclusive advisory lock, one process at a time
//! └─ journal.log   # committed batches
//! ```

use crate::error::{StoreError, StoreResult};
use crate::manifest::Manifest;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_TEMP: &str = "MANIFEST.tmp";
const LOCK_FILE: &str = "LOCK";
const JOURNAL_FILE: &str = "journal.log";

/// An open store directory. Holds the exclusive lock until dropped.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock: File,
}

impl StoreDir {
    /// Opens `path`, creating it when allowed, and takes the lock.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidFormat`] if the directory is missing and
    ///   `create_if_missing` is false, or the path is not a directory
    /// - [`StoreError::Locked`] if another handle holds the lock
    pub fn open(path: &Path, create_if_missing: bool) -> StoreResult<Self> {
        if !path.exists() {
            if !create_if_missing {
                return Err(StoreError::invalid_format(format!(
                    "store directory does not exist: {}",
                    path.display()
                )));
            }
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(StoreError::invalid_format(format!(
                "not a directory: {}",
                path.display()
            )));
        }

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    /// Store directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the journal file.
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        journal_path(&self.path)
    }

    /// Path of the manifest file.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    /// Loads the manifest. `None` for a store that has never been opened.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or decoded.
    pub fn load_manifest(&self) -> StoreResult<Option<Manifest>> {
        read_manifest(&self.path)
    }

    /// Writes the manifest with write, sync, rename.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails. The previous manifest stays in
    /// place in that case.
    pub fn save_manifest(&self, manifest: &Manifest) -> StoreResult<()> {
        let temp = self.path.join(MANIFEST_TEMP);
        {
            let mut file = File::create(&temp)?;
            file.write_all(&manifest.encode())?;
            file.sync_all()?;
        }
        fs::rename(&temp, self.manifest_path())?;
        self.sync_directory()
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> StoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Path of the journal inside a store directory.
#[must_use]
pub fn journal_path(store: &Path) -> PathBuf {
    store.join(JOURNAL_FILE)
}

/// Reads the manifest of a store directory without taking the lock.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or decoded.
pub fn read_manifest(store: &Path) -> StoreResult<Option<Manifest>> {
    let path = store.join(MANIFEST_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(&path)?;
    if data.is_empty() {
        return Ok(None);
    }
    Manifest::decode(&data).map(Some)
}
