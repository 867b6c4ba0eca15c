//! Version-gated schema upgrades.
//!
//! Every store records the schema version it was last opened with. Opening
//! with a newer [`crate::Schema`] runs each registered migration whose
//! version lies in `(stored, requested]`, lowest first. A migration's steps
//! and the version bump are committed as one journal batch, so each
//! migration takes effect exactly once even if the process dies mid-upgrade.
//!
//! Migrations are forward-only. Opening with an older schema is refused.
//!
//! ```rust
//! use expensync_core::migration::{Migration, MigrationContext, SchemaVersion};
//! use expensync_core::StoreResult;
//!
//! struct DropLegacyReceipts;
//!
//! impl Migration for DropLegacyReceipts {
//!     fn version(&self) -> SchemaVersion { 5 }
//!     fn name(&self) -> &str { "drop_legacy_receipts" }
//!     fn up(&self, ctx: &mut MigrationContext) -> StoreResult<()> {
//!         ctx.drop_collection("receipts");
//!         Ok(())
//!     }
//! }
//! ```

use crate::error::{StoreError, StoreResult};
use std::collections::BTreeMap;

/// Schema version number.
pub type SchemaVersion = u32;

/// Information about a registered migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationInfo {
    /// Target version of the migration.
    pub version: SchemaVersion,
    /// Short name.
    pub name: String,
    /// What the migration does.
    pub description: Option<String>,
}

/// A step requested by a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStep {
    /// Remove every record of a collection, keeping the collection.
    ClearCollection {
        /// Collection name.
        name: String,
    },
    /// Remove a collection and its records.
    DropCollection {
        /// Collection name.
        name: String,
    },
    /// A note for the upgrade log with no effect on data.
    Custom {
        /// Description of the step.
        description: String,
    },
}

/// Collects the steps of one migration.
#[derive(Debug)]
pub struct MigrationContext {
    /// Version the store is at before this migration.
    pub from_version: SchemaVersion,
    /// Version this migration upgrades to.
    pub to_version: SchemaVersion,
    steps: Vec<MigrationStep>,
}

impl MigrationContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new(from_version: SchemaVersion, to_version: SchemaVersion) -> Self {
        Self {
            from_version,
            to_version,
            steps: Vec::new(),
        }
    }

    /// Requests that a collection be emptied.
    pub fn clear_collection(&mut self, name: &str) {
        self.steps.push(MigrationStep::ClearCollection {
            name: name.to_string(),
        });
    }

    /// Requests that a collection be removed.
    pub fn drop_collection(&mut self, name: &str) {
        self.steps.push(MigrationStep::DropCollection {
            name: name.to_string(),
        });
    }

    /// Records a descriptive step.
    pub fn custom(&mut self, description: &str) {
        self.steps.push(MigrationStep::Custom {
            description: description.to_string(),
        });
    }

    /// Steps requested so far.
    #[must_use]
    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    pub(crate) fn into_steps(self) -> Vec<MigrationStep> {
        self.steps
    }
}

/// A schema migration.
pub trait Migration: Send + Sync {
    /// The version this migration upgrades to.
    fn version(&self) -> SchemaVersion;

    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Optional description.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Records the migration's steps.
    ///
    /// # Errors
    ///
    /// An error aborts the upgrade. Nothing from this migration is committed.
    fn up(&self, ctx: &mut MigrationContext) -> StoreResult<()>;
}

/// A migration applied while opening a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    /// Migration version.
    pub version: SchemaVersion,
    /// Migration name.
    pub name: String,
    /// Steps that were committed.
    pub steps: Vec<MigrationStep>,
}

/// Outcome of the upgrade performed by `open`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeReport {
    /// Version found in the store (0 for a new store).
    pub from_version: SchemaVersion,
    /// Version after the upgrade.
    pub to_version: SchemaVersion,
    /// Migrations that ran, in order.
    pub applied: Vec<AppliedMigration>,
}

impl UpgradeReport {
    /// Returns true if the store changed version.
    #[must_use]
    pub fn upgraded(&self) -> bool {
        self.to_version > self.from_version
    }
}

/// Registry of migrations, ordered by version.
#[derive(Default)]
pub struct MigrationManager {
    migrations: BTreeMap<SchemaVersion, Box<dyn Migration>>,
}

impl MigrationManager {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding one migration.
    #[must_use]
    pub fn with_migration(migration: impl Migration + 'static) -> Self {
        let mut migrations: BTreeMap<SchemaVersion, Box<dyn Migration>> = BTreeMap::new();
        migrations.insert(migration.version(), Box::new(migration));
        Self { migrations }
    }

    /// Registers a migration.
    ///
    /// # Errors
    ///
    /// Fails if the version is zero or already registered.
    pub fn register(&mut self, migration: Box<dyn Migration>) -> StoreResult<()> {
        let version = migration.version();
        if version == 0 {
            return Err(StoreError::migration_failed(format!(
                "migration '{}' has version 0",
                migration.name()
            )));
        }
        if self.migrations.contains_key(&version) {
            return Err(StoreError::migration_failed(format!(
                "migration version {version} already registered"
            )));
        }
        self.migrations.insert(version, migration);
        Ok(())
    }

    /// Lists registered migrations in version order.
    #[must_use]
    pub fn list(&self) -> Vec<MigrationInfo> {
        self.migrations.values().map(|m| info(m.as_ref())).collect()
    }

    /// Highest registered version.
    #[must_use]
    pub fn latest_version(&self) -> Option<SchemaVersion> {
        self.migrations.keys().next_back().copied()
    }

    /// Migrations with `from < version <= to`, lowest first.
    pub fn pending(
        &self,
        from: SchemaVersion,
        to: SchemaVersion,
    ) -> impl Iterator<Item = &dyn Migration> {
        self.migrations
            .iter()
            .filter(move |(v, _)| **v > from && **v <= to)
            .map(|(_, m)| m.as_ref())
    }

    /// Runs one migration and returns the steps it requested.
    ///
    /// # Errors
    ///
    /// Propagates the migration's error, wrapped with its name.
    pub fn plan(
        migration: &dyn Migration,
        from: SchemaVersion,
    ) -> StoreResult<Vec<MigrationStep>> {
        let mut ctx = MigrationContext::new(from, migration.version());
        migration.up(&mut ctx).map_err(|e| {
            StoreError::migration_failed(format!("{} (v{}): {e}", migration.name(), migration.version()))
        })?;
        Ok(ctx.into_steps())
    }
}

fn info(m: &dyn Migration) -> MigrationInfo {
    MigrationInfo {
        version: m.version(),
        name: m.name().to_string(),
        description: m.description().map(String::from),
    }
}
