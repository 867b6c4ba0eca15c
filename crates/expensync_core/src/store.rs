//! The local durable store.

use crate::config::StoreConfig;
use crate::dir::StoreDir;
use crate::error::{StoreError, StoreResult};
use crate::journal::{BatchOp, Journal};
use crate::manifest::Manifest;
use crate::migration::{AppliedMigration, MigrationManager, MigrationStep, SchemaVersion, UpgradeReport};
use crate::record::{Key, Record};
use crate::schema::{CollectionSpec, Schema};
use crate::state::{CollectionState, PutPlanner, StoreState};
use crate::write::{WriteBatch, WriteOp};
use expensync_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Counters describing an open store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    /// Current schema version.
    pub schema_version: SchemaVersion,
    /// Sequence of the last committed batch.
    pub last_sequence: u64,
    /// Journal size in bytes.
    pub journal_bytes: u64,
    /// Record count per collection.
    pub collections: BTreeMap<String, usize>,
}

/// Journal sizes around a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    /// Bytes before.
    pub before: u64,
    /// Bytes after.
    pub after: u64,
}

/// Named collections of JSON records, persisted through a journal.
///
/// Every mutation is committed to the journal as one batch before it
/// becomes visible. Readers take a shared lock and writers an exclusive
/// one, so a reader sees a batch either entirely or not at all.
///
/// ```rust
/// use expensync_core::{LocalStore, Record, Schema};
/// use serde_json::json;
///
/// let store = LocalStore::open_in_memory(Schema::expense_tracker()).unwrap();
/// let record = Record::from_value(json!({"id": "e1", "user_id": "u1", "amount": 12.5})).unwrap();
/// store.put("expenses", record).unwrap();
///
/// assert_eq!(store.get_all("expenses", Some("u1")).unwrap().len(), 1);
/// ```
pub struct LocalStore {
    state: RwLock<StoreState>,
    journal: Mutex<Journal>,
    dir: Option<StoreDir>,
    specs: BTreeMap<String, CollectionSpec>,
    config: StoreConfig,
    upgrade: UpgradeReport,
}

impl LocalStore {
    /// Opens the store in directory `path` with default options.
    ///
    /// # Errors
    ///
    /// Fails if the directory is locked, the manifest or journal is
    /// corrupt, the store is newer than `schema`, or a migration fails.
    pub fn open(path: &Path, schema: Schema) -> StoreResult<Self> {
        Self::open_with_config(path, schema, StoreConfig::default())
    }

    /// Opens the store in directory `path`.
    ///
    /// # Errors
    ///
    /// See [`LocalStore::open`].
    pub fn open_with_config(path: &Path, schema: Schema, config: StoreConfig) -> StoreResult<Self> {
        let dir = StoreDir::open(path, config.create_if_missing)?;
        let manifest = dir.load_manifest()?;
        if let Some(m) = &manifest {
            if m.schema_version > schema.version() {
                return Err(StoreError::SchemaDowngrade {
                    stored: m.schema_version,
                    requested: schema.version(),
                });
            }
        }

        let backend = FileBackend::open(&dir.journal_path())?;
        let store = Self::assemble(
            Box::new(backend),
            Some(dir),
            schema,
            config,
            manifest.map(|m| m.schema_version),
        )?;
        store.save_manifest(&store.state.read())?;
        info!(path = %path.display(), version = store.schema_version(), "store opened");
        Ok(store)
    }

    /// Opens an empty store that lives only in memory.
    ///
    /// # Errors
    ///
    /// Fails if a migration of `schema` fails.
    pub fn open_in_memory(schema: Schema) -> StoreResult<Self> {
        Self::open_with_backend(Box::new(InMemoryBackend::new()), schema, StoreConfig::default())
    }

    /// Opens a store over an arbitrary journal backend, without a
    /// directory, lock or manifest.
    ///
    /// # Errors
    ///
    /// Fails on journal corruption, a downgrade, or a failing migration.
    pub fn open_with_backend(
        backend: Box<dyn StorageBackend>,
        schema: Schema,
        config: StoreConfig,
    ) -> StoreResult<Self> {
        Self::assemble(backend, None, schema, config, None)
    }

    fn assemble(
        backend: Box<dyn StorageBackend>,
        dir: Option<StoreDir>,
        schema: Schema,
        config: StoreConfig,
        manifest_version: Option<SchemaVersion>,
    ) -> StoreResult<Self> {
        let specs = schema.collections().clone();
        let (mut journal, batches) = Journal::recover(backend, config.sync_on_commit)?;

        let mut state = StoreState::new(&specs);
        for batch in &batches {
            for op in &batch.ops {
                state.apply(op, &specs);
            }
        }

        let stored = state.version.or(manifest_version).unwrap_or(0);
        let requested = schema.version();
        if stored > requested {
            return Err(StoreError::SchemaDowngrade { stored, requested });
        }

        let mut upgrade = UpgradeReport {
            from_version: stored,
            to_version: stored,
            applied: Vec::new(),
        };
        for migration in schema.migrations().pending(stored, requested) {
            let steps = MigrationManager::plan(migration, upgrade.to_version)?;
            let mut ops: Vec<BatchOp> = steps
                .iter()
                .filter_map(|step| match step {
                    MigrationStep::ClearCollection { name } => Some(BatchOp::Clear {
                        collection: name.clone(),
                    }),
                    MigrationStep::DropCollection { name } => Some(BatchOp::Drop {
                        collection: name.clone(),
                    }),
                    MigrationStep::Custom { .. } => None,
                })
                .collect();
            ops.push(BatchOp::Version {
                version: migration.version(),
            });

            let batch = journal.commit(ops)?;
            for op in &batch.ops {
                state.apply(op, &specs);
            }
            info!(
                version = migration.version(),
                name = migration.name(),
                steps = steps.len(),
                "applied migration"
            );
            upgrade.to_version = migration.version();
            upgrade.applied.push(AppliedMigration {
                version: migration.version(),
                name: migration.name().to_string(),
                steps,
            });
        }

        if state.version != Some(requested) {
            let batch = journal.commit(vec![BatchOp::Version { version: requested }])?;
            for op in &batch.ops {
                state.apply(op, &specs);
            }
            upgrade.to_version = requested;
        }

        for spec in specs.values() {
            state
                .collections
                .entry(spec.name.clone())
                .or_insert_with(|| CollectionState::new(spec.clone()));
        }

        debug!(
            collections = state.collections.len(),
            last_sequence = journal.last_sequence(),
            "store image rebuilt"
        );

        Ok(Self {
            state: RwLock::new(state),
            journal: Mutex::new(journal),
            dir,
            specs,
            config,
            upgrade,
        })
    }

    /// Directory of the store, or `None` when it is not file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(StoreDir::path)
    }

    /// Schema version the store is at.
    #[must_use]
    pub fn schema_version(&self) -> SchemaVersion {
        self.state.read().version.unwrap_or(0)
    }

    /// What `open` did to bring the store to the schema version.
    #[must_use]
    pub fn upgrade_report(&self) -> &UpgradeReport {
        &self.upgrade
    }

    /// The declaration of a collection.
    ///
    /// # Errors
    ///
    /// Fails if the collection does not exist or the store is closed.
    pub fn spec(&self, collection: &str) -> StoreResult<CollectionSpec> {
        Ok(self.state.read().collection(collection)?.spec.clone())
    }

    /// Inserts or overwrites a record and returns it as stored.
    ///
    /// For auto-increment collections the returned record carries the
    /// assigned key.
    ///
    /// # Errors
    ///
    /// Fails if the collection does not exist, the record has no usable
    /// key, or the journal write fails.
    pub fn put(&self, collection: &str, record: Record) -> StoreResult<Record> {
        let mut state = self.state.write();
        let (key, record) = PutPlanner::new(&state).plan(collection, record)?;
        debug!(collection, key = %key, "put");
        self.commit(
            &mut state,
            vec![BatchOp::Put {
                collection: collection.to_string(),
                key,
                record: record.clone(),
            }],
        )?;
        Ok(record)
    }

    /// Fetches one record.
    ///
    /// # Errors
    ///
    /// Fails if the collection does not exist.
    pub fn get(&self, collection: &str, key: impl Into<Key>) -> StoreResult<Option<Record>> {
        let state = self.state.read();
        Ok(state
            .collection(collection)?
            .records
            .get(&key.into().encode())
            .cloned())
    }

    /// Every record of a collection in key order, optionally only those
    /// whose owner field equals `owner`.
    ///
    /// # Errors
    ///
    /// Fails if the collection does not exist, or `owner` is given for a
    /// collection without an owner field.
    pub fn get_all(&self, collection: &str, owner: Option<&str>) -> StoreResult<Vec<Record>> {
        let state = self.state.read();
        let c = state.collection(collection)?;
        match owner {
            None => Ok(c.records.values().cloned().collect()),
            Some(owner) => {
                let field = owner_field(c)?;
                Ok(c.find_by(field, owner))
            }
        }
    }

    /// Records whose `field` equals `value`. Uses a secondary index when
    /// one exists and scans otherwise.
    ///
    /// # Errors
    ///
    /// Fails if the collection does not exist.
    pub fn get_all_by(&self, collection: &str, field: &str, value: &str) -> StoreResult<Vec<Record>> {
        let state = self.state.read();
        Ok(state.collection(collection)?.find_by(field, value))
    }

    /// Deletes a record. Returns false, without writing anything, when the
    /// key is absent.
    ///
    /// # Errors
    ///
    /// Fails if the collection does not exist or the journal write fails.
    pub fn delete(&self, collection: &str, key: impl Into<Key>) -> StoreResult<bool> {
        let key = key.into().encode();
        let mut state = self.state.write();
        if !state.collection(collection)?.records.contains_key(&key) {
            return Ok(false);
        }
        debug!(collection, key = %key, "delete");
        self.commit(
            &mut state,
            vec![BatchOp::Delete {
                collection: collection.to_string(),
                key,
            }],
        )?;
        Ok(true)
    }

    /// Shallow-merges `patch` into the record at `key` and stores the result.
    /// An absent record is treated as `{key field: key}`.
    ///
    /// # Errors
    ///
    /// Fails if `patch` carries a different key, or as [`LocalStore::put`].
    pub fn merge(&self, collection: &str, key: impl Into<Key>, patch: &Record) -> StoreResult<Record> {
        let key = key.into();
        let mut state = self.state.write();
        let c = state.collection(collection)?;
        let field = c.spec.key.field().to_string();
        if let Some(value) = patch.get(&field) {
            if Key::from_value(value).as_ref() != Some(&key) {
                return Err(StoreError::invalid_record(format!(
                    "patch changes key field '{field}' of {collection}/{key}"
                )));
            }
        }

        let mut merged = c
            .records
            .get(&key.encode())
            .cloned()
            .unwrap_or_else(|| Record::new().with(field, key.to_value()));
        merged.merge(patch);

        let (encoded, merged) = PutPlanner::new(&state).plan(collection, merged)?;
        self.commit(
            &mut state,
            vec![BatchOp::Put {
                collection: collection.to_string(),
                key: encoded,
                record: merged.clone(),
            }],
        )?;
        Ok(merged)
    }

    /// Replaces the whole contents of a collection in one batch. Returns
    /// the number of records afterwards.
    ///
    /// # Errors
    ///
    /// Fails if any record lacks a key; nothing is changed in that case.
    pub fn replace_all(&self, collection: &str, records: Vec<Record>) -> StoreResult<usize> {
        let mut state = self.state.write();
        let mut ops = vec![BatchOp::Clear {
            collection: collection.to_string(),
        }];
        let mut planner = PutPlanner::new(&state);
        for record in records {
            let (key, record) = planner.plan(collection, record)?;
            ops.push(BatchOp::Put {
                collection: collection.to_string(),
                key,
                record,
            });
        }
        self.commit(&mut state, ops)?;

        let count = state.collection(collection)?.records.len();
        debug!(collection, count, "collection replaced");
        Ok(count)
    }

    /// Replaces only the records owned by `owner`, leaving other owners'
    /// records alone, in one batch. Returns the number of records `owner`
    /// has afterwards.
    ///
    /// # Errors
    ///
    /// Fails if the collection has no owner field or a record lacks a key.
    pub fn replace_owned(&self, collection: &str, owner: &str, records: Vec<Record>) -> StoreResult<usize> {
        let mut state = self.state.write();
        let c = state.collection(collection)?;
        let field = owner_field(c)?.to_string();

        let mut ops: Vec<BatchOp> = c
            .keys_by(&field, owner)
            .into_iter()
            .map(|key| BatchOp::Delete {
                collection: collection.to_string(),
                key,
            })
            .collect();
        let mut planner = PutPlanner::new(&state);
        for record in records {
            let (key, record) = planner.plan(collection, record)?;
            ops.push(BatchOp::Put {
                collection: collection.to_string(),
                key,
                record,
            });
        }
        self.commit(&mut state, ops)?;

        let count = state.collection(collection)?.keys_by(&field, owner).len();
        debug!(collection, owner, count, "owned records replaced");
        Ok(count)
    }

    /// Applies several mutations as one batch. Returns the stored form of
    /// every put, in order.
    ///
    /// # Errors
    ///
    /// Fails without changing anything if any op is invalid.
    pub fn write(&self, batch: WriteBatch) -> StoreResult<Vec<Record>> {
        let mut state = self.state.write();
        let mut ops = Vec::with_capacity(batch.len());
        let mut stored = Vec::new();
        let mut planner = PutPlanner::new(&state);
        for op in batch.into_ops() {
            match op {
                WriteOp::Put { collection, record } => {
                    let (key, record) = planner.plan(&collection, record)?;
                    stored.push(record.clone());
                    ops.push(BatchOp::Put {
                        collection,
                        key,
                        record,
                    });
                }
                WriteOp::Delete { collection, key } => {
                    state.collection(&collection)?;
                    ops.push(BatchOp::Delete {
                        collection,
                        key: key.encode(),
                    });
                }
                WriteOp::Clear { collection } => {
                    state.collection(&collection)?;
                    ops.push(BatchOp::Clear { collection });
                }
            }
        }
        self.commit(&mut state, ops)?;
        Ok(stored)
    }

    /// Number of records in a collection.
    ///
    /// # Errors
    ///
    /// Fails if the collection does not exist.
    pub fn count(&self, collection: &str) -> StoreResult<usize> {
        Ok(self.state.read().collection(collection)?.records.len())
    }

    /// Names of all collections.
    #[must_use]
    pub fn collection_names(&self) -> Vec<String> {
        self.state.read().collections.keys().cloned().collect()
    }

    /// Current counters.
    ///
    /// # Errors
    ///
    /// Fails if the journal size cannot be read.
    pub fn stats(&self) -> StoreResult<StoreStats> {
        let state = self.state.read();
        let journal = self.journal.lock();
        Ok(StoreStats {
            schema_version: state.version.unwrap_or(0),
            last_sequence: journal.last_sequence(),
            journal_bytes: journal.size()?,
            collections: state
                .collections
                .iter()
                .map(|(name, c)| (name.clone(), c.records.len()))
                .collect(),
        })
    }

    /// Rewrites the journal as one snapshot batch.
    ///
    /// # Errors
    ///
    /// Fails if the store is closed or the rewrite fails; the old journal
    /// stays in place in that case.
    pub fn compact(&self) -> StoreResult<CompactionReport> {
        let state = self.state.write();
        state.ensure_open()?;
        let mut journal = self.journal.lock();
        compact_locked(&state, &mut journal)
    }

    /// Syncs the journal and writes the manifest. Every later call fails
    /// with [`StoreError::Closed`]. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Fails if the journal or manifest cannot be written.
    pub fn close(&self) -> StoreResult<()> {
        let mut state = self.state.write();
        if state.closed {
            return Ok(());
        }
        self.journal.lock().sync()?;
        self.save_manifest(&state)?;
        state.closed = true;
        info!("store closed");
        Ok(())
    }

    /// Returns true once [`LocalStore::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    fn commit(&self, state: &mut StoreState, ops: Vec<BatchOp>) -> StoreResult<()> {
        state.ensure_open()?;
        if ops.is_empty() {
            return Ok(());
        }
        let mut journal = self.journal.lock();
        let batch = journal.commit(ops)?;
        for op in &batch.ops {
            state.apply(op, &self.specs);
        }

        // The batch is durable at this point, so a failed compaction is
        // only logged.
        match journal.should_compact(self.config.compact_threshold) {
            Ok(true) => {
                if let Err(e) = compact_locked(state, &mut journal) {
                    warn!(error = %e, "automatic compaction failed");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "could not size journal"),
        }
        Ok(())
    }

    fn save_manifest(&self, state: &StoreState) -> StoreResult<()> {
        if let Some(dir) = &self.dir {
            dir.save_manifest(&Manifest {
                schema_version: state.version.unwrap_or(0),
                collections: state.collections.keys().cloned().collect(),
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("path", &self.path())
            .field("schema_version", &self.schema_version())
            .finish_non_exhaustive()
    }
}

fn owner_field(c: &CollectionState) -> StoreResult<&str> {
    c.spec.owner_field.as_deref().ok_or_else(|| {
        StoreError::invalid_operation(format!("collection '{}' has no owner field", c.spec.name))
    })
}

fn compact_locked(state: &StoreState, journal: &mut Journal) -> StoreResult<CompactionReport> {
    let before = journal.size()?;
    journal.rewrite(state.snapshot_ops(state.version.unwrap_or(0)))?;
    let after = journal.size()?;
    info!(before, after, "journal compacted");
    Ok(CompactionReport { before, after })
}
