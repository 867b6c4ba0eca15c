//! In-memory image of the store, rebuilt from the journal on open.

use crate::error::{StoreError, StoreResult};
use crate::journal::BatchOp;
use crate::migration::SchemaVersion;
use crate::record::{index_value, Key, Record};
use crate::schema::{CollectionSpec, KeyPath};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// field -> indexed value -> keys
type FieldIndex = BTreeMap<String, BTreeSet<String>>;

pub(crate) struct CollectionState {
    pub(crate) spec: CollectionSpec,
    pub(crate) records: BTreeMap<String, Record>,
    indexes: HashMap<String, FieldIndex>,
    pub(crate) next_auto: u64,
}

impl CollectionState {
    pub(crate) fn new(spec: CollectionSpec) -> Self {
        let indexes = spec
            .indexes
            .iter()
            .map(|field| (field.clone(), FieldIndex::new()))
            .collect();
        Self {
            spec,
            records: BTreeMap::new(),
            indexes,
            next_auto: 1,
        }
    }

    pub(crate) fn put(&mut self, key: String, record: Record) {
        if let KeyPath::AutoIncrement(field) = &self.spec.key {
            if let Some(Key::Int(n)) = record.get(field).and_then(Key::from_value) {
                self.next_auto = self.next_auto.max(n.saturating_add(1));
            }
        }
        self.unindex(&key);
        for (field, index) in &mut self.indexes {
            if let Some(value) = record.get(field).and_then(index_value) {
                index.entry(value).or_default().insert(key.clone());
            }
        }
        self.records.insert(key, record);
    }

    pub(crate) fn delete(&mut self, key: &str) -> Option<Record> {
        self.unindex(key);
        self.records.remove(key)
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
        for index in self.indexes.values_mut() {
            index.clear();
        }
    }

    fn unindex(&mut self, key: &str) {
        let Some(old) = self.records.get(key) else {
            return;
        };
        for (field, index) in &mut self.indexes {
            if let Some(value) = old.get(field).and_then(index_value) {
                if let Some(keys) = index.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
    }

    /// Records whose `field` equals `value`, in key order.
    pub(crate) fn find_by(&self, field: &str, value: &str) -> Vec<Record> {
        match self.indexes.get(field) {
            Some(index) => index
                .get(value)
                .into_iter()
                .flatten()
                .filter_map(|key| self.records.get(key))
                .cloned()
                .collect(),
            None => self
                .records
                .values()
                .filter(|r| r.get(field).and_then(index_value).as_deref() == Some(value))
                .cloned()
                .collect(),
        }
    }

    /// Keys whose `field` equals `value`.
    pub(crate) fn keys_by(&self, field: &str, value: &str) -> Vec<String> {
        match self.indexes.get(field) {
            Some(index) => index.get(value).into_iter().flatten().cloned().collect(),
            None => self
                .records
                .iter()
                .filter(|(_, r)| r.get(field).and_then(index_value).as_deref() == Some(value))
                .map(|(k, _)| k.clone())
                .collect(),
        }
    }
}

pub(crate) struct StoreState {
    pub(crate) collections: BTreeMap<String, CollectionState>,
    pub(crate) version: Option<SchemaVersion>,
    pub(crate) closed: bool,
}

impl StoreState {
    pub(crate) fn new(specs: &BTreeMap<String, CollectionSpec>) -> Self {
        Self {
            collections: specs
                .values()
                .map(|spec| (spec.name.clone(), CollectionState::new(spec.clone())))
                .collect(),
            version: None,
            closed: false,
        }
    }

    pub(crate) fn ensure_open(&self) -> StoreResult<()> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn collection(&self, name: &str) -> StoreResult<&CollectionState> {
        self.ensure_open()?;
        self.collections
            .get(name)
            .ok_or_else(|| StoreError::collection_not_found(name))
    }

    fn ensure(&mut self, name: &str, specs: &BTreeMap<String, CollectionSpec>) -> &mut CollectionState {
        self.collections.entry(name.to_string()).or_insert_with(|| {
            let spec = specs
                .get(name)
                .cloned()
                .unwrap_or_else(|| CollectionSpec::keyed(name));
            CollectionState::new(spec)
        })
    }

    /// Applies a committed op. Collections named by a replayed op are
    /// created on demand; schema collections keep their declared spec.
    pub(crate) fn apply(&mut self, op: &BatchOp, specs: &BTreeMap<String, CollectionSpec>) {
        match op {
            BatchOp::Put {
                collection,
                key,
                record,
            } => self.ensure(collection, specs).put(key.clone(), record.clone()),
            BatchOp::Delete { collection, key } => {
                if let Some(c) = self.collections.get_mut(collection) {
                    c.delete(key);
                }
            }
            BatchOp::Clear { collection } => {
                if let Some(c) = self.collections.get_mut(collection) {
                    c.clear();
                }
            }
            BatchOp::Drop { collection } => {
                self.collections.remove(collection);
            }
            BatchOp::Counter { collection, next } => {
                let c = self.ensure(collection, specs);
                c.next_auto = c.next_auto.max(*next);
            }
            BatchOp::Version { version } => self.version = Some(*version),
        }
    }

    /// Ops that recreate this image from nothing.
    pub(crate) fn snapshot_ops(&self, version: SchemaVersion) -> Vec<BatchOp> {
        let mut ops = vec![BatchOp::Version { version }];
        for (name, c) in &self.collections {
            if c.spec.key.is_auto_increment() {
                ops.push(BatchOp::Counter {
                    collection: name.clone(),
                    next: c.next_auto,
                });
            }
            ops.extend(c.records.iter().map(|(key, record)| BatchOp::Put {
                collection: name.clone(),
                key: key.clone(),
                record: record.clone(),
            }));
        }
        ops
    }
}

/// Plans puts against the current image, handing out auto-increment keys
/// without mutating it. The image changes only once the batch is committed.
pub(crate) struct PutPlanner<'a> {
    state: &'a StoreState,
    counters: HashMap<String, u64>,
}

impl<'a> PutPlanner<'a> {
    pub(crate) fn new(state: &'a StoreState) -> Self {
        Self {
            state,
            counters: HashMap::new(),
        }
    }

    /// Resolves the key of `record`, assigning one if the collection is
    /// auto-increment and the record carries none. Returns the encoded key
    /// and the record as it will be stored.
    pub(crate) fn plan(&mut self, collection: &str, mut record: Record) -> StoreResult<(String, Record)> {
        let c = self.state.collection(collection)?;
        let key = match &c.spec.key {
            KeyPath::Field(field) => record
                .get(field)
                .and_then(Key::from_value)
                .ok_or_else(|| StoreError::MissingKey {
                    collection: collection.to_string(),
                    field: field.clone(),
                })?,
            KeyPath::AutoIncrement(field) => {
                let next = self
                    .counters
                    .entry(collection.to_string())
                    .or_insert(c.next_auto);
                let supplied = record.get(field).filter(|v| !v.is_null()).map(Key::from_value);
                match supplied {
                    None => {
                        let n = *next;
                        *next = n.checked_add(1).ok_or_else(|| {
                            StoreError::invalid_operation(format!("{collection}: auto-increment keys exhausted"))
                        })?;
                        record.insert(field.clone(), n);
                        Key::Int(n)
                    }
                    // u64::MAX is reserved so the counter can always move past a supplied key.
                    Some(Some(Key::Int(n))) if n < u64::MAX => {
                        *next = (*next).max(n + 1);
                        Key::Int(n)
                    }
                    Some(_) => {
                        return Err(StoreError::MissingKey {
                            collection: collection.to_string(),
                            field: field.clone(),
                        })
                    }
                }
            }
        };
        Ok((key.encode(), record))
    }
}
