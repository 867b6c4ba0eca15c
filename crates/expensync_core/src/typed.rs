//! Typed access to collections.

use crate::error::StoreResult;
use crate::record::Record;
use crate::store::LocalStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// A row type bound to one collection.
///
/// Implementors serialize to a JSON object whose `id` field is the primary
/// key. Conversion to and from [`Record`] goes through serde.
///
/// ```rust
/// use expensync_core::Document;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Note { id: String, text: String }
///
/// impl Document for Note {
///     const COLLECTION: &'static str = "notes";
///     fn id(&self) -> &str { &self.id }
/// }
/// ```
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    /// Collection the type is stored in.
    const COLLECTION: &'static str;

    /// Primary key.
    fn id(&self) -> &str;

    /// Owning user, for collections partitioned by user.
    fn owner(&self) -> Option<&str> {
        None
    }

    /// Converts to a record.
    ///
    /// # Errors
    ///
    /// Fails if the type does not serialize to a JSON object.
    fn to_record(&self) -> StoreResult<Record> {
        Record::from_serializable(self)
    }

    /// Converts from a record.
    ///
    /// # Errors
    ///
    /// Fails if the record does not match the type.
    fn from_record(record: &Record) -> StoreResult<Self> {
        record.deserialize()
    }
}

/// Typed handle on a collection of a [`LocalStore`].
///
/// ```rust
/// use expensync_core::{Expense, LocalStore, Schema};
///
/// let store = LocalStore::open_in_memory(Schema::expense_tracker()).unwrap();
/// let expenses = store.collection::<Expense>();
///
/// let lunch = Expense::new("u1", 12.5, "2024-03-02");
/// expenses.put(&lunch).unwrap();
/// assert_eq!(expenses.get(&lunch.id).unwrap(), Some(lunch));
/// ```
pub struct Collection<'a, T: Document> {
    store: &'a LocalStore,
    _marker: PhantomData<T>,
}

impl<'a, T: Document> Collection<'a, T> {
    pub(crate) fn new(store: &'a LocalStore) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }

    /// Collection name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        T::COLLECTION
    }

    /// Fetches one document.
    ///
    /// # Errors
    ///
    /// Fails on a store error or a record that does not decode.
    pub fn get(&self, id: &str) -> StoreResult<Option<T>> {
        self.store
            .get(T::COLLECTION, id)?
            .map(|r| T::from_record(&r))
            .transpose()
    }

    /// Inserts or overwrites a document.
    ///
    /// # Errors
    ///
    /// Fails on a store error.
    pub fn put(&self, doc: &T) -> StoreResult<()> {
        self.store.put(T::COLLECTION, doc.to_record()?)?;
        Ok(())
    }

    /// Deletes a document. Returns false when it was absent.
    ///
    /// # Errors
    ///
    /// Fails on a store error.
    pub fn delete(&self, id: &str) -> StoreResult<bool> {
        self.store.delete(T::COLLECTION, id)
    }

    /// Every document in key order.
    ///
    /// # Errors
    ///
    /// Fails on a store error or a record that does not decode.
    pub fn all(&self) -> StoreResult<Vec<T>> {
        decode_all(self.store.get_all(T::COLLECTION, None)?)
    }

    /// Documents belonging to `owner`.
    ///
    /// # Errors
    ///
    /// Fails if the collection has no owner field.
    pub fn all_owned(&self, owner: &str) -> StoreResult<Vec<T>> {
        decode_all(self.store.get_all(T::COLLECTION, Some(owner))?)
    }

    /// Replaces the whole collection.
    ///
    /// # Errors
    ///
    /// Fails on a store error.
    pub fn replace_all(&self, docs: &[T]) -> StoreResult<usize> {
        let records = docs.iter().map(T::to_record).collect::<StoreResult<Vec<_>>>()?;
        self.store.replace_all(T::COLLECTION, records)
    }

    /// Number of documents.
    ///
    /// # Errors
    ///
    /// Fails on a store error.
    pub fn count(&self) -> StoreResult<usize> {
        self.store.count(T::COLLECTION)
    }
}

fn decode_all<T: Document>(records: Vec<Record>) -> StoreResult<Vec<T>> {
    records.iter().map(T::from_record).collect()
}

impl LocalStore {
    /// Typed handle on the collection of `T`.
    #[must_use]
    pub fn collection<T: Document>(&self) -> Collection<'_, T> {
        Collection::new(self)
    }
}
