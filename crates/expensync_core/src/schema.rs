//! Collection declarations and versioned schemas.

use crate::error::{StoreError, StoreResult};
use crate::migration::{Migration, MigrationContext, MigrationManager, SchemaVersion};
use std::collections::BTreeMap;
use std::fmt;

/// Collection holding expense rows.
pub const EXPENSES: &str = "expenses";
/// Collection holding expense categories.
pub const CATEGORIES: &str = "categories";
/// Collection holding subcategories.
pub const SUBCATEGORIES: &str = "subcategories";
/// Collection holding budgets.
pub const BUDGETS: &str = "budgets";
/// Collection holding the pending-operation queue.
pub const PENDING_OPERATIONS: &str = "pending_operations";
/// Collection holding abandoned operations.
pub const DEAD_LETTERS: &str = "dead_letters";

/// Current version of the expense tracker schema.
pub const EXPENSE_TRACKER_VERSION: SchemaVersion = 4;

/// How a collection derives the primary key of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPath {
    /// The key is read from this field. The caller supplies it.
    Field(String),
    /// The store assigns a strictly increasing integer and writes it into
    /// this field. A record that already carries an integer there keeps it.
    AutoIncrement(String),
}

impl KeyPath {
    /// Name of the key field.
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Self::Field(f) | Self::AutoIncrement(f) => f,
        }
    }

    /// Returns true for store-assigned keys.
    #[must_use]
    pub fn is_auto_increment(&self) -> bool {
        matches!(self, Self::AutoIncrement(_))
    }
}

/// Declaration of one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    /// Collection name.
    pub name: String,
    /// Primary key derivation.
    pub key: KeyPath,
    /// Fields with a secondary equality index.
    pub indexes: Vec<String>,
    /// Field naming the owning user, if rows are per-user.
    pub owner_field: Option<String>,
}

impl CollectionSpec {
    /// A collection keyed by the `id` field.
    #[must_use]
    pub fn keyed(name: impl Into<String>) -> Self {
        Self::with_key(name, KeyPath::Field(crate::record::ID_FIELD.to_string()))
    }

    /// A collection keyed by an auto-increment integer in `field`.
    #[must_use]
    pub fn auto_increment(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::with_key(name, KeyPath::AutoIncrement(field.into()))
    }

    /// A collection with an explicit key path.
    #[must_use]
    pub fn with_key(name: impl Into<String>, key: KeyPath) -> Self {
        Self {
            name: name.into(),
            key,
            indexes: Vec::new(),
            owner_field: None,
        }
    }

    /// Adds a secondary index on `field`.
    #[must_use]
    pub fn index(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        if !self.indexes.contains(&field) {
            self.indexes.push(field);
        }
        self
    }

    /// Marks `field` as the owner field. The field is indexed as well.
    #[must_use]
    pub fn owned_by(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        self = self.index(field.clone());
        self.owner_field = Some(field);
        self
    }
}

/// A versioned set of collections plus the migrations that lead to it.
pub struct Schema {
    version: SchemaVersion,
    collections: BTreeMap<String, CollectionSpec>,
    migrations: MigrationManager,
}

impl Schema {
    /// Starts building a schema at `version`.
    #[must_use]
    pub fn builder(version: SchemaVersion) -> SchemaBuilder {
        SchemaBuilder {
            version,
            collections: BTreeMap::new(),
            migrations: MigrationManager::new(),
            error: None,
        }
    }

    /// The expense tracker schema, version 4.
    ///
    /// Version 4 replaced the category catalogue, so upgrading to it clears
    /// every cached category and subcategory. The next remote read refills
    /// them.
    #[must_use]
    pub fn expense_tracker() -> Self {
        Self {
            version: EXPENSE_TRACKER_VERSION,
            collections: [
                CollectionSpec::keyed(EXPENSES)
                    .owned_by("user_id")
                    .index("date"),
                CollectionSpec::keyed(CATEGORIES),
                CollectionSpec::keyed(SUBCATEGORIES).index("category_id"),
                CollectionSpec::keyed(BUDGETS).owned_by("user_id"),
                CollectionSpec::auto_increment(PENDING_OPERATIONS, "operation_id")
                    .index("enqueued_at"),
                CollectionSpec::with_key(DEAD_LETTERS, KeyPath::Field("operation_id".into())),
            ]
            .into_iter()
            .map(|spec| (spec.name.clone(), spec))
            .collect(),
            migrations: MigrationManager::with_migration(RefreshBusinessCategories),
        }
    }

    /// Target version.
    #[must_use]
    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    /// Declared collections, by name.
    #[must_use]
    pub fn collections(&self) -> &BTreeMap<String, CollectionSpec> {
        &self.collections
    }

    /// Looks up one collection.
    #[must_use]
    pub fn collection(&self, name: &str) -> Option<&CollectionSpec> {
        self.collections.get(name)
    }

    /// Registered migrations.
    #[must_use]
    pub fn migrations(&self) -> &MigrationManager {
        &self.migrations
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("version", &self.version)
            .field("collections", &self.collections.keys().collect::<Vec<_>>())
            .field("migrations", &self.migrations.list().len())
            .finish()
    }
}

/// Builder returned by [`Schema::builder`].
pub struct SchemaBuilder {
    version: SchemaVersion,
    collections: BTreeMap<String, CollectionSpec>,
    migrations: MigrationManager,
    error: Option<StoreError>,
}

impl SchemaBuilder {
    /// Declares a collection. Redeclaring a name replaces the earlier spec.
    #[must_use]
    pub fn collection(mut self, spec: CollectionSpec) -> Self {
        self.collections.insert(spec.name.clone(), spec);
        self
    }

    /// Registers a migration.
    #[must_use]
    pub fn migration(mut self, migration: impl Migration + 'static) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.migrations.register(Box::new(migration)) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Finishes the schema.
    ///
    /// # Errors
    ///
    /// Fails on a duplicate migration version, or on a migration whose
    /// version is above the schema version.
    pub fn build(self) -> StoreResult<Schema> {
        if let Some(e) = self.error {
            return Err(e);
        }
        if let Some(latest) = self.migrations.latest_version() {
            if latest > self.version {
                return Err(StoreError::migration_failed(format!(
                    "migration {latest} is newer than schema version {}",
                    self.version
                )));
            }
        }
        Ok(Schema {
            version: self.version,
            collections: self.collections,
            migrations: self.migrations,
        })
    }
}

/// Version 4: the category catalogue was replaced wholesale.
#[derive(Debug, Clone, Copy)]
pub struct RefreshBusinessCategories;

impl Migration for RefreshBusinessCategories {
    fn version(&self) -> SchemaVersion {
        4
    }

    fn name(&self) -> &str {
        "refresh_business_categories"
    }

    fn description(&self) -> Option<&str> {
        Some("drop cached categories and subcategories so the new catalogue is fetched")
    }

    fn up(&self, ctx: &mut MigrationContext) -> StoreResult<()> {
        ctx.clear_collection(CATEGORIES);
        ctx.clear_collection(SUBCATEGORIES);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expense_tracker_layout() {
        let schema = Schema::expense_tracker();
        assert_eq!(schema.version(), 4);
        assert_eq!(schema.collections().len(), 6);

        let expenses = schema.collection(EXPENSES).unwrap();
        assert_eq!(expenses.owner_field.as_deref(), Some("user_id"));
        assert_eq!(expenses.indexes, vec!["user_id".to_string(), "date".to_string()]);

        let queue = schema.collection(PENDING_OPERATIONS).unwrap();
        assert!(queue.key.is_auto_increment());
        assert_eq!(queue.key.field(), "operation_id");

        assert_eq!(schema.migrations().list()[0].name, "refresh_business_categories");
    }

    #[test]
    fn builder_rejects_migration_above_version() {
        let result = Schema::builder(3)
            .collection(CollectionSpec::keyed("things"))
            .migration(RefreshBusinessCategories)
            .build();
        assert!(matches!(result, Err(StoreError::MigrationFailed { .. })));
    }

    #[test]
    fn builder_rejects_duplicate_migration() {
        let result = Schema::builder(4)
            .migration(RefreshBusinessCategories)
            .migration(RefreshBusinessCategories)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn owned_by_indexes_owner_once() {
        let spec = CollectionSpec::keyed("budgets").index("user_id").owned_by("user_id");
        assert_eq!(spec.indexes, vec!["user_id".to_string()]);
    }
}
