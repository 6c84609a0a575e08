//! Catalogue of database objects
//!
//! `Catalogue` → `Schema` → `Entity` → `Column` / `Index`. Every object is a
//! DBO with its own sub-unit type. Metadata is kept as JSON entries in the
//! `catalogue.*` stores; rows and index entries live in per-object stores.
//!
//! # Visibility
//!
//! - A created object is registered in memory at once but only handed out to
//!   transactions whose snapshot contains its metadata entry
//! - A dropped object stays registered until the drop commits and is then
//!   retired
//!
//! # Locking
//!
//! Writable transactions lock objects in the order catalogue → schema →
//! entity → column/index: shared for reads, exclusive for writes. DDL locks
//! the parent and the object exclusively. Read-only transactions rely on
//! their snapshot and take no locks.

mod column;
mod entity;
mod errors;
mod names;
mod registry;
mod schema;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::info;

use crate::fail_point::FailPoints;
use crate::index::{Index, IndexArena, IndexEntry};
use crate::statistics::StatisticsManager;
use crate::storage::{decode_tuple_key, Environment, StorageTx};
use crate::transaction::{Dbo, LockMode, SubUnit, Transaction};
use crate::values::Tuple;

pub use column::{Column, ColumnDef, ColumnSubUnit};
pub use entity::{Cursor, Entity, EntityEntry, EntitySubUnit};
pub use errors::{DatabaseError, DatabaseResult};
pub use names::{ColumnName, EntityName, IndexName, Name, SchemaName};
pub use schema::{Schema, SchemaEntry, SchemaSubUnit};

pub(crate) use registry::CatalogueObject;
use registry::{ChangeLog, Registry};

pub const SCHEMAS_STORE: &str = "catalogue.schemas";
pub const ENTITIES_STORE: &str = "catalogue.entities";
pub const INDEXES_STORE: &str = "catalogue.indexes";

/// Key of a metadata entry
pub fn name_key(name: &impl fmt::Display) -> Vec<u8> {
    name.to_string().into_bytes()
}

/// Store holding the rows of `entity`
pub fn rows_store(entity: &EntityName) -> String {
    format!("{}#rows", entity)
}

/// Store holding the entries of `index`
pub fn index_store(index: &IndexName) -> String {
    format!("{}#data", index)
}

/// Every row of `entity`, in tuple id order
pub(crate) fn scan_rows(storage: &mut StorageTx, entity: &EntityName) -> DatabaseResult<Vec<Tuple>> {
    let store = rows_store(entity);
    let mut rows = Vec::new();
    for (key, bytes) in storage.scan(&store)? {
        let tuple_id = decode_tuple_key(&key)
            .ok_or_else(|| DatabaseError::corruption(format!("bad row key in {}", store)))?;
        let values = serde_json::from_slice(&bytes)
            .map_err(|e| DatabaseError::corruption(format!("row {} of {}: {}", tuple_id, entity, e)))?;
        rows.push(Tuple::new(tuple_id, values));
    }
    Ok(rows)
}

/// Services shared by all catalogue objects
pub struct CatalogueContext {
    pub statistics: Arc<StatisticsManager>,
    pub arena: IndexArena,
    pub fail_points: Arc<FailPoints>,
    /// Buckets per dimension of new grid indexes
    pub grid_buckets: u16,
}

impl CatalogueContext {
    pub fn new(statistics: Arc<StatisticsManager>, fail_points: Arc<FailPoints>, grid_buckets: u16) -> Arc<Self> {
        Arc::new(Self {
            statistics,
            arena: IndexArena::new(),
            fail_points,
            grid_buckets,
        })
    }
}

/// Root of the catalogue
pub struct Catalogue {
    ctx: Arc<CatalogueContext>,
    schemas: Registry<SchemaName, Schema>,
}

impl Catalogue {
    /// An empty catalogue
    pub fn new(ctx: Arc<CatalogueContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            schemas: Registry::new(),
        })
    }

    /// Rebuild the in-memory catalogue from the metadata in `env`
    pub fn load(ctx: Arc<CatalogueContext>, env: &Arc<Environment>) -> DatabaseResult<Arc<Self>> {
        let catalogue = Self::new(Arc::clone(&ctx));
        let mut storage = env.begin(true)?;

        for (_, bytes) in storage.scan(SCHEMAS_STORE)? {
            let entry: SchemaEntry = decode_entry(&bytes, "schema")?;
            let schema = Schema::new(entry.name.clone(), Arc::clone(&ctx));
            catalogue.schemas.insert(entry.name, schema);
        }

        let mut entities = 0;
        for (_, bytes) in storage.scan(ENTITIES_STORE)? {
            let entry: EntityEntry = decode_entry(&bytes, "entity")?;
            let schema = catalogue
                .schemas
                .get(&entry.name.schema())
                .ok_or_else(|| DatabaseError::corruption(format!("entity {} without schema", entry.name)))?;
            let next_tuple_id = storage
                .scan(&rows_store(&entry.name))?
                .last()
                .and_then(|(key, _)| decode_tuple_key(key))
                .map_or(0, |id| id + 1);
            let entity = Entity::new(entry.name.clone(), &entry.columns, next_tuple_id, Arc::clone(&ctx));
            entity.publish();
            schema.entities.insert(entry.name, entity);
            entities += 1;
        }

        let mut indexes = 0;
        for (_, bytes) in storage.scan(INDEXES_STORE)? {
            let entry: IndexEntry = decode_entry(&bytes, "index")?;
            let entity = catalogue
                .schemas
                .get(&entry.name.entity().schema())
                .and_then(|s| s.entities.get(&entry.name.entity()))
                .ok_or_else(|| DatabaseError::corruption(format!("index {} without entity", entry.name)))?;
            let descriptor = entity.describe_index(&entry.name, &entry.definition(), entry.buckets)?;
            let index = Index::register(descriptor, Arc::clone(&ctx));
            entity.indexes.insert(entry.name, index);
            indexes += 1;
        }
        storage.abort();

        info!(
            schemas = catalogue.schemas.list().len(),
            entities, indexes, "catalogue loaded"
        );
        Ok(catalogue)
    }

    pub fn context(&self) -> &Arc<CatalogueContext> {
        &self.ctx
    }

    pub fn statistics(&self) -> &Arc<StatisticsManager> {
        &self.ctx.statistics
    }

    /// Resolve a schema for `tx`
    pub fn resolve_schema(self: &Arc<Self>, tx: &Transaction, name: &SchemaName) -> DatabaseResult<Arc<Schema>> {
        tx.get_or_create_sub_unit(self)?.schema_for_name(name)
    }

    /// Resolve an entity for `tx`
    pub fn resolve_entity(self: &Arc<Self>, tx: &Transaction, name: &EntityName) -> DatabaseResult<Arc<Entity>> {
        let schema = self.resolve_schema(tx, &name.schema())?;
        tx.get_or_create_sub_unit(&schema)?.entity_for_name(name)
    }

    /// Resolve a column for `tx`
    pub fn resolve_column(self: &Arc<Self>, tx: &Transaction, name: &ColumnName) -> DatabaseResult<Arc<Column>> {
        let entity = self.resolve_entity(tx, &name.entity())?;
        tx.get_or_create_sub_unit(&entity)?.column_for_name(name.simple())
    }

    /// Resolve an index for `tx`
    pub fn resolve_index(self: &Arc<Self>, tx: &Transaction, name: &IndexName) -> DatabaseResult<Arc<Index>> {
        let entity = self.resolve_entity(tx, &name.entity())?;
        tx.get_or_create_sub_unit(&entity)?.index_for_name(name)
    }
}

pub(crate) fn decode_entry<T: serde::de::DeserializeOwned>(bytes: &[u8], kind: &str) -> DatabaseResult<T> {
    serde_json::from_slice(bytes).map_err(|e| DatabaseError::corruption(format!("{} entry: {}", kind, e)))
}

impl Dbo for Catalogue {
    type SubUnit = CatalogueSubUnit;

    fn name(&self) -> Name {
        Name::Catalogue
    }

    fn new_sub_unit(self: Arc<Self>, tx: &Transaction) -> DatabaseResult<CatalogueSubUnit> {
        Ok(CatalogueSubUnit {
            catalogue: self,
            tx: tx.clone(),
            changes: Mutex::new(ChangeLog::new()),
        })
    }
}

/// The catalogue as seen by one transaction
pub struct CatalogueSubUnit {
    catalogue: Arc<Catalogue>,
    tx: Transaction,
    changes: Mutex<ChangeLog<SchemaName, Schema>>,
}

impl CatalogueSubUnit {
    pub fn create_schema(&self, name: &SchemaName) -> DatabaseResult<Arc<Schema>> {
        self.tx.request_lock(&Name::Catalogue, LockMode::Exclusive)?;
        let key = name_key(name);
        let exists = self
            .tx
            .with_storage(|s| Ok(s.get(SCHEMAS_STORE, &key)?.is_some()))?;
        if exists {
            return Err(DatabaseError::SchemaAlreadyExists(name.clone()));
        }

        let entry = SchemaEntry {
            name: name.clone(),
            created: Utc::now(),
        };
        self.tx
            .with_storage(|s| Ok(s.put_json(SCHEMAS_STORE, key, &entry)?))?;

        let schema = Schema::new(name.clone(), Arc::clone(&self.catalogue.ctx));
        self.changes
            .lock()
            .created(&self.catalogue.schemas, name.clone(), Arc::clone(&schema));
        Ok(schema)
    }

    /// Drop a schema together with its entities
    pub fn drop_schema(&self, name: &SchemaName) -> DatabaseResult<()> {
        self.tx.request_lock(&Name::Catalogue, LockMode::Exclusive)?;
        let schema = self.schema_for_name(name)?;
        self.tx.request_lock(&schema.name(), LockMode::Exclusive)?;
        let schema_su = self.tx.get_or_create_sub_unit(&schema)?;
        for entity in schema_su.list_entities()? {
            schema_su.drop_entity(&entity)?;
        }
        self.tx
            .with_storage(|s| Ok(s.delete(SCHEMAS_STORE, &name_key(name))?))?;
        self.changes.lock().dropped(name.clone(), schema);
        Ok(())
    }

    pub fn schema_for_name(&self, name: &SchemaName) -> DatabaseResult<Arc<Schema>> {
        let missing = || DatabaseError::SchemaDoesNotExist(name.clone());
        let schema = self.catalogue.schemas.get(name).ok_or_else(missing)?;
        let key = name_key(name);
        let visible = self.tx.with_storage(|s| Ok(s.get(SCHEMAS_STORE, &key)?.is_some()))?;
        if schema.is_retired() || !visible {
            return Err(missing());
        }
        Ok(schema)
    }

    /// Names of the schemas visible to this transaction
    pub fn list_schemas(&self) -> DatabaseResult<Vec<SchemaName>> {
        self.tx.request_lock(&Name::Catalogue, LockMode::Shared)?;
        let mut names = Vec::new();
        for schema in self.catalogue.schemas.list() {
            let name = schema.schema_name().clone();
            match self.schema_for_name(&name) {
                Ok(_) => names.push(name),
                Err(e) if e.is_missing_object() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(names)
    }
}

impl SubUnit for CatalogueSubUnit {
    fn dbo_name(&self) -> Name {
        Name::Catalogue
    }

    fn finalize(&self, committed: bool) {
        self.changes.lock().settle(&self.catalogue.schemas, committed);
    }
}

/// Retirement flag shared by all catalogue objects
#[derive(Debug, Default)]
pub(crate) struct Retired(AtomicBool);

impl Retired {
    pub(crate) fn set(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
