//! Schemas

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::transaction::{Dbo, LockMode, SubUnit, Transaction};

use super::column::ColumnDef;
use super::entity::{Entity, EntityEntry};
use super::registry::{CatalogueObject, ChangeLog, Registry};
use super::{
    name_key, rows_store, CatalogueContext, DatabaseError, DatabaseResult, EntityName,
    Name, Retired, SchemaName, ENTITIES_STORE, SCHEMAS_STORE,
};

/// Metadata entry of a schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub name: SchemaName,
    pub created: DateTime<Utc>,
}

pub struct Schema {
    name: SchemaName,
    ctx: Arc<CatalogueContext>,
    pub(crate) entities: Registry<EntityName, Entity>,
    retired: Retired,
}

impl Schema {
    pub(crate) fn new(name: SchemaName, ctx: Arc<CatalogueContext>) -> Arc<Self> {
        Arc::new(Self {
            name,
            ctx,
            entities: Registry::new(),
            retired: Retired::default(),
        })
    }

    pub fn schema_name(&self) -> &SchemaName {
        &self.name
    }

    pub fn is_retired(&self) -> bool {
        self.retired.get()
    }
}

impl CatalogueObject for Schema {
    fn retire(&self) {
        if self.retired.set() {
            for entity in self.entities.list() {
                entity.retire();
            }
            debug!(schema = %self.name, "schema retired");
        }
    }
}

impl Dbo for Schema {
    type SubUnit = SchemaSubUnit;

    fn name(&self) -> Name {
        Name::Schema(self.name.clone())
    }

    fn new_sub_unit(self: Arc<Self>, tx: &Transaction) -> DatabaseResult<SchemaSubUnit> {
        let key = name_key(&self.name);
        let visible = tx.with_storage(|s| Ok(s.get(SCHEMAS_STORE, &key)?.is_some()))?;
        if self.is_retired() || !visible {
            return Err(DatabaseError::SchemaDoesNotExist(self.name.clone()));
        }
        Ok(SchemaSubUnit {
            schema: self,
            tx: tx.clone(),
            changes: Mutex::new(ChangeLog::new()),
        })
    }
}

/// A schema as seen by one transaction
pub struct SchemaSubUnit {
    schema: Arc<Schema>,
    tx: Transaction,
    changes: Mutex<ChangeLog<EntityName, Entity>>,
}

impl SchemaSubUnit {
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Create an entity with the given columns
    pub fn create_entity(&self, name: &EntityName, columns: Vec<ColumnDef>) -> DatabaseResult<Arc<Entity>> {
        self.check_member(name)?;
        if columns.is_empty() {
            return Err(DatabaseError::validation(format!("entity {} needs at least one column", name)));
        }
        for (i, column) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == column.name) {
                return Err(DatabaseError::validation(format!(
                    "duplicate column {} in entity {}",
                    column.name, name
                )));
            }
        }

        self.tx.request_lock(&self.schema.name(), LockMode::Exclusive)?;
        let key = name_key(name);
        if self.tx.with_storage(|s| Ok(s.get(ENTITIES_STORE, &key)?.is_some()))? {
            return Err(DatabaseError::EntityAlreadyExists(name.clone()));
        }

        let entity = Entity::new(name.clone(), &columns, 0, Arc::clone(&self.schema.ctx));
        self.tx.request_lock(&entity.name(), LockMode::Exclusive)?;
        let entry = EntityEntry {
            name: name.clone(),
            columns,
            created: Utc::now(),
        };
        self.tx
            .with_storage(|s| Ok(s.put_json(ENTITIES_STORE, key, &entry)?))?;
        self.changes
            .lock()
            .created(&self.schema.entities, name.clone(), Arc::clone(&entity));
        Ok(entity)
    }

    /// Drop an entity, its rows and its indexes
    pub fn drop_entity(&self, name: &EntityName) -> DatabaseResult<()> {
        self.tx.request_lock(&self.schema.name(), LockMode::Exclusive)?;
        let entity = self.entity_for_name(name)?;
        self.tx.request_lock(&entity.name(), LockMode::Exclusive)?;

        let entity_su = self.tx.get_or_create_sub_unit(&entity)?;
        for index in entity_su.list_indexes()? {
            entity_su.drop_index(&index)?;
        }
        self.tx.with_storage(|s| {
            s.truncate(&rows_store(name))?;
            s.delete(ENTITIES_STORE, &name_key(name))?;
            Ok(())
        })?;
        self.changes.lock().dropped(name.clone(), entity);
        Ok(())
    }

    pub fn entity_for_name(&self, name: &EntityName) -> DatabaseResult<Arc<Entity>> {
        let missing = || DatabaseError::EntityDoesNotExist(name.clone());
        if &name.schema() != self.schema.schema_name() {
            return Err(missing());
        }
        let entity = self.schema.entities.get(name).ok_or_else(missing)?;
        let key = name_key(name);
        let visible = self.tx.with_storage(|s| Ok(s.get(ENTITIES_STORE, &key)?.is_some()))?;
        if entity.is_retired() || !visible {
            return Err(missing());
        }
        Ok(entity)
    }

    /// Names of the entities visible to this transaction
    pub fn list_entities(&self) -> DatabaseResult<Vec<EntityName>> {
        self.tx.request_lock(&self.schema.name(), LockMode::Shared)?;
        let mut names = Vec::new();
        for entity in self.schema.entities.list() {
            let name = entity.entity_name().clone();
            match self.entity_for_name(&name) {
                Ok(_) => names.push(name),
                Err(e) if e.is_missing_object() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(names)
    }

    fn check_member(&self, name: &EntityName) -> DatabaseResult<()> {
        if &name.schema() != self.schema.schema_name() {
            return Err(DatabaseError::validation(format!(
                "entity {} does not belong to schema {}",
                name, self.schema.name
            )));
        }
        Ok(())
    }
}

impl SubUnit for SchemaSubUnit {
    fn dbo_name(&self) -> Name {
        self.schema.name()
    }

    fn finalize(&self, committed: bool) {
        self.changes.lock().settle(&self.schema.entities, committed);
    }
}
