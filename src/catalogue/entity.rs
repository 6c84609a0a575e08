//! Entities
//!
//! An entity owns its rows and its indexes. Rows are JSON encoded under
//! their tuple id in the entity's rows store. Every data change is:
//!
//! - written to the rows store
//! - propagated to each index in the same transaction
//! - reported to the touched columns (staleness) and as a `DataChanged` event
//!
//! Tuple ids come from an in-memory counter; ids of rolled back inserts are
//! not reused.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fail_point::points;
use crate::index::{Index, IndexDefinition, IndexDescriptor, IndexEntry, IndexState, IndexType, IndexedColumn, RowChange};
use crate::storage::tuple_key;
use crate::transaction::{ColumnChange, DataChangeKind, DataPayload, Dbo, Event, LockMode, SubUnit, Transaction};
use crate::values::{Tuple, TupleId, Value};

use super::column::{Column, ColumnDef};
use super::registry::{CatalogueObject, ChangeLog, Registry};
use super::{
    index_store, name_key, rows_store, scan_rows, CatalogueContext, DatabaseError, DatabaseResult, EntityName,
    IndexName, Name, Retired, ENTITIES_STORE, INDEXES_STORE,
};

/// Metadata entry of an entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEntry {
    pub name: EntityName,
    pub columns: Vec<ColumnDef>,
    pub created: DateTime<Utc>,
}

pub struct Entity {
    name: EntityName,
    columns: Vec<Arc<Column>>,
    pub(crate) indexes: Registry<IndexName, Index>,
    next_tuple_id: AtomicU64,
    ctx: Arc<CatalogueContext>,
    retired: Retired,
}

impl Entity {
    pub(crate) fn new(
        name: EntityName,
        columns: &[ColumnDef],
        next_tuple_id: TupleId,
        ctx: Arc<CatalogueContext>,
    ) -> Arc<Self> {
        let columns = columns
            .iter()
            .enumerate()
            .map(|(position, def)| Column::new(name.column(&def.name), def.clone(), position, Arc::clone(&ctx)))
            .collect();
        Arc::new(Self {
            name,
            columns,
            indexes: Registry::new(),
            next_tuple_id: AtomicU64::new(next_tuple_id),
            ctx,
            retired: Retired::default(),
        })
    }

    pub fn entity_name(&self) -> &EntityName {
        &self.name
    }

    pub fn columns(&self) -> &[Arc<Column>] {
        &self.columns
    }

    pub fn is_retired(&self) -> bool {
        self.retired.get()
    }

    fn column(&self, name: &str) -> Option<&Arc<Column>> {
        let name = name.to_lowercase();
        self.columns.iter().find(|c| c.column_name().simple() == name)
    }

    /// Resolve an index definition against this entity's columns
    pub(crate) fn describe_index(
        &self,
        name: &IndexName,
        definition: &IndexDefinition,
        buckets: u16,
    ) -> DatabaseResult<IndexDescriptor> {
        if name.entity() != self.name {
            return Err(DatabaseError::validation(format!(
                "index {} does not belong to entity {}",
                name, self.name
            )));
        }
        if definition.columns.len() != 1 {
            return Err(DatabaseError::validation(format!(
                "{} indexes cover exactly one column, {} given",
                definition.index_type,
                definition.columns.len()
            )));
        }
        if definition.unique && definition.index_type != IndexType::BTree {
            return Err(DatabaseError::validation("only btree indexes can be unique"));
        }
        let mut columns = Vec::with_capacity(definition.columns.len());
        for column_name in &definition.columns {
            let column = self
                .column(column_name)
                .ok_or_else(|| DatabaseError::ColumnDoesNotExist(self.name.column(column_name)))?;
            if !definition.index_type.accepts(column.value_type()) {
                return Err(DatabaseError::validation(format!(
                    "{} index cannot cover column {} of type {}",
                    definition.index_type,
                    column.column_name(),
                    column.value_type()
                )));
            }
            columns.push(IndexedColumn {
                name: column.column_name().clone(),
                position: column.position(),
                value_type: column.value_type(),
            });
        }
        Ok(IndexDescriptor {
            name: name.clone(),
            index_type: definition.index_type,
            columns,
            unique: definition.unique,
            buckets,
        })
    }
}

impl CatalogueObject for Entity {
    fn publish(&self) {
        for column in &self.columns {
            column.publish();
        }
    }

    fn retire(&self) {
        if self.retired.set() {
            for column in &self.columns {
                column.retire();
            }
            for index in self.indexes.list() {
                index.retire();
            }
            self.ctx.statistics.remove_entity(&self.name);
            debug!(entity = %self.name, "entity retired");
        }
    }
}

impl Dbo for Entity {
    type SubUnit = EntitySubUnit;

    fn name(&self) -> Name {
        Name::Entity(self.name.clone())
    }

    fn new_sub_unit(self: Arc<Self>, tx: &Transaction) -> DatabaseResult<EntitySubUnit> {
        let key = name_key(&self.name);
        let visible = tx.with_storage(|s| Ok(s.get(ENTITIES_STORE, &key)?.is_some()))?;
        if self.is_retired() || !visible {
            return Err(DatabaseError::EntityDoesNotExist(self.name.clone()));
        }
        Ok(EntitySubUnit {
            entity: self,
            tx: tx.clone(),
            changes: Mutex::new(ChangeLog::new()),
            modified: Mutex::new(0),
        })
    }
}

/// Forward-only iterator over a snapshot of rows
#[derive(Debug)]
pub struct Cursor {
    rows: std::vec::IntoIter<Tuple>,
}

impl Cursor {
    /// Up to `size` rows, or `None` once exhausted
    pub fn next_batch(&mut self, size: usize) -> Option<Vec<Tuple>> {
        let batch: Vec<Tuple> = self.rows.by_ref().take(size.max(1)).collect();
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }

    pub fn remaining(&self) -> usize {
        self.rows.len()
    }
}

impl Iterator for Cursor {
    type Item = Tuple;

    fn next(&mut self) -> Option<Tuple> {
        self.rows.next()
    }
}

/// An entity as seen by one transaction
pub struct EntitySubUnit {
    entity: Arc<Entity>,
    tx: Transaction,
    changes: Mutex<ChangeLog<IndexName, Index>>,
    /// Rows changed by this transaction
    modified: Mutex<u64>,
}

impl EntitySubUnit {
    pub fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }

    pub fn list_columns(&self) -> Vec<ColumnDef> {
        self.entity.columns.iter().map(|c| c.def().clone()).collect()
    }

    pub fn column_for_name(&self, name: &str) -> DatabaseResult<Arc<Column>> {
        self.entity
            .column(name)
            .cloned()
            .ok_or_else(|| DatabaseError::ColumnDoesNotExist(self.entity.name.column(name)))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn count(&self) -> DatabaseResult<usize> {
        self.tx.request_lock(&self.entity.name(), LockMode::Shared)?;
        let store = rows_store(&self.entity.name);
        self.tx.with_storage(|s| Ok(s.count(&store)?))
    }

    pub fn read(&self, tuple_id: TupleId) -> DatabaseResult<Tuple> {
        self.tx.request_lock(&self.entity.name(), LockMode::Shared)?;
        let values = self.read_values(tuple_id)?;
        Ok(Tuple::new(tuple_id, values))
    }

    /// Every row visible to this transaction
    pub fn cursor(&self) -> DatabaseResult<Cursor> {
        self.tx.request_lock(&self.entity.name(), LockMode::Shared)?;
        let rows = self.tx.with_storage(|s| scan_rows(s, &self.entity.name))?;
        Ok(Cursor {
            rows: rows.into_iter(),
        })
    }

    fn read_values(&self, tuple_id: TupleId) -> DatabaseResult<Vec<Option<Value>>> {
        let store = rows_store(&self.entity.name);
        self.tx
            .with_storage(|s| Ok(s.get_json(&store, &tuple_key(tuple_id))?))?
            .ok_or_else(|| DatabaseError::TupleDoesNotExist {
                entity: self.entity.name.clone(),
                tuple_id,
            })
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Insert a row; `values` are given in column order
    pub fn insert(&self, values: Vec<Option<Value>>) -> DatabaseResult<TupleId> {
        self.tx.request_lock(&self.entity.name(), LockMode::Exclusive)?;
        self.validate(&values)?;

        let tuple_id = self.entity.next_tuple_id.fetch_add(1, Ordering::SeqCst);
        self.write_row(tuple_id, &values)?;
        self.propagate(DataChangeKind::Insert, tuple_id, None, Some(values))?;
        Ok(tuple_id)
    }

    /// Change the named columns of a row
    pub fn update(&self, tuple_id: TupleId, updates: Vec<(String, Option<Value>)>) -> DatabaseResult<()> {
        self.tx.request_lock(&self.entity.name(), LockMode::Exclusive)?;
        let old = self.read_values(tuple_id)?;
        let mut new = old.clone();
        for (column_name, value) in updates {
            let column = self.column_for_name(&column_name)?;
            new[column.position()] = value;
        }
        self.validate(&new)?;

        self.write_row(tuple_id, &new)?;
        self.propagate(DataChangeKind::Update, tuple_id, Some(old), Some(new))
    }

    pub fn delete(&self, tuple_id: TupleId) -> DatabaseResult<()> {
        self.tx.request_lock(&self.entity.name(), LockMode::Exclusive)?;
        let old = self.read_values(tuple_id)?;
        let store = rows_store(&self.entity.name);
        self.tx
            .with_storage(|s| Ok(s.delete(&store, &tuple_key(tuple_id))?))?;
        self.propagate(DataChangeKind::Delete, tuple_id, Some(old), None)
    }

    fn validate(&self, values: &[Option<Value>]) -> DatabaseResult<()> {
        let columns = &self.entity.columns;
        if values.len() != columns.len() {
            return Err(DatabaseError::validation(format!(
                "entity {} has {} columns, {} values given",
                self.entity.name,
                columns.len(),
                values.len()
            )));
        }
        for (column, value) in columns.iter().zip(values) {
            match value {
                None if !column.def().nullable => {
                    return Err(DatabaseError::validation(format!(
                        "column {} is not nullable",
                        column.column_name()
                    )))
                }
                Some(v) if !v.conforms_to(column.value_type()) => {
                    return Err(DatabaseError::validation(format!(
                        "column {} expects {}, got {}",
                        column.column_name(),
                        column.value_type(),
                        v.value_type()
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn write_row(&self, tuple_id: TupleId, values: &[Option<Value>]) -> DatabaseResult<()> {
        let store = rows_store(&self.entity.name);
        self.tx
            .with_storage(|s| Ok(s.put_json(&store, tuple_key(tuple_id), &values)?))
    }

    /// Update indexes and columns, then signal the change
    fn propagate(
        &self,
        kind: DataChangeKind,
        tuple_id: TupleId,
        old: Option<Vec<Option<Value>>>,
        new: Option<Vec<Option<Value>>>,
    ) -> DatabaseResult<()> {
        let change = RowChange { tuple_id, old, new };
        for index in self.entity.indexes.list() {
            let index_su = match self.tx.get_or_create_sub_unit(&index) {
                Ok(index_su) => index_su,
                Err(e) if e.is_missing_object() => continue,
                Err(e) => return Err(e),
            };
            index_su.apply(&change)?;
        }

        let mut changes = Vec::with_capacity(self.entity.columns.len());
        for column in &self.entity.columns {
            let position = column.position();
            let old = change.old.as_ref().and_then(|row| row[position].clone());
            let new = change.new.as_ref().and_then(|row| row[position].clone());
            let touched = kind != DataChangeKind::Update || old != new;
            if touched {
                self.tx.get_or_create_sub_unit(column)?.mark_stale()?;
            }
            changes.push(ColumnChange {
                column: column.column_name().clone(),
                old,
                new,
            });
        }

        *self.modified.lock() += 1;
        self.tx.signal_event(Event::DataChanged {
            entity: self.entity.name.clone(),
            kind,
            payload: DataPayload { tuple_id, changes },
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Indexes
    // ------------------------------------------------------------------

    /// Create an index; it starts out stale and is built by a rebuild
    pub fn create_index(&self, name: &IndexName, definition: IndexDefinition) -> DatabaseResult<Arc<Index>> {
        self.tx.request_lock(&self.entity.name(), LockMode::Exclusive)?;
        let key = name_key(name);
        if self.tx.with_storage(|s| Ok(s.get(INDEXES_STORE, &key)?.is_some()))? {
            return Err(DatabaseError::IndexAlreadyExists(name.clone()));
        }
        let buckets = match definition.index_type {
            IndexType::Grid => self.entity.ctx.grid_buckets,
            IndexType::BTree => 0,
        };
        let descriptor = self.entity.describe_index(name, &definition, buckets)?;
        let index = Index::register(descriptor, Arc::clone(&self.entity.ctx));
        self.tx.request_lock(&index.name(), LockMode::Exclusive)?;

        let entry = IndexEntry::new(name.clone(), &definition, IndexState::Stale, buckets);
        self.tx.with_storage(|s| {
            s.put_json(INDEXES_STORE, key, &entry)?;
            s.truncate(&index_store(name))?;
            Ok(())
        })?;
        self.changes
            .lock()
            .created(&self.entity.indexes, name.clone(), Arc::clone(&index));
        self.tx.signal_event(Event::IndexCreated {
            index: name.clone(),
            index_type: definition.index_type,
            handle: index.handle(),
        });
        Ok(index)
    }

    pub fn drop_index(&self, name: &IndexName) -> DatabaseResult<()> {
        self.tx.request_lock(&self.entity.name(), LockMode::Exclusive)?;
        let index = self.index_for_name(name)?;
        self.tx.request_lock(&index.name(), LockMode::Exclusive)?;
        self.tx.with_storage(|s| {
            s.truncate(&index_store(name))?;
            s.delete(INDEXES_STORE, &name_key(name))?;
            Ok(())
        })?;
        self.tx.signal_event(Event::IndexDropped {
            index: name.clone(),
            index_type: index.index_type(),
            handle: index.handle(),
        });
        self.changes.lock().dropped(name.clone(), index);
        Ok(())
    }

    pub fn index_for_name(&self, name: &IndexName) -> DatabaseResult<Arc<Index>> {
        let missing = || DatabaseError::IndexDoesNotExist(name.clone());
        let index = self.entity.indexes.get(name).ok_or_else(missing)?;
        let key = name_key(name);
        let visible = self.tx.with_storage(|s| Ok(s.get(INDEXES_STORE, &key)?.is_some()))?;
        if index.is_retired() || !visible {
            return Err(missing());
        }
        Ok(index)
    }

    /// Names of the indexes visible to this transaction
    pub fn list_indexes(&self) -> DatabaseResult<Vec<IndexName>> {
        let mut names = Vec::new();
        for index in self.entity.indexes.list() {
            match self.index_for_name(index.index_name()) {
                Ok(_) => names.push(index.index_name().clone()),
                Err(e) if e.is_missing_object() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(names)
    }
}

impl SubUnit for EntitySubUnit {
    fn dbo_name(&self) -> Name {
        self.entity.name()
    }

    fn prepare_commit(&self) -> DatabaseResult<bool> {
        if *self.modified.lock() > 0 {
            self.entity.ctx.fail_points.check(points::ENTITY_PREPARE_COMMIT)?;
        }
        Ok(true)
    }

    fn finalize(&self, committed: bool) {
        self.changes.lock().settle(&self.entity.indexes, committed);
        let modified = std::mem::take(&mut *self.modified.lock());
        if committed && modified > 0 {
            debug!(entity = %self.entity.name, rows = modified, "entity changes committed");
        }
    }
}
