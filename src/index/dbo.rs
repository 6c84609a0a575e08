//! Index DBO and its sub-unit
//!
//! The metadata entry of an index carries its state. Every sub-unit reads
//! that entry from its snapshot when created, so a transaction whose
//! snapshot predates a state change or a swap conflicts at commit if it
//! writes to the index.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalogue::{
    index_store, name_key, CatalogueContext, CatalogueObject, DatabaseError, DatabaseResult, EntityName,
    IndexName, Name, Retired, INDEXES_STORE,
};
use crate::fail_point::FailPoints;
use crate::statistics::StatisticsManager;
use crate::transaction::{Dbo, Event, LockMode, SubUnit, Transaction, TransactionManager};
use crate::values::{TupleId, Value};

use super::arena::IndexHandle;
use super::rebuilder::{AsyncIndexRebuilder, IndexRebuilder};
use super::structure::{self, Applied, BuiltIndex, RowChange, StoreSink};
use super::{btree, grid, IndexDefinition, IndexDescriptor, IndexState, IndexType};

/// Metadata entry of an index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub name: IndexName,
    pub index_type: IndexType,
    pub state: IndexState,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub buckets: u16,
}

impl IndexEntry {
    pub fn new(name: IndexName, definition: &IndexDefinition, state: IndexState, buckets: u16) -> Self {
        Self {
            name,
            index_type: definition.index_type,
            state,
            columns: definition.columns.clone(),
            unique: definition.unique,
            buckets,
        }
    }

    pub fn definition(&self) -> IndexDefinition {
        IndexDefinition {
            index_type: self.index_type,
            columns: self.columns.clone(),
            unique: self.unique,
        }
    }
}

pub struct Index {
    descriptor: IndexDescriptor,
    handle: IndexHandle,
    statistics: Arc<StatisticsManager>,
    fail_points: Arc<FailPoints>,
    ctx: Weak<CatalogueContext>,
    retired: Retired,
}

impl Index {
    /// Create an index and give it a slot in the arena
    pub(crate) fn register(descriptor: IndexDescriptor, ctx: Arc<CatalogueContext>) -> Arc<Self> {
        ctx.arena.insert_with(|handle| {
            Arc::new(Self {
                descriptor,
                handle,
                statistics: Arc::clone(&ctx.statistics),
                fail_points: Arc::clone(&ctx.fail_points),
                ctx: Arc::downgrade(&ctx),
                retired: Retired::default(),
            })
        })
    }

    pub fn index_name(&self) -> &IndexName {
        &self.descriptor.name
    }

    pub fn entity_name(&self) -> EntityName {
        self.descriptor.name.entity()
    }

    pub fn index_type(&self) -> IndexType {
        self.descriptor.index_type
    }

    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    pub fn handle(&self) -> IndexHandle {
        self.handle
    }

    pub fn is_retired(&self) -> bool {
        self.retired.get()
    }

    pub(crate) fn fail_points(&self) -> &FailPoints {
        &self.fail_points
    }

    /// Store holding this index's entries
    pub fn data_store(&self) -> String {
        index_store(&self.descriptor.name)
    }

    /// Rebuilder running inside a caller's transaction
    pub fn new_rebuilder(self: &Arc<Self>) -> IndexRebuilder {
        IndexRebuilder::new(Arc::clone(self))
    }

    /// Two-phase rebuilder, for types that support it
    pub fn new_async_rebuilder(self: &Arc<Self>, manager: &TransactionManager) -> DatabaseResult<AsyncIndexRebuilder> {
        if !self.index_type().supports_async_rebuild() {
            return Err(DatabaseError::validation(format!(
                "{} indexes cannot be rebuilt asynchronously",
                self.index_type()
            )));
        }
        Ok(AsyncIndexRebuilder::new(Arc::clone(self), manager.clone()))
    }
}

impl CatalogueObject for Index {
    fn retire(&self) {
        if self.retired.set() {
            if let Some(ctx) = self.ctx.upgrade() {
                ctx.arena.release(self.handle);
            }
            self.statistics.remove_index(&self.descriptor.name);
            debug!(index = %self.descriptor.name, handle = %self.handle, "index retired");
        }
    }
}

impl Dbo for Index {
    type SubUnit = IndexSubUnit;

    fn name(&self) -> Name {
        Name::Index(self.descriptor.name.clone())
    }

    fn new_sub_unit(self: Arc<Self>, tx: &Transaction) -> DatabaseResult<IndexSubUnit> {
        let key = name_key(&self.descriptor.name);
        let entry: Option<IndexEntry> = tx.with_storage(|s| Ok(s.get_json(INDEXES_STORE, &key)?))?;
        let entry = match entry {
            Some(entry) if !self.is_retired() => entry,
            _ => return Err(DatabaseError::IndexDoesNotExist(self.descriptor.name.clone())),
        };
        Ok(IndexSubUnit {
            index: self,
            tx: tx.clone(),
            entry: Mutex::new(entry),
            rebuilt: Mutex::new(None),
        })
    }
}

/// An index as seen by one transaction
pub struct IndexSubUnit {
    index: Arc<Index>,
    tx: Transaction,
    entry: Mutex<IndexEntry>,
    /// Tuples indexed by a structure written in this transaction
    rebuilt: Mutex<Option<usize>>,
}

impl IndexSubUnit {
    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    pub fn state(&self) -> DatabaseResult<IndexState> {
        self.tx.request_lock(&self.index.name(), LockMode::Shared)?;
        Ok(self.entry.lock().state)
    }

    /// Change the state of the index, signalling the transition
    pub fn update_state(&self, new_state: IndexState) -> DatabaseResult<()> {
        self.tx.request_lock(&self.index.name(), LockMode::Exclusive)?;
        let mut entry = self.entry.lock().clone();
        let old_state = entry.state;
        if old_state == new_state {
            return Ok(());
        }
        entry.state = new_state;
        let key = name_key(&entry.name);
        self.tx
            .with_storage(|s| Ok(s.put_json(INDEXES_STORE, key, &entry)?))?;
        *self.entry.lock() = entry;

        self.tx.signal_event(Event::IndexStateChanged {
            index: self.index.descriptor.name.clone(),
            index_type: self.index.index_type(),
            handle: self.index.handle,
            old_state,
            new_state,
        });
        debug!(index = %self.index.descriptor.name, ?old_state, ?new_state, "index state changed");
        Ok(())
    }

    /// Apply one row change; a change that cannot be applied incrementally
    /// turns the index stale
    pub fn apply(&self, change: &RowChange) -> DatabaseResult<()> {
        self.tx.request_lock(&self.index.name(), LockMode::Exclusive)?;
        if !self.entry.lock().state.accepts_changes() {
            return Ok(());
        }
        let store = self.index.data_store();
        let applied = self.tx.with_storage(|storage| {
            let mut sink = StoreSink {
                storage,
                store: &store,
            };
            structure::apply(&self.index.descriptor, &mut sink, change)
        })?;
        if applied == Applied::Unsupported {
            self.update_state(IndexState::Stale)?;
        }
        Ok(())
    }

    /// Rebuild the index from the rows visible to this transaction
    pub fn rebuild(&self) -> DatabaseResult<()> {
        let entity = self.index.entity_name();
        self.tx.request_lock(&Name::Entity(entity.clone()), LockMode::Shared)?;
        self.tx.request_lock(&self.index.name(), LockMode::Exclusive)?;
        let rows = self
            .tx
            .with_storage(|s| crate::catalogue::scan_rows(s, &entity))?;
        let built = structure::build(&self.index.descriptor, &rows)?;
        self.write_built(&built)?;
        self.update_state(IndexState::Clean)
    }

    /// Replace every entry with the contents of `built`
    pub fn write_built(&self, built: &BuiltIndex) -> DatabaseResult<()> {
        self.tx.request_lock(&self.index.name(), LockMode::Exclusive)?;
        let indexed = structure::indexed_tuples(&self.index.descriptor, built)?;
        let store = self.index.data_store();
        self.tx.with_storage(|s| {
            s.truncate(&store)?;
            for (key, value) in built.entries() {
                s.put(&store, key.clone(), value.clone())?;
            }
            Ok(())
        })?;
        *self.rebuilt.lock() = Some(indexed);
        Ok(())
    }

    /// Tuples whose indexed value matches `value`
    pub fn lookup(&self, value: &Value) -> DatabaseResult<Vec<TupleId>> {
        self.check_usable()?;
        let store = self.index.data_store();
        self.tx.with_storage(|s| match self.index.index_type() {
            IndexType::BTree => btree::lookup(s, &store, value),
            IndexType::Grid => grid::lookup(s, &store, value),
        })
    }

    /// Tuples whose indexed value lies in `[min, max]`
    pub fn lookup_range(&self, min: Option<&Value>, max: Option<&Value>) -> DatabaseResult<Vec<TupleId>> {
        self.check_usable()?;
        if self.index.index_type() != IndexType::BTree {
            return Err(DatabaseError::validation(format!(
                "{} indexes do not support range lookups",
                self.index.index_type()
            )));
        }
        let store = self.index.data_store();
        self.tx
            .with_storage(|s| btree::lookup_range(s, &store, min, max))
    }

    /// Every entry of the index
    pub fn entries(&self) -> DatabaseResult<BuiltIndex> {
        self.tx.request_lock(&self.index.name(), LockMode::Shared)?;
        let store = self.index.data_store();
        let entries = self.tx.with_storage(|s| Ok(s.scan(&store)?))?;
        Ok(entries.into_iter().collect())
    }

    /// Number of tuples the index refers to
    pub fn count(&self) -> DatabaseResult<usize> {
        let entries = self.entries()?;
        structure::indexed_tuples(&self.index.descriptor, &entries)
    }

    fn check_usable(&self) -> DatabaseResult<()> {
        if self.state()? == IndexState::Stale {
            return Err(DatabaseError::validation(format!(
                "index {} is stale and must be rebuilt before use",
                self.index.descriptor.name
            )));
        }
        Ok(())
    }
}

impl SubUnit for IndexSubUnit {
    fn dbo_name(&self) -> Name {
        self.index.name()
    }

    fn finalize(&self, committed: bool) {
        let rebuilt = self.rebuilt.lock().take();
        if !committed || self.index.is_retired() {
            return;
        }
        if let Some(entries) = rebuilt {
            self.index
                .statistics
                .record_index(&self.index.descriptor.name, entries, true);
        }
    }
}
