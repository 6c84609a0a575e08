//! Column and index statistics
//!
//! Statistics live in memory and are written to the `statistics.*` stores
//! by the persister. Every change bumps a version counter; the buffer is
//! dirty while that version is ahead of the last persisted one.
//!
//! Every time a committed change marks a column stale it also takes the next
//! number of a stale-mark sequence. A service reads `stale_checkpoint()`
//! before opening its snapshot and publishes through `update_column_since`,
//! which keeps the column stale if it was marked after that checkpoint.

mod collectors;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalogue::{name_key, ColumnName, DatabaseError, DatabaseResult, EntityName, IndexName};
use crate::storage::StorageTx;
use crate::values::Type;

pub use collectors::{
    collector_for, BooleanCollector, ColumnMetrics, MetricsCollector, NumericCollector,
    StringCollector, VectorCollector,
};

pub const COLUMN_STATISTICS_STORE: &str = "statistics.columns";
pub const INDEX_STATISTICS_STORE: &str = "statistics.indexes";

/// What is known about the values of one column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStatistic {
    pub column: ColumnName,
    pub value_type: Type,
    /// False once data changed after the metrics were computed
    pub fresh: bool,
    pub metrics: Option<ColumnMetrics>,
    pub analysed_at: Option<DateTime<Utc>>,
}

impl ColumnStatistic {
    /// Statistic of a column without data
    pub fn empty(column: ColumnName, value_type: Type) -> Self {
        Self {
            column,
            value_type,
            fresh: true,
            metrics: None,
            analysed_at: None,
        }
    }

    /// Freshly computed statistic
    pub fn analysed(column: ColumnName, value_type: Type, metrics: ColumnMetrics) -> Self {
        Self {
            column,
            value_type,
            fresh: true,
            metrics: Some(metrics),
            analysed_at: Some(Utc::now()),
        }
    }
}

/// Size and rebuild history of one index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStatistic {
    pub index: IndexName,
    pub entries: usize,
    pub rebuilds: u64,
    pub last_rebuilt: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct StatisticsState {
    columns: IndexMap<ColumnName, ColumnStatistic>,
    indexes: IndexMap<IndexName, IndexStatistic>,
    version: u64,
    persisted: u64,
    /// Latest stale mark per column
    stale_marks: HashMap<ColumnName, u64>,
    stale_seq: u64,
}

impl StatisticsState {
    fn touch(&mut self) {
        self.version += 1;
    }
}

/// Buffer of all statistics
#[derive(Debug, Default)]
pub struct StatisticsManager {
    state: RwLock<StatisticsState>,
}

impl StatisticsManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column(&self, name: &ColumnName) -> Option<ColumnStatistic> {
        self.state.read().columns.get(name).cloned()
    }

    /// Whether the metrics of `name` still describe its data.
    ///
    /// Unknown columns are not fresh.
    pub fn is_fresh(&self, name: &ColumnName) -> bool {
        self.state
            .read()
            .columns
            .get(name)
            .map(|s| s.fresh)
            .unwrap_or(false)
    }

    pub fn columns(&self) -> Vec<ColumnStatistic> {
        self.state.read().columns.values().cloned().collect()
    }

    /// Register a column unless it is already known
    pub fn register_column(&self, name: ColumnName, value_type: Type) {
        let mut state = self.state.write();
        if !state.columns.contains_key(&name) {
            state
                .columns
                .insert(name.clone(), ColumnStatistic::empty(name, value_type));
            state.touch();
        }
    }

    pub fn update_column(&self, statistic: ColumnStatistic) {
        let mut state = self.state.write();
        state.columns.insert(statistic.column.clone(), statistic);
        state.touch();
    }

    /// Mark `name` stale; returns whether it was fresh
    pub fn mark_column_stale(&self, name: &ColumnName) -> bool {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let Some(statistic) = state.columns.get_mut(name) else {
            return false;
        };
        let was_fresh = statistic.fresh;
        statistic.fresh = false;
        state.stale_seq += 1;
        state.stale_marks.insert(name.clone(), state.stale_seq);
        if was_fresh {
            state.touch();
        }
        was_fresh
    }

    /// Position of the stale-mark sequence; read before opening the
    /// snapshot statistics are computed from
    pub fn stale_checkpoint(&self) -> u64 {
        self.state.read().stale_seq
    }

    /// Store `statistic`, computed from a snapshot opened after
    /// `checkpoint`.
    ///
    /// Returns false if the column was marked stale after `checkpoint`, in
    /// which case the statistic is kept but not fresh, or if the column is
    /// no longer known, in which case nothing is stored.
    pub fn update_column_since(&self, mut statistic: ColumnStatistic, checkpoint: u64) -> bool {
        let mut state = self.state.write();
        if !state.columns.contains_key(&statistic.column) {
            return false;
        }
        let unchanged = state
            .stale_marks
            .get(&statistic.column)
            .map_or(true, |mark| *mark <= checkpoint);
        if !unchanged {
            statistic.fresh = false;
        }
        state.columns.insert(statistic.column.clone(), statistic);
        state.touch();
        unchanged
    }

    pub fn remove_column(&self, name: &ColumnName) {
        let mut state = self.state.write();
        state.stale_marks.remove(name);
        if state.columns.shift_remove(name).is_some() {
            state.touch();
        }
    }

    /// Remove the statistics of every column of `entity`
    pub fn remove_entity(&self, entity: &EntityName) {
        let mut state = self.state.write();
        let before = state.columns.len();
        state.columns.retain(|name, _| &name.entity() != entity);
        state.stale_marks.retain(|name, _| &name.entity() != entity);
        if state.columns.len() != before {
            state.touch();
        }
    }

    pub fn index(&self, name: &IndexName) -> Option<IndexStatistic> {
        self.state.read().indexes.get(name).cloned()
    }

    pub fn indexes(&self) -> Vec<IndexStatistic> {
        self.state.read().indexes.values().cloned().collect()
    }

    /// Record the size of an index, counting a rebuild if `rebuilt`
    pub fn record_index(&self, name: &IndexName, entries: usize, rebuilt: bool) {
        let mut state = self.state.write();
        let statistic = state
            .indexes
            .entry(name.clone())
            .or_insert_with(|| IndexStatistic {
                index: name.clone(),
                entries: 0,
                rebuilds: 0,
                last_rebuilt: None,
            });
        statistic.entries = entries;
        if rebuilt {
            statistic.rebuilds += 1;
            statistic.last_rebuilt = Some(Utc::now());
        }
        state.touch();
    }

    pub fn remove_index(&self, name: &IndexName) {
        let mut state = self.state.write();
        if state.indexes.shift_remove(name).is_some() {
            state.touch();
        }
    }

    /// Current version of the buffer
    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// Something changed since the last persist
    pub fn is_dirty(&self) -> bool {
        let state = self.state.read();
        state.version != state.persisted
    }

    /// Write every statistic to `storage`; returns the version written.
    ///
    /// The buffer only becomes clean through `mark_persisted` once the
    /// storage transaction has committed.
    pub fn persist(&self, storage: &mut StorageTx) -> DatabaseResult<u64> {
        let (version, columns, indexes) = {
            let state = self.state.read();
            (
                state.version,
                state.columns.values().cloned().collect::<Vec<_>>(),
                state.indexes.values().cloned().collect::<Vec<_>>(),
            )
        };
        storage.truncate(COLUMN_STATISTICS_STORE)?;
        for statistic in &columns {
            storage.put_json(COLUMN_STATISTICS_STORE, name_key(&statistic.column), statistic)?;
        }
        storage.truncate(INDEX_STATISTICS_STORE)?;
        for statistic in &indexes {
            storage.put_json(INDEX_STATISTICS_STORE, name_key(&statistic.index), statistic)?;
        }
        debug!(version, columns = columns.len(), indexes = indexes.len(), "statistics written");
        Ok(version)
    }

    /// Record that `version` reached storage; returns whether the buffer is
    /// now clean
    pub fn mark_persisted(&self, version: u64) -> bool {
        let mut state = self.state.write();
        if version > state.persisted {
            state.persisted = version;
        }
        state.persisted == state.version
    }

    /// Replace the buffer with the statistics found in `storage`
    pub fn load(&self, storage: &mut StorageTx) -> DatabaseResult<()> {
        let mut columns = IndexMap::new();
        for (_, bytes) in storage.scan(COLUMN_STATISTICS_STORE)? {
            let statistic: ColumnStatistic = serde_json::from_slice(&bytes)
                .map_err(|e| DatabaseError::corruption(format!("column statistic: {}", e)))?;
            columns.insert(statistic.column.clone(), statistic);
        }
        let mut indexes = IndexMap::new();
        for (_, bytes) in storage.scan(INDEX_STATISTICS_STORE)? {
            let statistic: IndexStatistic = serde_json::from_slice(&bytes)
                .map_err(|e| DatabaseError::corruption(format!("index statistic: {}", e)))?;
            indexes.insert(statistic.index.clone(), statistic);
        }

        let mut state = self.state.write();
        state.columns = columns;
        state.indexes = indexes;
        state.stale_marks.clear();
        state.persisted = state.version;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Environment;

    fn column(name: &str) -> ColumnName {
        ColumnName::new("s", "e", name)
    }

    #[test]
    fn test_stale_transition_reported_once() {
        let manager = StatisticsManager::new();
        manager.register_column(column("a"), Type::Int);
        assert!(manager.is_fresh(&column("a")));

        assert!(manager.mark_column_stale(&column("a")));
        assert!(!manager.mark_column_stale(&column("a")));
        assert!(!manager.is_fresh(&column("a")));
        assert!(!manager.mark_column_stale(&column("missing")));
    }

    #[test]
    fn test_persist_roundtrip_and_dirtiness() {
        let env = Environment::new();
        let manager = StatisticsManager::new();
        manager.register_column(column("a"), Type::Int);
        manager.record_index(&IndexName::new("s", "e", "i"), 10, true);
        assert!(manager.is_dirty());

        let mut tx = env.begin(false).unwrap();
        let version = manager.persist(&mut tx).unwrap();
        assert!(tx.commit().unwrap());
        assert!(manager.mark_persisted(version));
        assert!(!manager.is_dirty());

        let reloaded = StatisticsManager::new();
        let mut tx = env.begin(true).unwrap();
        reloaded.load(&mut tx).unwrap();
        assert_eq!(reloaded.column(&column("a")), manager.column(&column("a")));
        assert_eq!(reloaded.index(&IndexName::new("s", "e", "i")).unwrap().rebuilds, 1);
        assert!(!reloaded.is_dirty());
    }

    #[test]
    fn test_change_during_persist_keeps_buffer_dirty() {
        let env = Environment::new();
        let manager = StatisticsManager::new();
        manager.register_column(column("a"), Type::Int);

        let mut tx = env.begin(false).unwrap();
        let version = manager.persist(&mut tx).unwrap();
        manager.mark_column_stale(&column("a"));
        assert!(tx.commit().unwrap());

        assert!(!manager.mark_persisted(version));
        assert!(manager.is_dirty());
    }

    #[test]
    fn test_stale_mark_after_checkpoint_keeps_column_stale() {
        let manager = StatisticsManager::new();
        manager.register_column(column("a"), Type::Int);
        manager.register_column(column("b"), Type::Int);
        manager.mark_column_stale(&column("a"));
        manager.mark_column_stale(&column("b"));

        let checkpoint = manager.stale_checkpoint();
        // already stale, still counts as a change after the checkpoint
        assert!(!manager.mark_column_stale(&column("a")));

        let analysed = |name: &str| {
            ColumnStatistic::analysed(column(name), Type::Int, collector_for(Type::Int).finalize())
        };
        assert!(!manager.update_column_since(analysed("a"), checkpoint));
        assert!(manager.update_column_since(analysed("b"), checkpoint));
        assert!(!manager.is_fresh(&column("a")));
        assert!(manager.column(&column("a")).unwrap().metrics.is_some());
        assert!(manager.is_fresh(&column("b")));

        let checkpoint = manager.stale_checkpoint();
        assert!(manager.update_column_since(analysed("a"), checkpoint));
        assert!(manager.is_fresh(&column("a")));
    }

    #[test]
    fn test_update_since_ignores_removed_column() {
        let manager = StatisticsManager::new();
        manager.register_column(column("a"), Type::Int);
        let checkpoint = manager.stale_checkpoint();
        manager.remove_column(&column("a"));

        let statistic = ColumnStatistic::empty(column("a"), Type::Int);
        assert!(!manager.update_column_since(statistic, checkpoint));
        assert!(manager.column(&column("a")).is_none());
    }

    #[test]
    fn test_remove_entity_drops_its_columns() {
        let manager = StatisticsManager::new();
        manager.register_column(column("a"), Type::Int);
        manager.register_column(ColumnName::new("s", "other", "a"), Type::Int);
        manager.remove_entity(&EntityName::new("s", "e"));
        assert_eq!(manager.columns().len(), 1);
    }
}
