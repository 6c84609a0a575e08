//! Index structures and their maintenance
//!
//! Every index type keeps its entries as key/value pairs. The same
//! maintenance code runs against the index store inside a transaction and
//! against an in-memory `BuiltIndex` assembled by an asynchronous rebuild.

use std::collections::BTreeMap;

use crate::catalogue::{DatabaseError, DatabaseResult};
use crate::storage::StorageTx;
use crate::transaction::{DataChangeKind, DataPayload};
use crate::values::{Tuple, TupleId, Value};

use super::{btree, grid, IndexDescriptor, IndexType};

/// Key/value target of index maintenance
pub(crate) trait EntrySink {
    fn get(&mut self, key: &[u8]) -> DatabaseResult<Option<Vec<u8>>>;

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> DatabaseResult<()>;

    fn delete(&mut self, key: &[u8]) -> DatabaseResult<()>;
}

/// The index store seen through a storage transaction
pub(crate) struct StoreSink<'a> {
    pub(crate) storage: &'a mut StorageTx,
    pub(crate) store: &'a str,
}

impl EntrySink for StoreSink<'_> {
    fn get(&mut self, key: &[u8]) -> DatabaseResult<Option<Vec<u8>>> {
        Ok(self.storage.get(self.store, key)?)
    }

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> DatabaseResult<()> {
        Ok(self.storage.put(self.store, key, value)?)
    }

    fn delete(&mut self, key: &[u8]) -> DatabaseResult<()> {
        Ok(self.storage.delete(self.store, key)?)
    }
}

/// A complete index structure held in memory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuiltIndex {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl BuiltIndex {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&Vec<u8>, &Vec<u8>)> {
        self.entries.iter()
    }
}

impl FromIterator<(Vec<u8>, Vec<u8>)> for BuiltIndex {
    fn from_iter<I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl EntrySink for BuiltIndex {
    fn get(&mut self, key: &[u8]) -> DatabaseResult<Option<Vec<u8>>> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> DatabaseResult<()> {
        self.entries.insert(key, value);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> DatabaseResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// One row mutation, with full old and new rows
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub tuple_id: TupleId,
    pub old: Option<Vec<Option<Value>>>,
    pub new: Option<Vec<Option<Value>>>,
}

impl RowChange {
    /// Reassemble a row change from an event payload listing every column
    pub fn from_payload(kind: DataChangeKind, payload: &DataPayload) -> Self {
        let old = match kind {
            DataChangeKind::Insert => None,
            _ => Some(payload.changes.iter().map(|c| c.old.clone()).collect()),
        };
        let new = match kind {
            DataChangeKind::Delete => None,
            _ => Some(payload.changes.iter().map(|c| c.new.clone()).collect()),
        };
        Self {
            tuple_id: payload.tuple_id,
            old,
            new,
        }
    }
}

/// Result of an incremental update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applied {
    Done,
    /// The change cannot be applied incrementally; the index is now stale
    Unsupported,
}

/// Value of the first indexed column in `row`
pub(crate) fn key_value<'a>(
    descriptor: &IndexDescriptor,
    row: &'a [Option<Value>],
) -> DatabaseResult<Option<&'a Value>> {
    let column = descriptor
        .columns
        .first()
        .ok_or_else(|| DatabaseError::corruption(format!("index {} has no columns", descriptor.name)))?;
    match row.get(column.position) {
        Some(value) => Ok(value.as_ref()),
        None => Err(DatabaseError::corruption(format!(
            "row too short for column {} of index {}",
            column.name, descriptor.name
        ))),
    }
}

/// Build a complete structure from `rows`
pub(crate) fn build(descriptor: &IndexDescriptor, rows: &[Tuple]) -> DatabaseResult<BuiltIndex> {
    let mut built = BuiltIndex::default();
    match descriptor.index_type {
        IndexType::BTree => btree::build(descriptor, rows, &mut built)?,
        IndexType::Grid => grid::build(descriptor, rows, &mut built)?,
    }
    Ok(built)
}

/// Number of tuples referenced by `built`
pub(crate) fn indexed_tuples(descriptor: &IndexDescriptor, built: &BuiltIndex) -> DatabaseResult<usize> {
    match descriptor.index_type {
        IndexType::BTree => btree::count(built),
        IndexType::Grid => Ok(grid::count(built)),
    }
}

/// Apply one row mutation to existing entries
pub(crate) fn apply(
    descriptor: &IndexDescriptor,
    sink: &mut dyn EntrySink,
    change: &RowChange,
) -> DatabaseResult<Applied> {
    if !descriptor.index_type.supports_incremental_update() {
        return Ok(Applied::Unsupported);
    }
    match descriptor.index_type {
        IndexType::BTree => btree::apply(descriptor, sink, change),
        IndexType::Grid => grid::apply(descriptor, sink, change),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::EntityName;
    use crate::transaction::ColumnChange;

    #[test]
    fn test_row_change_from_update_payload() {
        let entity = EntityName::new("s", "e");
        let payload = DataPayload {
            tuple_id: 9,
            changes: vec![
                ColumnChange {
                    column: entity.column("a"),
                    old: Some(Value::Int(1)),
                    new: Some(Value::Int(2)),
                },
                ColumnChange {
                    column: entity.column("b"),
                    old: None,
                    new: None,
                },
            ],
        };
        let change = RowChange::from_payload(DataChangeKind::Update, &payload);
        assert_eq!(change.tuple_id, 9);
        assert_eq!(change.old, Some(vec![Some(Value::Int(1)), None]));
        assert_eq!(change.new, Some(vec![Some(Value::Int(2)), None]));

        let delete = RowChange::from_payload(DataChangeKind::Delete, &payload);
        assert!(delete.new.is_none());
    }
}
