//! Ordered single-column index
//!
//! Entries map an order-preserving encoding of the key to the sorted list of
//! tuple ids carrying that key. NULLs are not indexed.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::catalogue::{DatabaseError, DatabaseResult};
use crate::storage::StorageTx;
use crate::values::{Tuple, TupleId, Value};

use super::structure::{key_value, Applied, BuiltIndex, EntrySink, RowChange};
use super::IndexDescriptor;

/// Index key of a scalar value.
///
/// Ordering is deterministic: Bool < Int < Float < String.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexKey {
    Bool(bool),
    Int(i64),
    /// Float bits remapped for total ordering
    Float(u64),
    String(String),
}

const TAG_BOOL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_STRING: u8 = 3;

impl IndexKey {
    pub fn from_float(v: f64) -> Self {
        let bits = v.to_bits();
        let ordered = if (bits >> 63) == 1 {
            !bits
        } else {
            bits ^ (1 << 63)
        };
        IndexKey::Float(ordered)
    }

    /// Key of a scalar value; vectors are not indexable
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Boolean(b) => Some(IndexKey::Bool(*b)),
            Value::Int(v) => Some(IndexKey::Int(*v as i64)),
            Value::Long(v) => Some(IndexKey::Int(*v)),
            Value::Float(v) => Some(IndexKey::from_float(*v as f64)),
            Value::Double(v) => Some(IndexKey::from_float(*v)),
            Value::String(s) => Some(IndexKey::String(s.clone())),
            _ => None,
        }
    }

    /// Byte encoding whose lexicographic order matches `Ord`
    pub fn encode(&self) -> Vec<u8> {
        match self {
            IndexKey::Bool(b) => vec![TAG_BOOL, *b as u8],
            IndexKey::Int(v) => {
                let mut out = vec![TAG_INT];
                out.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes());
                out
            }
            IndexKey::Float(bits) => {
                let mut out = vec![TAG_FLOAT];
                out.extend_from_slice(&bits.to_be_bytes());
                out
            }
            IndexKey::String(s) => {
                let mut out = vec![TAG_STRING];
                out.extend_from_slice(s.as_bytes());
                out
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (tag, rest) = bytes.split_first()?;
        match *tag {
            TAG_BOOL => Some(IndexKey::Bool(*rest.first()? != 0)),
            TAG_INT => {
                let raw = u64::from_be_bytes(rest.try_into().ok()?);
                Some(IndexKey::Int((raw ^ (1 << 63)) as i64))
            }
            TAG_FLOAT => Some(IndexKey::Float(u64::from_be_bytes(rest.try_into().ok()?))),
            TAG_STRING => Some(IndexKey::String(String::from_utf8(rest.to_vec()).ok()?)),
            _ => None,
        }
    }
}

/// In-memory key → tuple ids map; ids are kept sorted ascending
#[derive(Debug, Default)]
pub struct IndexTree {
    tree: BTreeMap<IndexKey, Vec<TupleId>>,
}

impl IndexTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: IndexKey, tuple_id: TupleId) {
        let ids = self.tree.entry(key).or_default();
        if let Err(pos) = ids.binary_search(&tuple_id) {
            ids.insert(pos, tuple_id);
        }
    }

    pub fn remove(&mut self, key: &IndexKey, tuple_id: TupleId) {
        if let Some(ids) = self.tree.get_mut(key) {
            if let Ok(pos) = ids.binary_search(&tuple_id) {
                ids.remove(pos);
            }
            if ids.is_empty() {
                self.tree.remove(key);
            }
        }
    }

    pub fn lookup_eq(&self, key: &IndexKey) -> Vec<TupleId> {
        self.tree.get(key).cloned().unwrap_or_default()
    }

    pub fn key_count(&self) -> usize {
        self.tree.len()
    }

    fn iter(&self) -> impl Iterator<Item = (&IndexKey, &Vec<TupleId>)> {
        self.tree.iter()
    }
}

fn read_ids(sink: &mut dyn EntrySink, key: &[u8]) -> DatabaseResult<Vec<TupleId>> {
    match sink.get(key)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| DatabaseError::corruption(format!("btree entry: {}", e))),
        None => Ok(Vec::new()),
    }
}

fn write_ids(sink: &mut dyn EntrySink, key: Vec<u8>, ids: &[TupleId]) -> DatabaseResult<()> {
    if ids.is_empty() {
        return sink.delete(&key);
    }
    let bytes = serde_json::to_vec(ids).map_err(|e| DatabaseError::corruption(e.to_string()))?;
    sink.put(key, bytes)
}

fn unique_violation(descriptor: &IndexDescriptor, key: &IndexKey) -> DatabaseError {
    DatabaseError::UniqueViolation {
        index: descriptor.name.clone(),
        key: format!("{:?}", key),
    }
}

pub(crate) fn build(
    descriptor: &IndexDescriptor,
    rows: &[Tuple],
    sink: &mut dyn EntrySink,
) -> DatabaseResult<()> {
    let mut tree = IndexTree::new();
    for row in rows {
        if let Some(key) = key_value(descriptor, &row.values)?.and_then(IndexKey::from_value) {
            tree.insert(key, row.tuple_id);
        }
    }
    for (key, ids) in tree.iter() {
        if descriptor.unique && ids.len() > 1 {
            return Err(unique_violation(descriptor, key));
        }
        write_ids(sink, key.encode(), ids)?;
    }
    Ok(())
}

pub(crate) fn apply(
    descriptor: &IndexDescriptor,
    sink: &mut dyn EntrySink,
    change: &RowChange,
) -> DatabaseResult<Applied> {
    let old = match &change.old {
        Some(row) => key_value(descriptor, row)?.and_then(IndexKey::from_value),
        None => None,
    };
    let new = match &change.new {
        Some(row) => key_value(descriptor, row)?.and_then(IndexKey::from_value),
        None => None,
    };
    if old == new {
        return Ok(Applied::Done);
    }

    if let Some(key) = old {
        let encoded = key.encode();
        let mut ids = read_ids(sink, &encoded)?;
        ids.retain(|id| *id != change.tuple_id);
        write_ids(sink, encoded, &ids)?;
    }
    if let Some(key) = new {
        let encoded = key.encode();
        let mut ids = read_ids(sink, &encoded)?;
        if let Err(pos) = ids.binary_search(&change.tuple_id) {
            if descriptor.unique && !ids.is_empty() {
                return Err(unique_violation(descriptor, &key));
            }
            ids.insert(pos, change.tuple_id);
        }
        write_ids(sink, encoded, &ids)?;
    }
    Ok(Applied::Done)
}

pub(crate) fn count(built: &BuiltIndex) -> DatabaseResult<usize> {
    let mut total = 0;
    for (_, bytes) in built.entries() {
        let ids: Vec<TupleId> = serde_json::from_slice(bytes)
            .map_err(|e| DatabaseError::corruption(format!("btree entry: {}", e)))?;
        total += ids.len();
    }
    Ok(total)
}

/// Tuple ids whose key equals `value`
pub(crate) fn lookup(storage: &mut StorageTx, store: &str, value: &Value) -> DatabaseResult<Vec<TupleId>> {
    let Some(key) = IndexKey::from_value(value) else {
        return Err(DatabaseError::validation(format!(
            "{} values cannot be looked up in a btree index",
            value.value_type()
        )));
    };
    let mut sink = super::structure::StoreSink { storage, store };
    read_ids(&mut sink, &key.encode())
}

/// Tuple ids whose key lies in `[min, max]`; open ends are unbounded
pub(crate) fn lookup_range(
    storage: &mut StorageTx,
    store: &str,
    min: Option<&Value>,
    max: Option<&Value>,
) -> DatabaseResult<Vec<TupleId>> {
    let encode = |value: Option<&Value>| -> DatabaseResult<Option<Vec<u8>>> {
        match value {
            None => Ok(None),
            Some(v) => IndexKey::from_value(v)
                .map(|k| Some(k.encode()))
                .ok_or_else(|| DatabaseError::validation("vector values are not range-searchable")),
        }
    };
    let lower = encode(min)?;
    let upper = encode(max)?;
    if let (Some(lo), Some(hi)) = (&lower, &upper) {
        if lo > hi {
            return Ok(Vec::new());
        }
    }

    let lower_bound = lower.as_deref().map_or(Bound::Unbounded, Bound::Included);
    let upper_bound = upper.as_deref().map_or(Bound::Unbounded, Bound::Included);
    let mut result = Vec::new();
    for (_, bytes) in storage.scan_range(store, lower_bound, upper_bound)? {
        let ids: Vec<TupleId> = serde_json::from_slice(&bytes)
            .map_err(|e| DatabaseError::corruption(format!("btree entry: {}", e)))?;
        result.extend(ids);
    }
    result.sort_unstable();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering() {
        let keys = vec![
            IndexKey::Bool(false),
            IndexKey::Bool(true),
            IndexKey::Int(-100),
            IndexKey::Int(0),
            IndexKey::Int(100),
            IndexKey::from_float(-2.5),
            IndexKey::from_float(0.0),
            IndexKey::from_float(3.25),
            IndexKey::String("aaa".into()),
            IndexKey::String("zzz".into()),
        ];
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].encode() < pair[1].encode(), "{:?} vs {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_encoding_is_reversible() {
        for key in [
            IndexKey::Bool(true),
            IndexKey::Int(i64::MIN),
            IndexKey::from_float(-0.5),
            IndexKey::String("héllo".into()),
        ] {
            assert_eq!(IndexKey::decode(&key.encode()), Some(key));
        }
        assert_eq!(IndexKey::decode(&[]), None);
    }

    #[test]
    fn test_tree_keeps_ids_sorted() {
        let mut tree = IndexTree::new();
        tree.insert(IndexKey::Int(42), 300);
        tree.insert(IndexKey::Int(42), 100);
        tree.insert(IndexKey::Int(42), 200);
        tree.insert(IndexKey::Int(42), 100);
        assert_eq!(tree.lookup_eq(&IndexKey::Int(42)), vec![100, 200, 300]);

        tree.remove(&IndexKey::Int(42), 100);
        tree.remove(&IndexKey::Int(42), 200);
        tree.remove(&IndexKey::Int(42), 300);
        assert_eq!(tree.key_count(), 0);
    }

    #[test]
    fn test_vectors_are_not_keys() {
        assert_eq!(IndexKey::from_value(&Value::IntVector(vec![1])), None);
        assert_eq!(IndexKey::from_value(&Value::Int(7)), Some(IndexKey::Int(7)));
        assert_eq!(IndexKey::from_value(&Value::Long(7)), Some(IndexKey::Int(7)));
    }
}
