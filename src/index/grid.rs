//! Vector quantization grid
//!
//! Each vector is mapped to a cell: one bucket per dimension, with bucket
//! boundaries derived from the per-dimension range seen at build time (the
//! marks). Vectors outside that range cannot be placed without new marks, so
//! they turn the index stale instead of being applied incrementally.
//!
//! Layout of the index store:
//! - `0x00 "marks"` → JSON `GridMarks`
//! - `0x01 <tuple id>` → JSON cell signature (`Vec<u16>`)

use serde::{Deserialize, Serialize};

use crate::catalogue::{DatabaseError, DatabaseResult};
use crate::storage::{decode_tuple_key, tuple_key, StorageTx};
use crate::values::{Tuple, TupleId, Value};

use super::structure::{key_value, Applied, BuiltIndex, EntrySink, RowChange};
use super::IndexDescriptor;

const MARKS_KEY: &[u8] = b"\x00marks";
const ENTRY_PREFIX: u8 = 0x01;

/// Per-dimension value range and bucket count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridMarks {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
    pub buckets: u16,
}

impl GridMarks {
    /// Range covering every vector in `vectors`
    pub fn covering<'a>(vectors: impl IntoIterator<Item = &'a [f64]>, buckets: u16) -> Option<Self> {
        let mut marks: Option<GridMarks> = None;
        for v in vectors {
            match marks.as_mut() {
                None => {
                    marks = Some(GridMarks {
                        min: v.to_vec(),
                        max: v.to_vec(),
                        buckets,
                    })
                }
                Some(m) => {
                    for (i, x) in v.iter().enumerate() {
                        if let (Some(lo), Some(hi)) = (m.min.get_mut(i), m.max.get_mut(i)) {
                            *lo = lo.min(*x);
                            *hi = hi.max(*x);
                        }
                    }
                }
            }
        }
        marks
    }

    /// Cell of `vector`, or `None` if it lies outside the marks
    pub fn cell(&self, vector: &[f64]) -> Option<Vec<u16>> {
        if vector.len() != self.min.len() {
            return None;
        }
        let buckets = self.buckets.max(1);
        let mut cell = Vec::with_capacity(vector.len());
        for ((x, lo), hi) in vector.iter().zip(&self.min).zip(&self.max) {
            if x.is_nan() || x < lo || x > hi {
                return None;
            }
            let width = hi - lo;
            let bucket = if width <= 0.0 {
                0
            } else {
                (((x - lo) / width) * buckets as f64).floor() as u16
            };
            cell.push(bucket.min(buckets - 1));
        }
        Some(cell)
    }
}

fn entry_key(tuple_id: TupleId) -> Vec<u8> {
    let mut key = vec![ENTRY_PREFIX];
    key.extend(tuple_key(tuple_id));
    key
}

fn vector_of(descriptor: &IndexDescriptor, row: &[Option<Value>]) -> DatabaseResult<Option<Vec<f64>>> {
    match key_value(descriptor, row)? {
        None => Ok(None),
        Some(value) => value
            .as_f64_vector()
            .map(Some)
            .ok_or_else(|| DatabaseError::validation(format!("grid index {} needs vector values", descriptor.name))),
    }
}

fn read_marks(sink: &mut dyn EntrySink) -> DatabaseResult<Option<GridMarks>> {
    match sink.get(MARKS_KEY)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| DatabaseError::corruption(format!("grid marks: {}", e))),
        None => Ok(None),
    }
}

fn encode<T: Serialize>(value: &T) -> DatabaseResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| DatabaseError::corruption(e.to_string()))
}

pub(crate) fn build(
    descriptor: &IndexDescriptor,
    rows: &[Tuple],
    sink: &mut dyn EntrySink,
) -> DatabaseResult<()> {
    let mut vectors = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(v) = vector_of(descriptor, &row.values)? {
            vectors.push((row.tuple_id, v));
        }
    }
    let Some(marks) = GridMarks::covering(vectors.iter().map(|(_, v)| v.as_slice()), descriptor.buckets)
    else {
        return Ok(());
    };
    for (tuple_id, vector) in &vectors {
        let cell = marks.cell(vector).ok_or_else(|| {
            DatabaseError::corruption(format!("vector of tuple {} has the wrong dimension", tuple_id))
        })?;
        sink.put(entry_key(*tuple_id), encode(&cell)?)?;
    }
    sink.put(MARKS_KEY.to_vec(), encode(&marks)?)
}

pub(crate) fn apply(
    descriptor: &IndexDescriptor,
    sink: &mut dyn EntrySink,
    change: &RowChange,
) -> DatabaseResult<Applied> {
    let new = match &change.new {
        Some(row) => vector_of(descriptor, row)?,
        None => None,
    };
    let cell = match &new {
        Some(vector) => match read_marks(sink)?.and_then(|m| m.cell(vector)) {
            Some(cell) => Some(cell),
            None => return Ok(Applied::Unsupported),
        },
        None => None,
    };

    let key = entry_key(change.tuple_id);
    match cell {
        Some(cell) => sink.put(key, encode(&cell)?)?,
        None => sink.delete(&key)?,
    }
    Ok(Applied::Done)
}

pub(crate) fn count(built: &BuiltIndex) -> usize {
    built
        .entries()
        .filter(|(key, _)| key.first() == Some(&ENTRY_PREFIX))
        .count()
}

/// Tuple ids sharing the cell of `value`
pub(crate) fn lookup(storage: &mut StorageTx, store: &str, value: &Value) -> DatabaseResult<Vec<TupleId>> {
    let vector = value
        .as_f64_vector()
        .ok_or_else(|| DatabaseError::validation("grid lookups need a vector"))?;
    let marks = {
        let mut sink = super::structure::StoreSink {
            storage: &mut *storage,
            store,
        };
        read_marks(&mut sink)?
    };
    let Some(cell) = marks.and_then(|m| m.cell(&vector)) else {
        return Ok(Vec::new());
    };

    let mut result = Vec::new();
    for (key, bytes) in storage.scan(store)? {
        let Some((&ENTRY_PREFIX, id)) = key.split_first() else {
            continue;
        };
        let signature: Vec<u16> = serde_json::from_slice(&bytes)
            .map_err(|e| DatabaseError::corruption(format!("grid entry: {}", e)))?;
        if signature == cell {
            if let Some(tuple_id) = decode_tuple_key(id) {
                result.push(tuple_id);
            }
        }
    }
    Ok(result)
}
