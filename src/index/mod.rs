//! Secondary indexes
//!
//! Indexes are derived state: their entries mirror the rows of one entity and
//! can always be rebuilt from them.
//!
//! # Invariants
//!
//! - A `Clean` index reflects every committed row of its entity
//! - A `Dirty` index is usable but being merged into a new structure
//! - A `Stale` index is skipped by data changes and waits for a rebuild
//! - Entry updates happen in the same transaction as the row change
//! - A rebuild swaps the complete structure in one commit
//!
//! # Types
//!
//! - `BTree`: ordered single-column index, incremental, rebuilt synchronously
//! - `Grid`: vector quantization grid, incremental within its marks,
//!   rebuilt asynchronously in two phases

mod arena;
mod btree;
mod dbo;
mod grid;
mod rebuilder;
mod structure;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalogue::{ColumnName, IndexName};
use crate::values::Type;

pub use arena::{IndexArena, IndexHandle};
pub use btree::{IndexKey, IndexTree};
pub use dbo::{Index, IndexEntry, IndexSubUnit};
pub use grid::GridMarks;
pub use rebuilder::{AsyncIndexRebuilder, IndexRebuilder};
pub use structure::{BuiltIndex, RowChange};

/// Kind of index structure
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexType {
    BTree,
    Grid,
}

impl IndexType {
    pub fn supports_incremental_update(&self) -> bool {
        true
    }

    pub fn supports_async_rebuild(&self) -> bool {
        matches!(self, IndexType::Grid)
    }

    pub fn supports_partitioning(&self) -> bool {
        matches!(self, IndexType::Grid)
    }

    /// Whether values of `ty` can be indexed by this type
    pub fn accepts(&self, ty: Type) -> bool {
        match self {
            IndexType::BTree => !ty.is_vector(),
            IndexType::Grid => ty.is_vector(),
        }
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexType::BTree => f.write_str("BTREE"),
            IndexType::Grid => f.write_str("GRID"),
        }
    }
}

/// Whether an index reflects its entity
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexState {
    Clean,
    Dirty,
    Stale,
}

impl IndexState {
    /// Whether data changes are still propagated to the index
    pub fn accepts_changes(&self) -> bool {
        !matches!(self, IndexState::Stale)
    }
}

/// Progress of an asynchronous rebuild
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AsyncRebuildState {
    Initialized,
    Built,
    Merging,
    Finished,
    Failed,
}

impl AsyncRebuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AsyncRebuildState::Finished | AsyncRebuildState::Failed)
    }
}

/// Requested shape of a new index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub index_type: IndexType,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDefinition {
    pub fn btree(column: impl Into<String>) -> Self {
        Self {
            index_type: IndexType::BTree,
            columns: vec![column.into()],
            unique: false,
        }
    }

    pub fn unique_btree(column: impl Into<String>) -> Self {
        Self {
            unique: true,
            ..Self::btree(column)
        }
    }

    pub fn grid(column: impl Into<String>) -> Self {
        Self {
            index_type: IndexType::Grid,
            columns: vec![column.into()],
            unique: false,
        }
    }
}

/// A column covered by an index, with its row position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedColumn {
    pub name: ColumnName,
    pub position: usize,
    pub value_type: Type,
}

/// Resolved shape of an index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub name: IndexName,
    pub index_type: IndexType,
    pub columns: Vec<IndexedColumn>,
    pub unique: bool,
    pub buckets: u16,
}
