//! Generation-checked index slots
//!
//! Background tasks refer to indexes through an `IndexHandle`. Releasing a
//! slot bumps its generation, so a handle outliving its index resolves to
//! nothing instead of to whatever index reuses the slot.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::dbo::Index;

/// Weak reference to an index
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexHandle {
    slot: u32,
    generation: u32,
}

impl IndexHandle {
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for IndexHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.slot, self.generation)
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    index: Option<Arc<Index>>,
}

#[derive(Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Slot arena owning every live index
#[derive(Default)]
pub struct IndexArena {
    inner: RwLock<Slots>,
}

impl IndexArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the index built by `make` and return its handle
    pub fn insert_with(&self, make: impl FnOnce(IndexHandle) -> Arc<Index>) -> Arc<Index> {
        let mut inner = self.inner.write();
        let slot = match inner.free.pop() {
            Some(slot) => slot,
            None => {
                inner.slots.push(Slot::default());
                (inner.slots.len() - 1) as u32
            }
        };
        let entry = &mut inner.slots[slot as usize];
        let handle = IndexHandle {
            slot,
            generation: entry.generation,
        };
        let index = make(handle);
        entry.index = Some(Arc::clone(&index));
        index
    }

    /// The index behind `handle`, unless it was released
    pub fn get(&self, handle: IndexHandle) -> Option<Arc<Index>> {
        let inner = self.inner.read();
        let slot = inner.slots.get(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.index.clone()
    }

    /// Free the slot of `handle`; returns false for stale handles
    pub fn release(&self, handle: IndexHandle) -> bool {
        let mut inner = self.inner.write();
        let Some(slot) = inner.slots.get_mut(handle.slot as usize) else {
            return false;
        };
        if slot.generation != handle.generation || slot.index.is_none() {
            return false;
        }
        slot.index = None;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(handle.slot);
        true
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .slots
            .iter()
            .filter(|s| s.index.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
