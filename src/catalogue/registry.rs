//! In-memory registries of catalogue objects
//!
//! Objects are inserted when a transaction creates them, so the creating
//! transaction can use them right away. Other transactions still cannot: a
//! sub-unit is only handed out for objects whose metadata entry is visible in
//! the caller's snapshot. The change log settles the registry at finalize.

use std::hash::Hash;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

/// Hooks run when a registry change settles
pub(crate) trait CatalogueObject: Send + Sync {
    /// The creating transaction committed
    fn publish(&self) {}

    /// The object is gone for good: dropped, or its creation rolled back
    fn retire(&self);
}

pub(crate) struct Registry<K, V> {
    entries: RwLock<IndexMap<K, Arc<V>>>,
}

impl<K: Eq + Hash + Clone, V> Registry<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(IndexMap::new()),
        }
    }

    pub(crate) fn get(&self, name: &K) -> Option<Arc<V>> {
        self.entries.read().get(name).cloned()
    }

    pub(crate) fn list(&self) -> Vec<Arc<V>> {
        self.entries.read().values().cloned().collect()
    }

    /// Insert `object`, returning the object it replaced
    pub(crate) fn insert(&self, name: K, object: Arc<V>) -> Option<Arc<V>> {
        self.entries.write().insert(name, object)
    }

    /// Remove `name` if it still maps to `object`
    fn remove_if_same(&self, name: &K, object: &Arc<V>) {
        let mut entries = self.entries.write();
        if entries.get(name).is_some_and(|current| Arc::ptr_eq(current, object)) {
            entries.shift_remove(name);
        }
    }

    /// Put `previous` back where `object` was inserted
    fn restore(&self, name: &K, object: &Arc<V>, previous: Option<Arc<V>>) {
        let mut entries = self.entries.write();
        if !entries.get(name).is_some_and(|current| Arc::ptr_eq(current, object)) {
            return;
        }
        match previous {
            Some(previous) => {
                entries.insert(name.clone(), previous);
            }
            None => {
                entries.shift_remove(name);
            }
        }
    }
}

enum Change<K, V> {
    Created {
        name: K,
        object: Arc<V>,
        replaced: Option<Arc<V>>,
    },
    Dropped {
        name: K,
        object: Arc<V>,
    },
}

/// Registry changes made by one sub-unit
pub(crate) struct ChangeLog<K, V> {
    changes: Vec<Change<K, V>>,
}

impl<K: Eq + Hash + Clone, V: CatalogueObject> ChangeLog<K, V> {
    pub(crate) fn new() -> Self {
        Self { changes: Vec::new() }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Register a new object right away
    pub(crate) fn created(&mut self, registry: &Registry<K, V>, name: K, object: Arc<V>) {
        let replaced = registry.insert(name.clone(), Arc::clone(&object));
        self.changes.push(Change::Created {
            name,
            object,
            replaced,
        });
    }

    /// Remember a drop; the object stays registered until commit
    pub(crate) fn dropped(&mut self, name: K, object: Arc<V>) {
        self.changes.push(Change::Dropped { name, object });
    }

    /// Apply (`committed`) or revert every change
    pub(crate) fn settle(&mut self, registry: &Registry<K, V>, committed: bool) {
        let changes = std::mem::take(&mut self.changes);
        if committed {
            for change in changes {
                match change {
                    Change::Created { object, .. } => object.publish(),
                    Change::Dropped { name, object } => {
                        registry.remove_if_same(&name, &object);
                        object.retire();
                    }
                }
            }
        } else {
            for change in changes.into_iter().rev() {
                if let Change::Created {
                    name,
                    object,
                    replaced,
                } = change
                {
                    registry.restore(&name, &object, replaced);
                    object.retire();
                }
            }
        }
    }
}
