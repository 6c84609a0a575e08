//! Events and transaction observers
//!
//! Sub-units signal events to their transaction while it runs. On commit the
//! ordered list is shared with every relevant observer.

use serde::{Deserialize, Serialize};

use crate::catalogue::{ColumnName, EntityName, IndexName};
use crate::index::{IndexHandle, IndexState, IndexType};
use crate::values::{TupleId, Value};

use super::types::TransactionId;

/// Kind of a data mutation
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum DataChangeKind {
    Insert,
    Update,
    Delete,
}

/// Old and new value of one column in a mutated row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnChange {
    pub column: ColumnName,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// The row affected by a data mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPayload {
    pub tuple_id: TupleId,
    pub changes: Vec<ColumnChange>,
}

impl DataPayload {
    /// Change recorded for `column`, if any
    pub fn change(&self, column: &ColumnName) -> Option<&ColumnChange> {
        self.changes.iter().find(|c| &c.column == column)
    }
}

/// A change signalled during a transaction
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DataChanged {
        entity: EntityName,
        kind: DataChangeKind,
        payload: DataPayload,
    },
    ColumnStale {
        column: ColumnName,
    },
    IndexStateChanged {
        index: IndexName,
        index_type: IndexType,
        handle: IndexHandle,
        old_state: IndexState,
        new_state: IndexState,
    },
    IndexCreated {
        index: IndexName,
        index_type: IndexType,
        handle: IndexHandle,
    },
    IndexDropped {
        index: IndexName,
        index_type: IndexType,
        handle: IndexHandle,
    },
}

impl Event {
    pub fn is_data_event(&self) -> bool {
        matches!(self, Event::DataChanged { .. })
    }

    pub fn is_index_event(&self) -> bool {
        matches!(
            self,
            Event::IndexStateChanged { .. } | Event::IndexCreated { .. } | Event::IndexDropped { .. }
        )
    }

    /// Index this event is about, for index events
    pub fn index(&self) -> Option<&IndexName> {
        match self {
            Event::IndexStateChanged { index, .. }
            | Event::IndexCreated { index, .. }
            | Event::IndexDropped { index, .. } => Some(index),
            _ => None,
        }
    }
}

/// Receives the event logs of committed transactions.
///
/// Handlers run on the committing thread: they must do bookkeeping only and
/// hand expensive work to a scheduler. Implementations must be thread-safe,
/// several transactions may deliver concurrently.
pub trait TransactionObserver: Send + Sync {
    /// Whether this observer cares about `event`
    fn is_relevant(&self, event: &Event) -> bool;

    /// The committed transaction's complete, ordered event log
    fn on_commit(&self, tx: TransactionId, events: &[Event]);

    /// The transaction's events could not be delivered; nothing can be
    /// concluded about what it changed
    fn on_delivery_failure(&self, tx: TransactionId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_classification() {
        let entity = EntityName::new("s", "e");
        let data = Event::DataChanged {
            entity: entity.clone(),
            kind: DataChangeKind::Insert,
            payload: DataPayload {
                tuple_id: 1,
                changes: vec![],
            },
        };
        assert!(data.is_data_event());
        assert!(!data.is_index_event());
        assert!(data.index().is_none());

        let stale = Event::ColumnStale {
            column: entity.column("c"),
        };
        assert!(!stale.is_data_event());
    }
}
