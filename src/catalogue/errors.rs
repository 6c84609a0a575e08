//! Errors raised by database objects and their sub-units

use thiserror::Error;

use crate::fail_point::FailPointTriggered;
use crate::index::AsyncRebuildState;
use crate::storage::StorageError;
use crate::transaction::{LockError, TransactionId};
use crate::values::TupleId;

use super::names::{ColumnName, EntityName, IndexName, SchemaName};

/// Result type for DBO operations
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// DBO errors
#[derive(Debug, Clone, Error)]
pub enum DatabaseError {
    #[error("Schema {0} does not exist")]
    SchemaDoesNotExist(SchemaName),

    #[error("Schema {0} already exists")]
    SchemaAlreadyExists(SchemaName),

    #[error("Entity {0} does not exist")]
    EntityDoesNotExist(EntityName),

    #[error("Entity {0} already exists")]
    EntityAlreadyExists(EntityName),

    #[error("Column {0} does not exist")]
    ColumnDoesNotExist(ColumnName),

    #[error("Index {0} does not exist")]
    IndexDoesNotExist(IndexName),

    #[error("Index {0} already exists")]
    IndexAlreadyExists(IndexName),

    #[error("Tuple {tuple_id} does not exist in {entity}")]
    TupleDoesNotExist { entity: EntityName, tuple_id: TupleId },

    #[error("Unique constraint of index {index} violated by key {key}")]
    UniqueViolation { index: IndexName, key: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Data corruption: {0}")]
    DataCorruption(String),

    #[error("Rebuild of {index} requires state {expected:?}, found {actual:?}")]
    RebuildState {
        index: IndexName,
        expected: AsyncRebuildState,
        actual: AsyncRebuildState,
    },

    #[error("Transaction {0} is no longer open")]
    TransactionClosed(TransactionId),

    #[error(transparent)]
    FailPoint(#[from] FailPointTriggered),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl DatabaseError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a data corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::DataCorruption(msg.into())
    }

    /// The object addressed by a name no longer exists.
    ///
    /// Background tasks treat this as a benign race with a concurrent drop.
    pub fn is_missing_object(&self) -> bool {
        matches!(
            self,
            Self::SchemaDoesNotExist(_)
                | Self::EntityDoesNotExist(_)
                | Self::ColumnDoesNotExist(_)
                | Self::IndexDoesNotExist(_)
        )
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::SchemaDoesNotExist(_) => "QDB_SCHEMA_DOES_NOT_EXIST",
            Self::SchemaAlreadyExists(_) => "QDB_SCHEMA_ALREADY_EXISTS",
            Self::EntityDoesNotExist(_) => "QDB_ENTITY_DOES_NOT_EXIST",
            Self::EntityAlreadyExists(_) => "QDB_ENTITY_ALREADY_EXISTS",
            Self::ColumnDoesNotExist(_) => "QDB_COLUMN_DOES_NOT_EXIST",
            Self::IndexDoesNotExist(_) => "QDB_INDEX_DOES_NOT_EXIST",
            Self::IndexAlreadyExists(_) => "QDB_INDEX_ALREADY_EXISTS",
            Self::TupleDoesNotExist { .. } => "QDB_TUPLE_DOES_NOT_EXIST",
            Self::UniqueViolation { .. } => "QDB_UNIQUE_VIOLATION",
            Self::Validation(_) => "QDB_VALIDATION",
            Self::DataCorruption(_) => "QDB_DATA_CORRUPTION",
            Self::RebuildState { .. } => "QDB_REBUILD_STATE",
            Self::TransactionClosed(_) => "QDB_TX_CLOSED",
            Self::FailPoint(_) => "QDB_FAIL_POINT",
            Self::Lock(e) => e.code(),
            Self::Storage(e) => e.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_object_classification() {
        let entity = EntityName::new("s", "e");
        assert!(DatabaseError::EntityDoesNotExist(entity.clone()).is_missing_object());
        assert!(DatabaseError::IndexDoesNotExist(entity.index("i")).is_missing_object());
        assert!(!DatabaseError::EntityAlreadyExists(entity).is_missing_object());
        assert!(!DatabaseError::validation("bad").is_missing_object());
    }

    #[test]
    fn test_error_display() {
        let err = DatabaseError::ColumnDoesNotExist(ColumnName::new("s", "e", "c"));
        assert_eq!(err.to_string(), "Column s.e.c does not exist");
        assert_eq!(err.code(), "QDB_COLUMN_DOES_NOT_EXIST");
    }
}
