//! Transaction and lock errors

use std::time::Duration;

use thiserror::Error;

use crate::catalogue::{DatabaseError, Name};
use crate::storage::StorageError;

use super::lock::LockMode;
use super::types::{TransactionId, TransactionStatus};

/// Result type for transaction operations
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Lock table errors
#[derive(Debug, Clone, Error)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for {mode:?} lock on {object} ({holder})")]
    Timeout {
        holder: TransactionId,
        object: Name,
        mode: LockMode,
        waited: Duration,
    },

    #[error("Read-only transaction {holder} cannot lock {object} exclusively")]
    ReadOnly { holder: TransactionId, object: Name },
}

impl LockError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "QDB_LOCK_TIMEOUT",
            Self::ReadOnly { .. } => "QDB_LOCK_READ_ONLY",
        }
    }
}

/// Transaction errors
///
/// Callers branch on the variant: `IllegalState` is a programming error,
/// `InConflict` may be retried, everything else is a failure of the work
/// done inside the transaction.
#[derive(Debug, Clone, Error)]
pub enum TransactionError {
    #[error("Cannot {operation} {id}: transaction is {state}")]
    IllegalState {
        id: TransactionId,
        operation: &'static str,
        state: TransactionStatus,
    },

    #[error("Transaction {0} could not be committed because of a conflict")]
    InConflict(TransactionId),

    #[error("Transaction {id}: sub-unit of {object} refused to commit")]
    CommitVetoed { id: TransactionId, object: Name },

    #[error("Execution in transaction {0} was cancelled")]
    Cancelled(TransactionId),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Transaction manager is shut down")]
    ManagerClosed,

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<LockError> for TransactionError {
    fn from(e: LockError) -> Self {
        Self::Database(DatabaseError::Lock(e))
    }
}

impl TransactionError {
    /// Create an execution error
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// The failure is a benign race with a concurrent drop
    pub fn is_missing_object(&self) -> bool {
        matches!(self, Self::Database(e) if e.is_missing_object())
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::IllegalState { .. } => "QDB_TX_ILLEGAL_STATE",
            Self::InConflict(_) => "QDB_TX_CONFLICT",
            Self::CommitVetoed { .. } => "QDB_TX_COMMIT_VETOED",
            Self::Cancelled(_) => "QDB_TX_CANCELLED",
            Self::Execution(_) => "QDB_TX_EXECUTION",
            Self::ManagerClosed => "QDB_TX_MANAGER_CLOSED",
            Self::Database(e) => e.code(),
            Self::Storage(e) => e.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::EntityName;

    #[test]
    fn test_illegal_state_display() {
        let err = TransactionError::IllegalState {
            id: TransactionId::new(3),
            operation: "commit",
            state: TransactionStatus::Running,
        };
        assert_eq!(err.to_string(), "Cannot commit tx-3: transaction is RUNNING");
        assert_eq!(err.code(), "QDB_TX_ILLEGAL_STATE");
    }

    #[test]
    fn test_missing_object_passes_through() {
        let err: TransactionError =
            DatabaseError::EntityDoesNotExist(EntityName::new("s", "e")).into();
        assert!(err.is_missing_object());
        assert!(!TransactionError::InConflict(TransactionId::new(1)).is_missing_object());
    }
}
