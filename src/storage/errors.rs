//! Storage error types

use thiserror::Error;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage errors
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("Storage transaction already finished")]
    Finished,

    #[error("Write to store '{store}' in a read-only storage transaction")]
    ReadOnly { store: String },

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Data corruption in store '{store}': {details}")]
    Corruption { store: String, details: String },

    #[error("Storage environment is closed")]
    Closed,
}

impl StorageError {
    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Finished => "QDB_STORAGE_FINISHED",
            Self::ReadOnly { .. } => "QDB_STORAGE_READ_ONLY",
            Self::Serialization(_) => "QDB_STORAGE_SERIALIZATION",
            Self::Corruption { .. } => "QDB_DATA_CORRUPTION",
            Self::Closed => "QDB_STORAGE_CLOSED",
        }
    }

    pub fn corruption(store: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Corruption {
            store: store.into(),
            details: details.into(),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
