//! Execution errors

use thiserror::Error;

/// Result type for pool operations
pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Worker pool errors
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("Failed to start worker pool '{pool}': {reason}")]
    Startup { pool: String, reason: String },

    #[error("Worker pool '{0}' is shut down")]
    Shutdown(String),
}

impl ExecutionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Startup { .. } => "QDB_EXEC_STARTUP",
            Self::Shutdown(_) => "QDB_EXEC_SHUTDOWN",
        }
    }
}
