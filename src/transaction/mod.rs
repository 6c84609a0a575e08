//! Transactions
//!
//! - A transaction moves through `Idle`, `Running`, `Error`, `Finalizing` and
//!   ends in `Commit` or `Rollback`; every operation checks its permission
//!   against the current state and fails loudly otherwise
//! - Each touched DBO gets exactly one sub-unit per transaction; hooks run in
//!   reverse creation order
//! - Lock grants live until finalize, which releases them all at once
//! - Staged events are delivered to observers after a successful commit

mod errors;
mod events;
mod execution;
mod lock;
mod manager;
mod sub_unit;
mod tx;
mod types;

pub use errors::{LockError, TransactionError, TransactionResult};
pub use events::{ColumnChange, DataChangeKind, DataPayload, Event, TransactionObserver};
pub use execution::{CancellationToken, Execution, ExecutionContext, Pipeline};
pub use lock::{LockMode, LockTable};
pub use manager::TransactionManager;
pub use sub_unit::{Dbo, SubUnit};
pub use tx::{Transaction, TransactionMetadata};
pub use types::{TransactionId, TransactionStatus, TransactionType};
