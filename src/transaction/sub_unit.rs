//! Database objects and their per-transaction sub-units

use std::sync::Arc;

use crate::catalogue::{DatabaseResult, Name};

use super::tx::Transaction;

/// Per-transaction view of one DBO.
///
/// A transaction holds at most one sub-unit per DBO name. The hooks run
/// in reverse creation order during commit and rollback; `finalize` runs
/// exactly once, after the storage transaction has settled.
pub trait SubUnit: Send + Sync + 'static {
    /// Name of the DBO this sub-unit belongs to
    fn dbo_name(&self) -> Name;

    /// Last chance to refuse a commit. Returning `false` aborts it.
    fn prepare_commit(&self) -> DatabaseResult<bool> {
        Ok(true)
    }

    /// Flush buffered changes into the storage transaction
    fn commit(&self) -> DatabaseResult<()> {
        Ok(())
    }

    /// Discard buffered changes
    fn abort(&self) -> DatabaseResult<()> {
        Ok(())
    }

    /// Publish (`committed`) or drop in-memory effects
    fn finalize(&self, committed: bool) {
        let _ = committed;
    }
}

/// A database object
pub trait Dbo: Send + Sync + 'static {
    type SubUnit: SubUnit;

    fn name(&self) -> Name;

    /// Create this object's sub-unit for `tx`.
    ///
    /// Called at most once per transaction, through
    /// `Transaction::get_or_create_sub_unit`.
    fn new_sub_unit(self: Arc<Self>, tx: &Transaction) -> DatabaseResult<Self::SubUnit>;
}
