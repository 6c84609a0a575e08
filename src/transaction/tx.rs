//! Transactions
//!
//! A transaction owns one storage transaction, the sub-units of every DBO it
//! touched (in creation order), its staged events and the cancellation tokens
//! of its running pipelines. All state transitions happen under `state`.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, instrument, warn};

use crate::catalogue::{DatabaseError, DatabaseResult, Name};
use crate::storage::StorageTx;

use super::errors::{LockError, TransactionError, TransactionResult};
use super::events::Event;
use super::execution::{drive, CancellationToken, Execution, ExecutionContext, ExecutionMessage, Pipeline};
use super::lock::LockMode;
use super::manager::ManagerShared;
use super::sub_unit::{Dbo, SubUnit};
use super::types::{TransactionId, TransactionStatus, TransactionType};

#[derive(Debug)]
struct TxState {
    status: TransactionStatus,
    ended: Option<DateTime<Utc>>,
    success: u64,
    error: u64,
    locks_released: usize,
    executions: HashMap<u64, CancellationToken>,
    next_execution: u64,
}

/// Events staged by a transaction, bounded in size
#[derive(Debug, Default)]
pub(crate) struct EventLog {
    pub(crate) events: Vec<Event>,
    pub(crate) overflowed: bool,
}

struct CachedSubUnit {
    unit: Arc<dyn SubUnit>,
    any: Arc<dyn Any + Send + Sync>,
}

struct TransactionInner {
    id: TransactionId,
    kind: TransactionType,
    created: DateTime<Utc>,
    state: Mutex<TxState>,
    /// Signalled whenever the last running execution completes
    drained: Condvar,
    sub_units: Mutex<IndexMap<Name, CachedSubUnit>>,
    storage: Mutex<Option<StorageTx>>,
    events: Mutex<EventLog>,
    max_staged_events: usize,
    manager: Weak<ManagerShared>,
}

/// Reporting view of a transaction
#[derive(Debug, Clone, Serialize)]
pub struct TransactionMetadata {
    pub id: TransactionId,
    pub kind: TransactionType,
    pub state: TransactionStatus,
    pub created: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    pub success: u64,
    pub error: u64,
    pub ongoing: usize,
    pub locks_released: usize,
}

/// Handle to a transaction. Clones share the same transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        kind: TransactionType,
        storage: StorageTx,
        manager: Weak<ManagerShared>,
        max_staged_events: usize,
    ) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                id,
                kind,
                created: Utc::now(),
                state: Mutex::new(TxState {
                    status: TransactionStatus::Idle,
                    ended: None,
                    success: 0,
                    error: 0,
                    locks_released: 0,
                    executions: HashMap::new(),
                    next_execution: 0,
                }),
                drained: Condvar::new(),
                sub_units: Mutex::new(IndexMap::new()),
                storage: Mutex::new(Some(storage)),
                events: Mutex::new(EventLog::default()),
                max_staged_events,
                manager,
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    pub fn kind(&self) -> TransactionType {
        self.inner.kind
    }

    pub fn state(&self) -> TransactionStatus {
        self.inner.state.lock().status
    }

    /// Number of pipelines currently running
    pub fn ongoing(&self) -> usize {
        self.inner.state.lock().executions.len()
    }

    pub fn metadata(&self) -> TransactionMetadata {
        let state = self.inner.state.lock();
        TransactionMetadata {
            id: self.inner.id,
            kind: self.inner.kind,
            state: state.status,
            created: self.inner.created,
            ended: state.ended,
            success: state.success,
            error: state.error,
            ongoing: state.executions.len(),
            locks_released: state.locks_released,
        }
    }

    fn manager(&self) -> TransactionResult<Arc<ManagerShared>> {
        self.inner.manager.upgrade().ok_or(TransactionError::ManagerClosed)
    }

    fn illegal(&self, operation: &'static str, state: TransactionStatus) -> TransactionError {
        TransactionError::IllegalState {
            id: self.inner.id,
            operation,
            state,
        }
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Run `pipeline` on the dispatcher pool.
    ///
    /// Moves the transaction to `Running`. Once the last execution completes
    /// the transaction returns to `Idle`, or stays in `Error` if any failed.
    pub fn execute<P: Pipeline>(&self, pipeline: P) -> TransactionResult<Execution> {
        let manager = self.manager()?;
        let token = CancellationToken::new();
        let handle = {
            let mut state = self.inner.state.lock();
            if !state.status.can_execute() {
                return Err(self.illegal("execute", state.status));
            }
            state.status = TransactionStatus::Running;
            let handle = state.next_execution;
            state.next_execution += 1;
            state.executions.insert(handle, token.clone());
            handle
        };

        let (sender, receiver) = unbounded_channel();
        let ctx = ExecutionContext {
            transaction: self.clone(),
            token: token.clone(),
        };
        let owner = self.clone();
        let job = move || {
            let mut pipeline = pipeline;
            let outcome = drive(&mut pipeline, &ctx, &sender);
            owner.complete_execution(handle, &outcome);
            let _ = sender.send(ExecutionMessage::Done(outcome));
        };

        if let Err(e) = manager.dispatcher.spawn_blocking(job) {
            let err = TransactionError::execution(e.to_string());
            self.complete_execution(handle, &Err(err.clone()));
            return Err(err);
        }
        Ok(Execution::new(self.clone(), token, receiver))
    }

    fn complete_execution(&self, handle: u64, outcome: &TransactionResult<usize>) {
        let mut state = self.inner.state.lock();
        state.executions.remove(&handle);
        match outcome {
            Ok(_) => {
                state.success += 1;
                if state.status == TransactionStatus::Running && state.executions.is_empty() {
                    state.status = TransactionStatus::Idle;
                }
            }
            Err(e) => {
                state.error += 1;
                if state.status != TransactionStatus::Finalizing {
                    state.status = TransactionStatus::Error;
                }
                debug!(tx = %self.inner.id, error = %e, "execution failed");
            }
        }
        if state.executions.is_empty() {
            self.inner.drained.notify_all();
        }
    }

    // ------------------------------------------------------------------
    // Sub-units, locks, storage and events
    // ------------------------------------------------------------------

    /// The sub-unit of `dbo` in this transaction, created on first use.
    ///
    /// Repeated calls for the same DBO return the same instance.
    pub fn get_or_create_sub_unit<D: Dbo>(&self, dbo: &Arc<D>) -> DatabaseResult<Arc<D::SubUnit>> {
        let name = dbo.name();
        {
            let status = self.state();
            if status == TransactionStatus::Finalizing || status.is_terminal() {
                return Err(DatabaseError::TransactionClosed(self.inner.id));
            }
        }
        if let Some(cached) = self.inner.sub_units.lock().get(&name) {
            return downcast::<D::SubUnit>(&name, cached);
        }

        // Created outside the cache lock: factories may create parent sub-units.
        let unit = Arc::new(Arc::clone(dbo).new_sub_unit(self)?);

        let mut units = self.inner.sub_units.lock();
        if let Some(cached) = units.get(&name) {
            return downcast::<D::SubUnit>(&name, cached);
        }
        units.insert(
            name,
            CachedSubUnit {
                unit: Arc::clone(&unit) as Arc<dyn SubUnit>,
                any: Arc::clone(&unit) as Arc<dyn Any + Send + Sync>,
            },
        );
        Ok(unit)
    }

    /// Names of the DBOs touched so far, in creation order
    pub fn touched(&self) -> Vec<Name> {
        self.inner.sub_units.lock().keys().cloned().collect()
    }

    /// Acquire a lock on `object` for the rest of this transaction.
    ///
    /// Read-only transactions read from their snapshot and take no grants;
    /// asking one for an exclusive grant is an error.
    pub fn request_lock(&self, object: &Name, mode: LockMode) -> DatabaseResult<()> {
        if self.inner.kind.read_only() {
            return match mode {
                LockMode::Shared => Ok(()),
                LockMode::Exclusive => Err(LockError::ReadOnly {
                    holder: self.inner.id,
                    object: object.clone(),
                }
                .into()),
            };
        }
        let manager = self
            .inner
            .manager
            .upgrade()
            .ok_or(DatabaseError::TransactionClosed(self.inner.id))?;
        manager
            .lock_table
            .request_timeout(self.inner.id, object, mode, manager.lock_timeout)?;
        Ok(())
    }

    /// Run `f` against the storage transaction
    pub fn with_storage<R>(
        &self,
        f: impl FnOnce(&mut StorageTx) -> DatabaseResult<R>,
    ) -> DatabaseResult<R> {
        let mut storage = self.inner.storage.lock();
        let tx = storage
            .as_mut()
            .ok_or(DatabaseError::TransactionClosed(self.inner.id))?;
        f(tx)
    }

    /// Stage an event for delivery at commit
    pub fn signal_event(&self, event: Event) {
        let mut log = self.inner.events.lock();
        if log.overflowed {
            return;
        }
        if log.events.len() >= self.inner.max_staged_events {
            warn!(
                tx = %self.inner.id,
                limit = self.inner.max_staged_events,
                "too many staged events, delivery will report a failure"
            );
            log.events.clear();
            log.overflowed = true;
            return;
        }
        log.events.push(event);
    }

    /// Number of events staged so far
    pub fn staged_events(&self) -> usize {
        self.inner.events.lock().events.len()
    }

    // ------------------------------------------------------------------
    // Commit, rollback, kill
    // ------------------------------------------------------------------

    /// Commit the transaction and deliver its events.
    ///
    /// A hook failure or a veto aborts everything; a storage conflict is
    /// reported as `InConflict`. The transaction is finalized on every path.
    #[instrument(level = "debug", skip(self), fields(tx = %self.inner.id))]
    pub fn commit(&self) -> TransactionResult<()> {
        let manager = self.manager()?;
        {
            let mut state = self.inner.state.lock();
            if !state.status.can_commit() {
                return Err(self.illegal("commit", state.status));
            }
            state.status = TransactionStatus::Finalizing;
        }

        match self.commit_inner(&manager) {
            Ok(()) => {
                manager.metrics.increment_committed();
                Ok(())
            }
            Err(e) => {
                let log = std::mem::take(&mut *self.inner.events.lock());
                self.abort_all();
                if log.overflowed || !log.events.is_empty() {
                    manager.notify_delivery_failure(self.inner.id, &log.events);
                }
                if matches!(e, TransactionError::InConflict(_)) {
                    manager.metrics.increment_conflicts();
                }
                manager.metrics.increment_rolled_back();
                debug!(tx = %self.inner.id, error = %e, "commit failed");
                Err(e)
            }
        }
    }

    fn commit_inner(&self, manager: &ManagerShared) -> TransactionResult<()> {
        let units = self.units_in_reverse();
        for unit in &units {
            if !unit.prepare_commit()? {
                return Err(TransactionError::CommitVetoed {
                    id: self.inner.id,
                    object: unit.dbo_name(),
                });
            }
        }
        for unit in &units {
            unit.commit()?;
        }
        drop(units);

        let delivery = {
            let _commits = manager.gate.commits.read();
            let delivery = manager.commit_storage(|| {
                self.with_storage(|storage| {
                    if storage.is_idempotent() {
                        storage.abort();
                        Ok(true)
                    } else {
                        Ok(storage.commit()?)
                    }
                })
            })?;
            delivery.ok_or(TransactionError::InConflict(self.inner.id))?
        };

        self.finalize(true);
        let log = std::mem::take(&mut *self.inner.events.lock());
        delivery.deliver(self.inner.id, log);
        Ok(())
    }

    /// Roll back the transaction.
    ///
    /// Abort hooks run in reverse creation order; a failing hook is logged
    /// and the remaining hooks still run.
    #[instrument(level = "debug", skip(self), fields(tx = %self.inner.id))]
    pub fn rollback(&self) -> TransactionResult<()> {
        {
            let mut state = self.inner.state.lock();
            if !state.status.can_rollback() {
                return Err(self.illegal("rollback", state.status));
            }
            state.status = TransactionStatus::Finalizing;
        }
        self.abort_all();
        if let Some(manager) = self.inner.manager.upgrade() {
            manager.metrics.increment_rolled_back();
        }
        Ok(())
    }

    /// Cancel running pipelines and roll back.
    ///
    /// Blocks until every running pipeline has observed its cancellation.
    /// Must not be called from inside one of this transaction's pipelines.
    #[instrument(level = "debug", skip(self), fields(tx = %self.inner.id))]
    pub fn kill(&self) -> TransactionResult<()> {
        {
            let mut state = self.inner.state.lock();
            match state.status {
                TransactionStatus::Running => {
                    for token in state.executions.values() {
                        token.cancel();
                    }
                    state.status = TransactionStatus::Finalizing;
                    while !state.executions.is_empty() {
                        self.inner.drained.wait(&mut state);
                    }
                }
                TransactionStatus::Idle | TransactionStatus::Error => {
                    state.status = TransactionStatus::Finalizing;
                }
                other => return Err(self.illegal("kill", other)),
            }
        }
        self.abort_all();
        if let Some(manager) = self.inner.manager.upgrade() {
            manager.metrics.increment_killed();
            manager.metrics.increment_rolled_back();
        }
        Ok(())
    }

    fn units_in_reverse(&self) -> Vec<Arc<dyn SubUnit>> {
        self.inner
            .sub_units
            .lock()
            .values()
            .rev()
            .map(|c| Arc::clone(&c.unit))
            .collect()
    }

    fn abort_all(&self) {
        for unit in self.units_in_reverse() {
            if let Err(e) = unit.abort() {
                warn!(tx = %self.inner.id, object = %unit.dbo_name(), error = %e, "abort hook failed");
            }
        }
        self.abort_storage();
        self.finalize(false);
        self.inner.events.lock().events.clear();
    }

    fn abort_storage(&self) {
        if let Some(storage) = self.inner.storage.lock().as_mut() {
            storage.abort();
        }
    }

    /// Reached exactly once, from commit, rollback or kill
    fn finalize(&self, committed: bool) {
        let units: Vec<Arc<dyn SubUnit>> = {
            let mut map = self.inner.sub_units.lock();
            map.drain(..).rev().map(|(_, c)| c.unit).collect()
        };
        for unit in &units {
            unit.finalize(committed);
        }
        drop(units);

        let manager = self.inner.manager.upgrade();
        let released = manager
            .as_ref()
            .map(|m| m.lock_table.release_all(self.inner.id))
            .unwrap_or(0);
        self.inner.storage.lock().take();

        {
            let mut state = self.inner.state.lock();
            state.ended = Some(Utc::now());
            state.locks_released = released;
            state.status = if committed {
                TransactionStatus::Commit
            } else {
                TransactionStatus::Rollback
            };
        }
        if let Some(manager) = manager {
            manager.live.write().remove(&self.inner.id);
        }
        debug!(tx = %self.inner.id, committed, released, "transaction finalized");
    }
}

fn downcast<T: SubUnit>(name: &Name, cached: &CachedSubUnit) -> DatabaseResult<Arc<T>> {
    Arc::clone(&cached.any)
        .downcast::<T>()
        .map_err(|_| DatabaseError::validation(format!("sub-unit of {} has an unexpected type", name)))
}
