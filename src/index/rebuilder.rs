//! Index rebuilders
//!
//! `IndexRebuilder` rebuilds inside the caller's transaction.
//!
//! `AsyncIndexRebuilder` works in two phases:
//!
//! 1. `build()` registers a side channel for data changes of the entity and
//!    opens a read-only snapshot in one step, then assembles a complete
//!    structure from that snapshot. Writers are never blocked.
//! 2. `replace()` takes the index exclusively, stops the side channel, merges
//!    the changes it captured into the structure and swaps the index store
//!    contents in a single commit.
//!
//! Readers see either the old or the new structure, never a mix.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::catalogue::{scan_rows, DatabaseError, DatabaseResult};
use crate::fail_point::points;
use crate::transaction::{
    Dbo, Event, LockMode, Transaction, TransactionId, TransactionManager, TransactionObserver, TransactionResult,
    TransactionType,
};

use super::dbo::Index;
use super::structure::{self, Applied, BuiltIndex, RowChange};
use super::{AsyncRebuildState, IndexState};

/// Rebuilds an index in one transaction
pub struct IndexRebuilder {
    index: Arc<Index>,
}

impl IndexRebuilder {
    pub(crate) fn new(index: Arc<Index>) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    /// Truncate and rebuild the index inside `tx`, leaving it `Clean`
    pub fn rebuild(&self, tx: &Transaction) -> DatabaseResult<()> {
        self.index.fail_points().check(points::INDEX_SYNC_REBUILD)?;
        tx.get_or_create_sub_unit(&self.index)?.rebuild()?;
        debug!(tx = %tx.id(), index = %self.index.index_name(), "index rebuilt");
        Ok(())
    }
}

struct ChannelState {
    state: AsyncRebuildState,
    pending: Vec<RowChange>,
}

/// Captures committed changes of the indexed entity between build and replace
struct SideChannel {
    index: Arc<Index>,
    inner: Mutex<ChannelState>,
}

impl SideChannel {
    fn state(&self) -> AsyncRebuildState {
        self.inner.lock().state
    }

    /// Move from `from` to `to`; fails if the rebuild is elsewhere
    fn advance(&self, from: AsyncRebuildState, to: AsyncRebuildState) -> DatabaseResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != from {
            return Err(DatabaseError::RebuildState {
                index: self.index.index_name().clone(),
                expected: from,
                actual: inner.state,
            });
        }
        inner.state = to;
        Ok(())
    }

    fn fail(&self) {
        let mut inner = self.inner.lock();
        if !inner.state.is_terminal() {
            inner.state = AsyncRebuildState::Failed;
        }
        inner.pending.clear();
    }

    fn drain(&self) -> Vec<RowChange> {
        std::mem::take(&mut self.inner.lock().pending)
    }
}

impl TransactionObserver for SideChannel {
    fn is_relevant(&self, event: &Event) -> bool {
        match event {
            Event::DataChanged { entity, .. } => *entity == self.index.entity_name(),
            _ => false,
        }
    }

    fn on_commit(&self, _tx: TransactionId, events: &[Event]) {
        let entity = self.index.entity_name();
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        for event in events {
            if let Event::DataChanged {
                entity: changed,
                kind,
                payload,
            } = event
            {
                if *changed == entity {
                    inner.pending.push(RowChange::from_payload(*kind, payload));
                }
            }
        }
    }

    fn on_delivery_failure(&self, tx: TransactionId) {
        warn!(%tx, index = %self.index.index_name(), "changes lost, asynchronous rebuild failed");
        self.fail();
    }
}

/// Two-phase rebuild of one index
pub struct AsyncIndexRebuilder {
    index: Arc<Index>,
    manager: TransactionManager,
    channel: Arc<SideChannel>,
    /// The channel as registered with the manager, until released
    registration: Mutex<Option<Arc<dyn TransactionObserver>>>,
    built: Mutex<Option<BuiltIndex>>,
}

impl AsyncIndexRebuilder {
    pub(crate) fn new(index: Arc<Index>, manager: TransactionManager) -> Self {
        let channel = Arc::new(SideChannel {
            index: Arc::clone(&index),
            inner: Mutex::new(ChannelState {
                state: AsyncRebuildState::Initialized,
                pending: Vec::new(),
            }),
        });
        Self {
            index,
            manager,
            channel,
            registration: Mutex::new(None),
            built: Mutex::new(None),
        }
    }

    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    pub fn state(&self) -> AsyncRebuildState {
        self.channel.state()
    }

    /// Changes captured since the build snapshot
    pub fn pending_changes(&self) -> usize {
        self.channel.inner.lock().pending.len()
    }

    /// Assemble a new structure from a fresh snapshot
    pub fn build(&self) -> TransactionResult<()> {
        self.build_with(false).map(|_| ())
    }

    /// Like `build`, but an index found `Clean` in the build snapshot is
    /// left alone: the rebuilder is closed and stays `Initialized`.
    /// Returns whether a structure was built.
    pub fn build_unless_clean(&self) -> TransactionResult<bool> {
        self.build_with(true)
    }

    fn build_with(&self, skip_clean: bool) -> TransactionResult<bool> {
        match self.build_inner(skip_clean) {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.close();
                Ok(false)
            }
            Err(e) => {
                self.channel.fail();
                self.close();
                Err(e)
            }
        }
    }

    fn build_inner(&self, skip_clean: bool) -> TransactionResult<bool> {
        let state = self.state();
        if state != AsyncRebuildState::Initialized {
            return Err(DatabaseError::RebuildState {
                index: self.index.index_name().clone(),
                expected: AsyncRebuildState::Initialized,
                actual: state,
            }
            .into());
        }
        self.index
            .fail_points()
            .check(points::INDEX_ASYNC_BUILD)
            .map_err(DatabaseError::from)?;

        let observer: Arc<dyn TransactionObserver> = Arc::clone(&self.channel) as Arc<dyn TransactionObserver>;
        let tx = self.manager.compute_exclusively(|| {
            self.manager.register_observer(Arc::clone(&observer));
            self.manager.begin(TransactionType::SystemReadonly)
        });
        *self.registration.lock() = Some(observer);
        let tx = tx?;

        let built = self.scan(&tx, skip_clean);
        if let Err(e) = tx.rollback() {
            debug!(tx = %tx.id(), error = %e, "build snapshot not released cleanly");
        }
        let Some(built) = built? else {
            debug!(index = %self.index.index_name(), "index already clean, nothing built");
            return Ok(false);
        };
        debug!(index = %self.index.index_name(), entries = built.len(), "replacement structure built");
        *self.built.lock() = Some(built);
        self.channel
            .advance(AsyncRebuildState::Initialized, AsyncRebuildState::Built)?;
        Ok(true)
    }

    /// Entries of every row in the snapshot of `tx`; `None` if `skip_clean`
    /// and the index is `Clean` there
    fn scan(&self, tx: &Transaction, skip_clean: bool) -> DatabaseResult<Option<BuiltIndex>> {
        let su = tx.get_or_create_sub_unit(&self.index)?;
        if skip_clean && su.state()? == IndexState::Clean {
            return Ok(None);
        }
        let entity = self.index.entity_name();
        let rows = tx.with_storage(|s| scan_rows(s, &entity))?;
        structure::build(self.index.descriptor(), &rows).map(Some)
    }

    /// Swap the built structure in
    pub fn replace(&self) -> TransactionResult<()> {
        match self.replace_inner() {
            Ok(()) => {
                self.channel
                    .advance(AsyncRebuildState::Merging, AsyncRebuildState::Finished)?;
                info!(index = %self.index.index_name(), "index rebuilt asynchronously");
                Ok(())
            }
            Err(e) => {
                self.channel.fail();
                self.close();
                Err(e)
            }
        }
    }

    fn replace_inner(&self) -> TransactionResult<()> {
        let state = self.state();
        if state != AsyncRebuildState::Built {
            return Err(DatabaseError::RebuildState {
                index: self.index.index_name().clone(),
                expected: AsyncRebuildState::Built,
                actual: state,
            }
            .into());
        }
        self.index
            .fail_points()
            .check(points::INDEX_ASYNC_REPLACE)
            .map_err(DatabaseError::from)?;

        let tx = self.manager.begin(TransactionType::SystemExclusive)?;
        match self.swap(&tx) {
            Ok(()) => tx.commit(),
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    warn!(tx = %tx.id(), error = %rollback, "rollback after failed swap");
                }
                Err(e.into())
            }
        }
    }

    fn swap(&self, tx: &Transaction) -> DatabaseResult<()> {
        let su = tx.get_or_create_sub_unit(&self.index)?;
        tx.request_lock(&self.index.name(), LockMode::Exclusive)?;
        self.close();
        self.channel
            .advance(AsyncRebuildState::Built, AsyncRebuildState::Merging)?;

        su.update_state(IndexState::Dirty)?;
        let mut built = self.built.lock().take().unwrap_or_default();
        let pending = self.channel.drain();
        for change in &pending {
            if structure::apply(self.index.descriptor(), &mut built, change)? == Applied::Unsupported {
                return Err(DatabaseError::validation(format!(
                    "change to tuple {} does not fit the structure built for {}",
                    change.tuple_id,
                    self.index.index_name()
                )));
            }
        }
        su.write_built(&built)?;
        su.update_state(IndexState::Clean)?;
        debug!(tx = %tx.id(), index = %self.index.index_name(), merged = pending.len(), "index swapped");
        Ok(())
    }

    /// Stop capturing changes; returns whether this call released the channel
    pub fn close(&self) -> bool {
        let Some(observer) = self.registration.lock().take() else {
            return false;
        };
        self.manager
            .compute_exclusively(|| self.manager.deregister_observer(&observer))
    }
}

impl Drop for AsyncIndexRebuilder {
    fn drop(&mut self) {
        self.close();
    }
}
