//! Transaction manager
//!
//! Issues transaction ids, tracks live transactions and a bounded history,
//! owns the lock table and the observer registry, and delivers event logs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

use crate::catalogue::DatabaseResult;
use crate::config::ExecutionConfig;
use crate::execution::WorkerPool;
use crate::observability::MetricsRegistry;
use crate::storage::Environment;

use super::errors::TransactionResult;
use super::events::{Event, TransactionObserver};
use super::lock::LockTable;
use super::tx::{EventLog, Transaction, TransactionMetadata};
use super::types::{TransactionId, TransactionType};

#[derive(Debug, Default)]
struct Deliveries {
    in_flight: usize,
    issued: u64,
    delivered: u64,
}

/// Orders storage commits against deliveries and `compute_exclusively`.
///
/// Commits hold `commits` for reading across their storage commit. Each
/// successful storage commit draws a ticket in commit order; deliveries run
/// strictly in ticket order.
#[derive(Debug, Default)]
pub(crate) struct CommitGate {
    pub(crate) commits: RwLock<()>,
    deliveries: Mutex<Deliveries>,
    turn: Condvar,
}

impl CommitGate {
    fn wait_turn(&self, deliveries: &mut MutexGuard<'_, Deliveries>, ticket: u64) {
        while deliveries.delivered != ticket {
            self.turn.wait(deliveries);
        }
    }
}

/// Observers of one commit, held until its delivery is done
pub(crate) struct Delivery<'a> {
    gate: &'a CommitGate,
    metrics: &'a MetricsRegistry,
    ticket: u64,
    observers: Vec<Arc<dyn TransactionObserver>>,
}

impl Delivery<'_> {
    /// Hand the event log to every interested observer.
    ///
    /// An empty log reaches every observer; an overflowed log becomes a
    /// delivery failure for every observer.
    pub(crate) fn deliver(self, tx: TransactionId, log: EventLog) {
        {
            let mut deliveries = self.gate.deliveries.lock();
            self.gate.wait_turn(&mut deliveries, self.ticket);
        }
        if log.overflowed {
            for observer in &self.observers {
                observer.on_delivery_failure(tx);
                self.metrics.increment_delivery_failures();
            }
            return;
        }
        for observer in &self.observers {
            if log.events.is_empty() || log.events.iter().any(|e| observer.is_relevant(e)) {
                observer.on_commit(tx, &log.events);
                self.metrics.increment_deliveries();
            }
        }
    }
}

impl Drop for Delivery<'_> {
    fn drop(&mut self) {
        let mut deliveries = self.gate.deliveries.lock();
        self.gate.wait_turn(&mut deliveries, self.ticket);
        deliveries.delivered += 1;
        deliveries.in_flight = deliveries.in_flight.saturating_sub(1);
        self.gate.turn.notify_all();
    }
}

/// State shared between the manager and its transactions
pub(crate) struct ManagerShared {
    pub(crate) environment: Arc<Environment>,
    pub(crate) dispatcher: Arc<WorkerPool>,
    pub(crate) metrics: Arc<MetricsRegistry>,
    pub(crate) lock_table: LockTable,
    pub(crate) lock_timeout: Option<Duration>,
    pub(crate) gate: CommitGate,
    next_id: AtomicU64,
    pub(crate) live: RwLock<HashMap<TransactionId, Transaction>>,
    history: Mutex<VecDeque<Transaction>>,
    history_size: usize,
    observers: RwLock<Vec<Arc<dyn TransactionObserver>>>,
    max_staged_events: usize,
}

impl ManagerShared {
    /// Run a storage commit and, if it succeeds, draw its delivery ticket.
    ///
    /// Call while holding `gate.commits` for reading. `Ok(None)` means the
    /// storage layer reported a conflict.
    pub(crate) fn commit_storage(
        &self,
        commit: impl FnOnce() -> DatabaseResult<bool>,
    ) -> TransactionResult<Option<Delivery<'_>>> {
        let mut deliveries = self.gate.deliveries.lock();
        if !commit()? {
            return Ok(None);
        }
        let ticket = deliveries.issued;
        deliveries.issued += 1;
        deliveries.in_flight += 1;
        drop(deliveries);

        Ok(Some(Delivery {
            gate: &self.gate,
            metrics: &self.metrics,
            ticket,
            observers: self.observers.read().clone(),
        }))
    }

    /// Tell observers interested in `events` that a commit carrying them failed
    pub(crate) fn notify_delivery_failure(&self, tx: TransactionId, events: &[Event]) {
        let observers = self.observers.read().clone();
        for observer in observers {
            if events.is_empty() || events.iter().any(|e| observer.is_relevant(e)) {
                observer.on_delivery_failure(tx);
                self.metrics.increment_delivery_failures();
            }
        }
    }
}

/// Entry point for transactions
#[derive(Clone)]
pub struct TransactionManager {
    shared: Arc<ManagerShared>,
}

impl TransactionManager {
    pub fn new(
        environment: Arc<Environment>,
        dispatcher: Arc<WorkerPool>,
        metrics: Arc<MetricsRegistry>,
        config: &ExecutionConfig,
    ) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                environment,
                dispatcher,
                metrics,
                lock_table: LockTable::new(),
                lock_timeout: config.lock_timeout(),
                gate: CommitGate::default(),
                next_id: AtomicU64::new(1),
                live: RwLock::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                history_size: config.transaction_history_size,
                observers: RwLock::new(Vec::new()),
                max_staged_events: config.max_staged_events,
            }),
        }
    }

    /// Begin a transaction of the given kind
    pub fn begin(&self, kind: TransactionType) -> TransactionResult<Transaction> {
        let storage = self.shared.environment.begin(kind.read_only())?;
        let id = TransactionId::new(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let tx = Transaction::new(
            id,
            kind,
            storage,
            Arc::downgrade(&self.shared),
            self.shared.max_staged_events,
        );

        self.shared.live.write().insert(id, tx.clone());
        {
            let mut history = self.shared.history.lock();
            if history.len() >= self.shared.history_size {
                history.pop_front();
            }
            history.push_back(tx.clone());
        }
        self.shared.metrics.increment_begun();
        debug!(tx = %id, %kind, "transaction begun");
        Ok(tx)
    }

    /// A live transaction by id
    pub fn lookup(&self, id: TransactionId) -> Option<Transaction> {
        self.shared.live.read().get(&id).cloned()
    }

    /// All live transactions, ordered by id
    pub fn live(&self) -> Vec<Transaction> {
        let mut live: Vec<_> = self.shared.live.read().values().cloned().collect();
        live.sort_by_key(|tx| tx.id());
        live
    }

    /// The most recent transactions, oldest first
    pub fn history(&self) -> Vec<TransactionMetadata> {
        self.shared
            .history
            .lock()
            .iter()
            .map(Transaction::metadata)
            .collect()
    }

    pub fn lock_table(&self) -> &LockTable {
        &self.shared.lock_table
    }

    pub fn register_observer(&self, observer: Arc<dyn TransactionObserver>) {
        self.shared.observers.write().push(observer);
    }

    /// Remove a previously registered observer; returns whether it was found
    pub fn deregister_observer(&self, observer: &Arc<dyn TransactionObserver>) -> bool {
        let mut observers = self.shared.observers.write();
        let before = observers.len();
        observers.retain(|o| !Arc::ptr_eq(o, observer));
        before != observers.len()
    }

    pub fn observer_count(&self) -> usize {
        self.shared.observers.read().len()
    }

    /// Run `f` while no commit sits between its storage commit and the end
    /// of its delivery.
    ///
    /// Every commit is then either fully delivered before `f` runs, or
    /// reaches the storage layer after `f` returns. `f` must not commit.
    pub fn compute_exclusively<R>(&self, f: impl FnOnce() -> R) -> R {
        let _commits = self.shared.gate.commits.write();
        {
            let mut deliveries = self.shared.gate.deliveries.lock();
            while deliveries.in_flight > 0 {
                self.shared.gate.turn.wait(&mut deliveries);
            }
        }
        f()
    }

    /// Kill every live transaction
    pub fn shutdown(&self) {
        let live = self.live();
        let count = live.len();
        for tx in live {
            if let Err(e) = tx.kill() {
                debug!(tx = %tx.id(), error = %e, "transaction not killed at shutdown");
            }
        }
        if count > 0 {
            info!(count, "live transactions killed at shutdown");
        }
    }
}
