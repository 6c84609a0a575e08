//! Background maintenance services
//!
//! Three services observe committed event logs and one runs periodically:
//!
//! - `AutoAnalyzer`: recomputes statistics of columns that became stale
//! - `AutoRebuilder`: rebuilds indexes that were created or turned stale
//! - `StatisticsChangeTracker`: recomputes entity statistics after enough
//!   data changes or enough time
//! - `StatisticsPersister`: writes changed statistics once per period
//!
//! Observers only do bookkeeping while a commit is delivered. The work runs
//! later as a `Task` on the service scheduler, each in its own short
//! transaction. An object dropped in the meantime is logged and skipped,
//! never retried.

mod analyzer;
mod persister;
mod rebuilder;
mod tracker;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::catalogue::Catalogue;
use crate::config::Config;
use crate::execution::{PeriodicTask, Scheduler, Task};
use crate::observability::MetricsRegistry;
use crate::transaction::{Transaction, TransactionManager, TransactionObserver, TransactionResult, TransactionType};

pub use analyzer::AutoAnalyzer;
pub use persister::{PersistOutcome, StatisticsPersister};
pub use rebuilder::AutoRebuilder;
pub use tracker::StatisticsChangeTracker;

/// Everything a service needs to run its tasks
#[derive(Clone)]
pub struct ServiceContext {
    pub manager: TransactionManager,
    pub catalogue: Arc<Catalogue>,
    pub scheduler: Arc<dyn Scheduler>,
    pub metrics: Arc<MetricsRegistry>,
    /// Delay before a freshly scheduled task runs
    pub task_delay: Duration,
}

impl ServiceContext {
    pub(crate) fn schedule(&self, task: Box<dyn Task>, delay: Duration) {
        self.metrics.increment_tasks_scheduled();
        self.scheduler.schedule(task, delay);
    }
}

/// How a task's transaction ended
#[derive(Debug)]
pub(crate) enum TaskOutcome<R> {
    Done(R),
    /// The object went away; the transaction was rolled back
    Missing,
    Failed,
}

/// Run `work` in a new transaction of `kind`, committing on success.
///
/// Failures are logged here and rolled back; callers only branch on the
/// outcome.
pub(crate) fn in_transaction<R>(
    ctx: &ServiceContext,
    kind: TransactionType,
    task: &str,
    work: impl FnOnce(&Transaction) -> TransactionResult<R>,
) -> TaskOutcome<R> {
    let tx = match ctx.manager.begin(kind) {
        Ok(tx) => tx,
        Err(e) => {
            error!(task, error = %e, code = e.code(), "task transaction could not begin");
            ctx.metrics.increment_tasks_failed();
            return TaskOutcome::Failed;
        }
    };

    match work(&tx) {
        Ok(value) => match tx.commit() {
            Ok(()) => TaskOutcome::Done(value),
            Err(e) => {
                error!(task, tx = %tx.id(), error = %e, code = e.code(), "task commit failed");
                ctx.metrics.increment_tasks_failed();
                TaskOutcome::Failed
            }
        },
        Err(e) if e.is_missing_object() => {
            info!(task, tx = %tx.id(), error = %e, "object no longer exists, task skipped");
            rollback(&tx, task);
            TaskOutcome::Missing
        }
        Err(e) => {
            error!(task, tx = %tx.id(), error = %e, code = e.code(), "task failed");
            rollback(&tx, task);
            ctx.metrics.increment_tasks_failed();
            TaskOutcome::Failed
        }
    }
}

fn rollback(tx: &Transaction, task: &str) {
    if let Err(e) = tx.rollback() {
        warn!(task, tx = %tx.id(), error = %e, "task rollback failed");
    }
}

/// The running services of one database
#[derive(Default)]
pub struct Services {
    pub analyzer: Option<Arc<AutoAnalyzer>>,
    pub rebuilder: Option<Arc<AutoRebuilder>>,
    pub tracker: Option<Arc<StatisticsChangeTracker>>,
    pub persister: Option<Arc<StatisticsPersister>>,
    registered: Vec<Arc<dyn TransactionObserver>>,
}

impl Services {
    /// Start the services enabled in `config`
    pub fn start(ctx: &ServiceContext, config: &Config) -> Self {
        let mut services = Services::default();
        let enabled = &config.services;

        if enabled.auto_analyzer {
            let analyzer = Arc::new(AutoAnalyzer::new(ctx.clone()));
            services.register(ctx, Arc::clone(&analyzer) as Arc<dyn TransactionObserver>);
            services.analyzer = Some(analyzer);
        }
        if enabled.auto_rebuilder {
            let rebuilder = AutoRebuilder::new(ctx.clone(), config.rebuilder.clone());
            services.register(ctx, Arc::clone(&rebuilder) as Arc<dyn TransactionObserver>);
            services.rebuilder = Some(rebuilder);
        }
        if enabled.statistics_tracker {
            let tracker = Arc::new(StatisticsChangeTracker::new(ctx.clone(), config.statistics.clone()));
            services.register(ctx, Arc::clone(&tracker) as Arc<dyn TransactionObserver>);
            services.tracker = Some(tracker);
        }
        if enabled.statistics_persister {
            let persister = Arc::new(StatisticsPersister::new(ctx.clone()));
            ctx.scheduler.schedule_periodic(
                Arc::clone(&persister) as Arc<dyn PeriodicTask>,
                config.statistics.persist_interval(),
            );
            services.persister = Some(persister);
        }

        info!(observers = services.registered.len(), persister = services.persister.is_some(), "services started");
        services
    }

    fn register(&mut self, ctx: &ServiceContext, observer: Arc<dyn TransactionObserver>) {
        ctx.manager.register_observer(Arc::clone(&observer));
        self.registered.push(observer);
    }

    /// Deregister every observer
    pub fn stop(&mut self, manager: &TransactionManager) {
        for observer in self.registered.drain(..) {
            manager.deregister_observer(&observer);
        }
    }
}
