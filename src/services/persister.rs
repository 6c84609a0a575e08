//! Statistics persister
//!
//! Once per period, writes the statistics buffer to storage if it changed
//! since the last successful persist.

use tracing::{debug, error, info};

use crate::catalogue::DatabaseError;
use crate::execution::PeriodicTask;
use crate::fail_point::points;
use crate::transaction::TransactionType;

use super::{in_transaction, ServiceContext, TaskOutcome};

/// Result of one persist attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Nothing changed since the last persist
    Unchanged,
    /// The buffer up to this version reached storage
    Persisted(u64),
    Failed,
}

pub struct StatisticsPersister {
    ctx: ServiceContext,
}

impl StatisticsPersister {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    /// Persist the statistics now if they changed
    pub fn persist(&self) -> PersistOutcome {
        let statistics = self.ctx.catalogue.statistics();
        if !statistics.is_dirty() {
            debug!(version = statistics.version(), "statistics unchanged, nothing persisted");
            return PersistOutcome::Unchanged;
        }

        let outcome = in_transaction(&self.ctx, TransactionType::SystemExclusive, &self.name(), |tx| {
            self.ctx
                .catalogue
                .context()
                .fail_points
                .check(points::STATISTICS_PERSIST)
                .map_err(DatabaseError::from)?;
            Ok(tx.with_storage(|s| statistics.persist(s))?)
        });
        match outcome {
            TaskOutcome::Done(version) => {
                let clean = statistics.mark_persisted(version);
                self.ctx.metrics.increment_statistics_persisted();
                info!(version, clean, "statistics persisted");
                PersistOutcome::Persisted(version)
            }
            TaskOutcome::Missing | TaskOutcome::Failed => {
                error!("statistics could not be persisted");
                PersistOutcome::Failed
            }
        }
    }
}

impl PeriodicTask for StatisticsPersister {
    fn name(&self) -> String {
        "statistics-persister".to_string()
    }

    fn run(&self) {
        self.persist();
    }
}
