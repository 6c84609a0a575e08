//! Statistics-change tracker
//!
//! Counts committed data changes per entity. Once an entity reaches the
//! change threshold, or its last recorded change is older than the change
//! interval, its column statistics are recomputed in one pass over a
//! read-only snapshot and its counter starts over.

use std::collections::HashMap;
use std::time::Instant;

use indexmap::IndexSet;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, instrument};

use crate::catalogue::EntityName;
use crate::config::StatisticsConfig;
use crate::execution::Task;
use crate::statistics::{collector_for, ColumnStatistic};
use crate::transaction::{Event, Transaction, TransactionId, TransactionObserver, TransactionResult, TransactionType};

use super::{in_transaction, ServiceContext, TaskOutcome};

#[derive(Debug, Clone, Copy)]
struct Changes {
    pending: u64,
    last_change: Instant,
}

pub struct StatisticsChangeTracker {
    ctx: ServiceContext,
    config: StatisticsConfig,
    changes: Mutex<HashMap<EntityName, Changes>>,
}

impl StatisticsChangeTracker {
    pub fn new(ctx: ServiceContext, config: StatisticsConfig) -> Self {
        Self {
            ctx,
            config,
            changes: Mutex::new(HashMap::new()),
        }
    }

    /// Changes counted for `entity` since its last recompute
    pub fn pending_changes(&self, entity: &EntityName) -> Option<u64> {
        self.changes.lock().get(entity).map(|c| c.pending)
    }

    /// Count one change; returns whether `entity` is due for a recompute
    fn record(&self, changes: &mut HashMap<EntityName, Changes>, entity: &EntityName, now: Instant) -> bool {
        let entry = changes.entry(entity.clone()).or_insert(Changes {
            pending: 0,
            last_change: now,
        });
        let due = entry.pending + 1 >= self.config.changes_threshold
            || now.duration_since(entry.last_change) > self.config.change_interval();
        if due {
            *entry = Changes {
                pending: 0,
                last_change: now,
            };
        } else {
            entry.pending += 1;
            entry.last_change = now;
        }
        due
    }
}

impl TransactionObserver for StatisticsChangeTracker {
    fn is_relevant(&self, event: &Event) -> bool {
        event.is_data_event()
    }

    fn on_commit(&self, tx: TransactionId, events: &[Event]) {
        let now = Instant::now();
        let mut due = IndexSet::new();
        {
            let mut changes = self.changes.lock();
            for event in events {
                if let Event::DataChanged { entity, .. } = event {
                    if self.record(&mut changes, entity, now) {
                        due.insert(entity.clone());
                    }
                }
            }
        }
        for entity in due {
            debug!(%tx, %entity, "statistics recompute scheduled");
            self.ctx.schedule(
                Box::new(RecomputeTask {
                    ctx: self.ctx.clone(),
                    entity,
                    retention: self.config.retention_probability,
                }),
                self.ctx.task_delay,
            );
        }
    }

    fn on_delivery_failure(&self, tx: TransactionId) {
        debug!(%tx, "no data change information for transaction");
    }
}

struct RecomputeTask {
    ctx: ServiceContext,
    entity: EntityName,
    /// Probability that a row is fed to the collectors
    retention: f64,
}

impl Task for RecomputeTask {
    fn name(&self) -> String {
        format!("statistics:{}", self.entity)
    }

    #[instrument(level = "debug", skip(self), fields(entity = %self.entity))]
    fn run(self: Box<Self>) {
        let name = self.name();
        let manager = self.ctx.catalogue.statistics().clone();
        let checkpoint = manager.stale_checkpoint();
        let outcome = in_transaction(&self.ctx, TransactionType::SystemReadonly, &name, |tx| {
            recompute(&self.ctx, tx, &self.entity, self.retention)
        });
        let TaskOutcome::Done(statistics) = outcome else {
            return;
        };

        let count = statistics.len();
        let mut outdated = 0;
        for statistic in statistics {
            if !manager.update_column_since(statistic, checkpoint) {
                outdated += 1;
            }
        }
        self.ctx.metrics.increment_statistics_recomputed();
        if outdated > 0 {
            debug!(entity = %self.entity, outdated, "entity changed during recompute, recompute rescheduled");
            let delay = self.ctx.task_delay;
            let ctx = self.ctx.clone();
            ctx.schedule(self, delay);
        } else {
            debug!(entity = %self.entity, columns = count, "entity statistics recomputed");
        }
    }
}

/// Statistics of every column of `entity`, from one pass over its rows
fn recompute(
    ctx: &ServiceContext,
    tx: &Transaction,
    entity: &EntityName,
    retention: f64,
) -> TransactionResult<Vec<ColumnStatistic>> {
    let entity = ctx.catalogue.resolve_entity(tx, entity)?;
    let entity_su = tx.get_or_create_sub_unit(&entity)?;
    let columns = entity.columns();
    let mut collectors: Vec<_> = columns.iter().map(|c| collector_for(c.value_type())).collect();

    let mut rng = rand::thread_rng();
    for row in entity_su.cursor()? {
        if retention < 1.0 && !rng.gen_bool(retention) {
            continue;
        }
        for (column, collector) in columns.iter().zip(collectors.iter_mut()) {
            collector.receive(row.get(column.position()));
        }
    }

    Ok(columns
        .iter()
        .zip(collectors)
        .filter(|(column, _)| !column.is_retired())
        .map(|(column, collector)| {
            ColumnStatistic::analysed(column.column_name().clone(), column.value_type(), collector.finalize())
        })
        .collect())
}
