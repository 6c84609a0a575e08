//! Auto-analyzer
//!
//! Schedules one analysis per column that became stale in a committed
//! transaction. The analysis re-checks freshness under the column's
//! exclusive lock, so columns analysed in the meantime are skipped.

use indexmap::IndexSet;
use tracing::{debug, instrument};

use crate::catalogue::{ColumnName, DatabaseError};
use crate::execution::Task;
use crate::fail_point::points;
use crate::statistics::{collector_for, ColumnStatistic};
use crate::transaction::{
    Dbo, Event, LockMode, Transaction, TransactionId, TransactionObserver, TransactionResult, TransactionType,
};

use super::{in_transaction, ServiceContext, TaskOutcome};

pub struct AutoAnalyzer {
    ctx: ServiceContext,
}

impl AutoAnalyzer {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }
}

impl TransactionObserver for AutoAnalyzer {
    fn is_relevant(&self, event: &Event) -> bool {
        matches!(event, Event::ColumnStale { .. })
    }

    fn on_commit(&self, tx: TransactionId, events: &[Event]) {
        let stale: IndexSet<&ColumnName> = events
            .iter()
            .filter_map(|event| match event {
                Event::ColumnStale { column } => Some(column),
                _ => None,
            })
            .collect();
        for column in stale {
            debug!(%tx, %column, "column analysis scheduled");
            self.ctx.schedule(
                Box::new(AnalyzeTask {
                    ctx: self.ctx.clone(),
                    column: column.clone(),
                }),
                self.ctx.task_delay,
            );
        }
    }

    fn on_delivery_failure(&self, tx: TransactionId) {
        debug!(%tx, "no column staleness information for transaction");
    }
}

struct AnalyzeTask {
    ctx: ServiceContext,
    column: ColumnName,
}

impl Task for AnalyzeTask {
    fn name(&self) -> String {
        format!("analyze:{}", self.column)
    }

    #[instrument(level = "debug", skip(self), fields(column = %self.column))]
    fn run(self: Box<Self>) {
        let name = self.name();
        let statistics = self.ctx.catalogue.statistics().clone();
        let checkpoint = statistics.stale_checkpoint();
        let outcome = in_transaction(&self.ctx, TransactionType::SystemExclusive, &name, |tx| {
            analyze(&self.ctx, tx, &self.column, checkpoint)
        });
        match outcome {
            TaskOutcome::Done(true) => {
                self.ctx.metrics.increment_analyses();
                if statistics.column(&self.column).is_some_and(|s| !s.fresh) {
                    debug!(column = %self.column, "column changed during analysis, analysis rescheduled");
                    let delay = self.ctx.task_delay;
                    let ctx = self.ctx.clone();
                    ctx.schedule(self, delay);
                } else {
                    debug!(column = %self.column, "column analysed");
                }
            }
            TaskOutcome::Done(false) => debug!(column = %self.column, "column already fresh"),
            TaskOutcome::Missing | TaskOutcome::Failed => {}
        }
    }
}

/// Recompute the statistics of `column` unless they are fresh; returns
/// whether they were recomputed.
///
/// `tx` must have been opened after the stale-mark `checkpoint` was read.
fn analyze(ctx: &ServiceContext, tx: &Transaction, name: &ColumnName, checkpoint: u64) -> TransactionResult<bool> {
    let catalogue = &ctx.catalogue;
    let entity = catalogue.resolve_entity(tx, &name.entity())?;
    let column = catalogue.resolve_column(tx, name)?;
    tx.request_lock(&entity.name(), LockMode::Shared)?;
    tx.request_lock(&column.name(), LockMode::Exclusive)?;

    let column_su = tx.get_or_create_sub_unit(&column)?;
    if column_su.statistics()?.fresh {
        return Ok(false);
    }
    catalogue
        .context()
        .fail_points
        .check(points::COLUMN_ANALYZE)
        .map_err(DatabaseError::from)?;

    let position = column.position();
    let mut collector = collector_for(column.value_type());
    for row in tx.get_or_create_sub_unit(&entity)?.cursor()? {
        collector.receive(row.get(position));
    }
    let statistic = ColumnStatistic::analysed(name.clone(), column.value_type(), collector.finalize());
    column_su.update_statistics_since(statistic, checkpoint)?;
    Ok(true)
}
