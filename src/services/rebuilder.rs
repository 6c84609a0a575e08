//! Auto-rebuilder
//!
//! Collects the indexes that need a rebuild from each committed event log:
//! created indexes and indexes that turned stale are added, dropped indexes
//! and indexes that became usable again are removed. Every surviving index
//! gets one task holding only its arena handle.
//!
//! A failed rebuild is retried with a growing delay until the retry budget
//! is spent; the index is then abandoned and its counter reset.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::catalogue::{IndexName, Name};
use crate::config::RebuilderConfig;
use crate::execution::Task;
use crate::index::{AsyncRebuildState, Index, IndexHandle, IndexState};
use crate::transaction::{
    Event, LockMode, TransactionError, TransactionId, TransactionObserver, TransactionType,
};

use super::{in_transaction, ServiceContext, TaskOutcome};

pub struct AutoRebuilder {
    me: Weak<AutoRebuilder>,
    ctx: ServiceContext,
    config: RebuilderConfig,
    /// Failed attempts per index; absent means none
    retries: Mutex<HashMap<IndexName, u32>>,
}

impl AutoRebuilder {
    pub fn new(ctx: ServiceContext, config: RebuilderConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            ctx,
            config,
            retries: Mutex::new(HashMap::new()),
        })
    }

    /// Failed attempts recorded for `index`
    pub fn retry_count(&self, index: &IndexName) -> u32 {
        self.retries.lock().get(index).copied().unwrap_or(0)
    }

    fn schedule(&self, index: IndexName, handle: IndexHandle, delay: Duration) {
        let Some(service) = self.me.upgrade() else {
            return;
        };
        self.ctx.schedule(
            Box::new(RebuildTask {
                service,
                index,
                handle,
            }),
            delay,
        );
    }

    fn succeeded(&self, index: &IndexName) {
        self.retries.lock().remove(index);
    }

    /// Count a failure; returns the attempt number to retry with, if any
    fn failed(&self, index: &IndexName) -> Option<u32> {
        self.ctx.metrics.increment_rebuild_failures();
        let mut retries = self.retries.lock();
        let attempts = retries.entry(index.clone()).or_insert(0);
        *attempts += 1;
        if *attempts <= self.config.max_retries {
            Some(*attempts)
        } else {
            retries.remove(index);
            None
        }
    }
}

/// Indexes needing a rebuild after `events`, in order of first mention
fn working_set(events: &[Event]) -> IndexMap<IndexName, IndexHandle> {
    let mut set = IndexMap::new();
    for event in events {
        match event {
            Event::IndexCreated { index, handle, .. } => {
                set.insert(index.clone(), *handle);
            }
            Event::IndexStateChanged {
                index,
                handle,
                new_state,
                ..
            } => {
                if *new_state == IndexState::Stale {
                    set.insert(index.clone(), *handle);
                } else {
                    set.shift_remove(index);
                }
            }
            Event::IndexDropped { index, .. } => {
                set.shift_remove(index);
            }
            _ => {}
        }
    }
    set
}

impl TransactionObserver for AutoRebuilder {
    fn is_relevant(&self, event: &Event) -> bool {
        event.is_index_event()
    }

    fn on_commit(&self, tx: TransactionId, events: &[Event]) {
        for (index, handle) in working_set(events) {
            debug!(%tx, %index, %handle, "index rebuild scheduled");
            self.schedule(index, handle, self.ctx.task_delay);
        }
    }

    fn on_delivery_failure(&self, tx: TransactionId) {
        debug!(%tx, "no index information for transaction");
    }
}

struct RebuildTask {
    service: Arc<AutoRebuilder>,
    index: IndexName,
    handle: IndexHandle,
}

impl RebuildTask {
    /// Rebuild in a single transaction; `Ok(false)` if nothing was stale
    fn rebuild_sync(&self, index: &Arc<Index>) -> TaskOutcome<bool> {
        let name = self.name();
        in_transaction(&self.service.ctx, TransactionType::SystemExclusive, &name, |tx| {
            tx.request_lock(&Name::Entity(index.entity_name()), LockMode::Shared)?;
            let su = tx.get_or_create_sub_unit(index)?;
            if su.state()? == IndexState::Clean {
                return Ok(false);
            }
            index.new_rebuilder().rebuild(tx)?;
            Ok(true)
        })
    }

    fn rebuild_async(&self, index: &Arc<Index>) -> TaskOutcome<bool> {
        let ctx = &self.service.ctx;
        let result = index
            .new_async_rebuilder(&ctx.manager)
            .map_err(TransactionError::from)
            .and_then(|rebuilder| {
                if !rebuilder.build_unless_clean()? {
                    return Ok(false);
                }
                if rebuilder.state() != AsyncRebuildState::Built {
                    return Err(TransactionError::execution(format!(
                        "build of {} ended in state {:?}",
                        self.index,
                        rebuilder.state()
                    )));
                }
                rebuilder.replace()?;
                rebuilder.close();
                Ok(true)
            });
        match result {
            Ok(rebuilt) => TaskOutcome::Done(rebuilt),
            Err(e) if e.is_missing_object() => {
                info!(index = %self.index, error = %e, "index no longer exists, rebuild skipped");
                TaskOutcome::Missing
            }
            Err(e) => {
                error!(index = %self.index, error = %e, code = e.code(), "asynchronous rebuild failed");
                ctx.metrics.increment_tasks_failed();
                TaskOutcome::Failed
            }
        }
    }
}

impl Task for RebuildTask {
    fn name(&self) -> String {
        format!("rebuild:{}", self.index)
    }

    fn run(self: Box<Self>) {
        let service = &self.service;
        let Some(index) = service.ctx.catalogue.context().arena.get(self.handle) else {
            debug!(index = %self.index, handle = %self.handle, "index released, rebuild skipped");
            service.succeeded(&self.index);
            return;
        };

        let index_type = index.index_type();
        let outcome = if index_type.supports_async_rebuild() && index_type.supports_incremental_update() {
            let outcome = self.rebuild_async(&index);
            if matches!(outcome, TaskOutcome::Done(true)) {
                service.ctx.metrics.increment_async_rebuilds();
            }
            outcome
        } else {
            let outcome = self.rebuild_sync(&index);
            if matches!(outcome, TaskOutcome::Done(true)) {
                service.ctx.metrics.increment_sync_rebuilds();
            }
            outcome
        };

        match outcome {
            TaskOutcome::Done(_) | TaskOutcome::Missing => service.succeeded(&self.index),
            TaskOutcome::Failed => match service.failed(&self.index) {
                Some(attempt) => {
                    let delay = service.config.retry_delay(service.ctx.task_delay, attempt);
                    warn!(index = %self.index, attempt, ?delay, "index rebuild will be retried");
                    service.schedule(self.index.clone(), self.handle, delay);
                }
                None => {
                    service.ctx.metrics.increment_rebuilds_abandoned();
                    warn!(
                        index = %self.index,
                        retries = service.config.max_retries,
                        "index rebuild abandoned"
                    );
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{CatalogueContext, EntityName};
    use crate::fail_point::FailPoints;
    use crate::index::{IndexDescriptor, IndexType};
    use crate::statistics::StatisticsManager;

    fn handle() -> IndexHandle {
        let ctx = CatalogueContext::new(Arc::new(StatisticsManager::new()), Arc::new(FailPoints::default()), 4);
        let descriptor = IndexDescriptor {
            name: IndexName::new("s", "e", "x"),
            index_type: IndexType::BTree,
            columns: Vec::new(),
            unique: false,
            buckets: 0,
        };
        Index::register(descriptor, ctx).handle()
    }

    #[test]
    fn test_working_set_add_and_remove() {
        let entity = EntityName::new("s", "e");
        let (a, b, c) = (entity.index("a"), entity.index("b"), entity.index("c"));
        let h = handle();
        let events = vec![
            Event::IndexCreated {
                index: a.clone(),
                index_type: IndexType::BTree,
                handle: h,
            },
            Event::IndexStateChanged {
                index: b.clone(),
                index_type: IndexType::BTree,
                handle: h,
                old_state: IndexState::Clean,
                new_state: IndexState::Stale,
            },
            Event::IndexStateChanged {
                index: c.clone(),
                index_type: IndexType::BTree,
                handle: h,
                old_state: IndexState::Clean,
                new_state: IndexState::Stale,
            },
            Event::IndexDropped {
                index: a.clone(),
                index_type: IndexType::BTree,
                handle: h,
            },
            Event::IndexStateChanged {
                index: c.clone(),
                index_type: IndexType::BTree,
                handle: h,
                old_state: IndexState::Stale,
                new_state: IndexState::Clean,
            },
        ];
        let set = working_set(&events);
        assert_eq!(set.keys().cloned().collect::<Vec<_>>(), vec![b]);
    }
}
