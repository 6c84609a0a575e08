//! Metrics registry
//!
//! - Counters only, monotonic, reset on process start
//! - Thread-safe and lock-free

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operational counters of one database instance
///
/// All counters use Relaxed ordering; readers get eventually consistent values.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    transactions_begun: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_rolled_back: AtomicU64,
    transactions_killed: AtomicU64,
    transaction_conflicts: AtomicU64,
    events_delivered: AtomicU64,
    delivery_failures: AtomicU64,
    tasks_scheduled: AtomicU64,
    tasks_failed: AtomicU64,
    analyses: AtomicU64,
    sync_rebuilds: AtomicU64,
    async_rebuilds: AtomicU64,
    rebuild_failures: AtomicU64,
    rebuilds_abandoned: AtomicU64,
    statistics_recomputed: AtomicU64,
    statistics_persisted: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl MetricsRegistry {
    /// Create a registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    // Transactions
    counter!(increment_begun, begun, transactions_begun);
    counter!(increment_committed, committed, transactions_committed);
    counter!(increment_rolled_back, rolled_back, transactions_rolled_back);
    counter!(increment_killed, killed, transactions_killed);
    counter!(increment_conflicts, conflicts, transaction_conflicts);

    // Delivery
    counter!(increment_deliveries, deliveries, events_delivered);
    counter!(increment_delivery_failures, delivery_failures, delivery_failures);

    // Background tasks
    counter!(increment_tasks_scheduled, tasks_scheduled, tasks_scheduled);
    counter!(increment_tasks_failed, tasks_failed, tasks_failed);
    counter!(increment_analyses, analyses, analyses);
    counter!(increment_sync_rebuilds, sync_rebuilds, sync_rebuilds);
    counter!(increment_async_rebuilds, async_rebuilds, async_rebuilds);
    counter!(increment_rebuild_failures, rebuild_failures, rebuild_failures);
    counter!(increment_rebuilds_abandoned, rebuilds_abandoned, rebuilds_abandoned);
    counter!(increment_statistics_recomputed, statistics_recomputed, statistics_recomputed);
    counter!(increment_statistics_persisted, statistics_persisted, statistics_persisted);

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transactions_begun: self.begun(),
            transactions_committed: self.committed(),
            transactions_rolled_back: self.rolled_back(),
            transactions_killed: self.killed(),
            transaction_conflicts: self.conflicts(),
            events_delivered: self.deliveries(),
            delivery_failures: self.delivery_failures(),
            tasks_scheduled: self.tasks_scheduled(),
            tasks_failed: self.tasks_failed(),
            analyses: self.analyses(),
            sync_rebuilds: self.sync_rebuilds(),
            async_rebuilds: self.async_rebuilds(),
            rebuild_failures: self.rebuild_failures(),
            rebuilds_abandoned: self.rebuilds_abandoned(),
            statistics_recomputed: self.statistics_recomputed(),
            statistics_persisted: self.statistics_persisted(),
        }
    }

    /// Snapshot rendered as a JSON object
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub transactions_begun: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
    pub transactions_killed: u64,
    pub transaction_conflicts: u64,
    pub events_delivered: u64,
    pub delivery_failures: u64,
    pub tasks_scheduled: u64,
    pub tasks_failed: u64,
    pub analyses: u64,
    pub sync_rebuilds: u64,
    pub async_rebuilds: u64,
    pub rebuild_failures: u64,
    pub rebuilds_abandoned: u64,
    pub statistics_recomputed: u64,
    pub statistics_persisted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registry_has_zero_values() {
        let snapshot = MetricsRegistry::new().snapshot();
        assert_eq!(snapshot.transactions_begun, 0);
        assert_eq!(snapshot.rebuild_failures, 0);
    }

    #[test]
    fn test_increment_counters() {
        let registry = MetricsRegistry::new();
        registry.increment_begun();
        registry.increment_begun();
        registry.increment_conflicts();
        registry.increment_sync_rebuilds();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.transactions_begun, 2);
        assert_eq!(snapshot.transaction_conflicts, 1);
        assert_eq!(snapshot.sync_rebuilds, 1);
        assert_eq!(snapshot.async_rebuilds, 0);
    }

    #[test]
    fn test_to_json() {
        let registry = MetricsRegistry::new();
        registry.increment_committed();

        let parsed: serde_json::Value = serde_json::from_str(&registry.to_json()).unwrap();
        assert_eq!(parsed["transactions_committed"], 1);
    }

    #[test]
    fn test_thread_safety() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..100 {
                        reg.increment_tasks_scheduled();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.tasks_scheduled(), 800);
    }
}
