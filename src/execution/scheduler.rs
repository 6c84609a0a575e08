//! Deferred task scheduling

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// A self-contained unit of deferred work
pub trait Task: Send + 'static {
    /// Human readable name used in logs
    fn name(&self) -> String;

    fn run(self: Box<Self>);
}

/// Work repeated once per period
pub trait PeriodicTask: Send + Sync + 'static {
    fn name(&self) -> String;

    fn run(&self);
}

/// Schedules tasks after an explicit delay
pub trait Scheduler: Send + Sync {
    fn schedule(&self, task: Box<dyn Task>, delay: Duration);

    fn schedule_periodic(&self, task: Arc<dyn PeriodicTask>, period: Duration);
}

/// One `schedule` call observed by a `ManualScheduler`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRecord {
    pub name: String,
    pub delay: Duration,
}

/// A scheduler that queues tasks until they are run explicitly.
///
/// Delays are recorded, not honoured. Used by tests and by embedders that
/// drive maintenance from their own loop.
#[derive(Default)]
pub struct ManualScheduler {
    pending: Mutex<Vec<Box<dyn Task>>>,
    periodic: Mutex<Vec<Arc<dyn PeriodicTask>>>,
    history: Mutex<Vec<ScheduledRecord>>,
}

impl ManualScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Tasks queued and not yet run
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Every `schedule` call so far, in order
    pub fn history(&self) -> Vec<ScheduledRecord> {
        self.history.lock().clone()
    }

    /// Number of `schedule` calls for tasks named `name`
    pub fn scheduled_count(&self, name: &str) -> usize {
        self.history.lock().iter().filter(|r| r.name == name).count()
    }

    /// Run the tasks queued right now. Tasks they schedule stay queued.
    pub fn run_pending(&self) -> usize {
        let tasks = std::mem::take(&mut *self.pending.lock());
        let count = tasks.len();
        for task in tasks {
            task.run();
        }
        count
    }

    /// Run until the queue is empty or `max_rounds` rounds have run
    pub fn run_until_idle(&self, max_rounds: usize) -> usize {
        let mut total = 0;
        for _ in 0..max_rounds {
            let ran = self.run_pending();
            if ran == 0 {
                break;
            }
            total += ran;
        }
        total
    }

    /// Run every periodic task once
    pub fn tick_periodic(&self) -> usize {
        let tasks: Vec<_> = self.periodic.lock().clone();
        for task in &tasks {
            task.run();
        }
        tasks.len()
    }

    /// Drop queued tasks without running them
    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, task: Box<dyn Task>, delay: Duration) {
        self.history.lock().push(ScheduledRecord {
            name: task.name(),
            delay,
        });
        self.pending.lock().push(task);
    }

    fn schedule_periodic(&self, task: Arc<dyn PeriodicTask>, _period: Duration) {
        self.periodic.lock().push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: &'static str,
        runs: Arc<AtomicUsize>,
    }

    impl Task for Counting {
        fn name(&self) -> String {
            self.name.to_string()
        }

        fn run(self: Box<Self>) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_manual_scheduler_queues_until_run() {
        let scheduler = ManualScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(
            Box::new(Counting {
                name: "a",
                runs: Arc::clone(&runs),
            }),
            Duration::from_millis(100),
        );
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        assert_eq!(scheduler.run_pending(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(
            scheduler.history(),
            vec![ScheduledRecord {
                name: "a".to_string(),
                delay: Duration::from_millis(100)
            }]
        );
    }

    #[test]
    fn test_scheduled_count_by_name() {
        let scheduler = ManualScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b", "a"] {
            scheduler.schedule(
                Box::new(Counting {
                    name,
                    runs: Arc::clone(&runs),
                }),
                Duration::ZERO,
            );
        }
        assert_eq!(scheduler.scheduled_count("a"), 2);
        scheduler.clear();
        assert_eq!(scheduler.run_pending(), 0);
    }
}
