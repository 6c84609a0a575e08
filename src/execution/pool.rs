//! Tokio-backed worker pools

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::config::ExecutionConfig;

use super::errors::{ExecutionError, ExecutionResult};
use super::scheduler::{PeriodicTask, Scheduler, Task};

/// A named pool of worker threads
pub struct WorkerPool {
    name: String,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl WorkerPool {
    /// Start a pool running at most `threads` jobs at a time
    pub fn new(name: &str, threads: usize) -> ExecutionResult<Self> {
        let threads = threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.min(2))
            .max_blocking_threads(threads)
            .thread_name(format!("{}-worker", name))
            .enable_time()
            .build()
            .map_err(|e| ExecutionError::Startup {
                pool: name.to_string(),
                reason: e.to_string(),
            })?;
        debug!(pool = name, threads, "worker pool started");
        Ok(Self {
            name: name.to_string(),
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run a blocking job on the pool
    pub fn spawn_blocking<F>(&self, job: F) -> ExecutionResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(ExecutionError::Shutdown(self.name.clone()));
        }
        drop(self.handle.spawn_blocking(job));
        Ok(())
    }

    /// Stop accepting work; running jobs are abandoned, not awaited
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
            debug!(pool = %self.name, "worker pool shut down");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Scheduler for WorkerPool {
    fn schedule(&self, task: Box<dyn Task>, delay: Duration) {
        if self.is_shut_down() {
            debug!(pool = %self.name, task = %task.name(), "pool shut down, task dropped");
            return;
        }
        let name = task.name();
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tokio::task::spawn_blocking(move || task.run()).await {
                error!(task = %name, error = %e, "background task panicked");
            }
        });
    }

    fn schedule_periodic(&self, task: Arc<dyn PeriodicTask>, period: Duration) {
        if self.is_shut_down() {
            return;
        }
        self.handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let job = Arc::clone(&task);
                if let Err(e) = tokio::task::spawn_blocking(move || job.run()).await {
                    error!(task = %task.name(), error = %e, "periodic task panicked");
                }
            }
        });
    }
}

/// Owner of the dispatcher and the service pool
#[derive(Debug)]
pub struct ExecutionManager {
    dispatcher: Arc<WorkerPool>,
    services: Arc<WorkerPool>,
}

impl ExecutionManager {
    pub fn new(config: &ExecutionConfig) -> ExecutionResult<Self> {
        Ok(Self {
            dispatcher: Arc::new(WorkerPool::new("dispatcher", config.dispatcher_threads)?),
            services: Arc::new(WorkerPool::new("services", config.service_threads)?),
        })
    }

    /// Pool running user pipelines
    pub fn dispatcher(&self) -> &Arc<WorkerPool> {
        &self.dispatcher
    }

    /// Pool running background tasks
    pub fn services(&self) -> &Arc<WorkerPool> {
        &self.services
    }

    pub fn shutdown(&self) {
        self.services.shutdown();
        self.dispatcher.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct Notify(mpsc::Sender<&'static str>);

    impl Task for Notify {
        fn name(&self) -> String {
            "notify".to_string()
        }

        fn run(self: Box<Self>) {
            let _ = self.0.send("ran");
        }
    }

    #[test]
    fn test_spawn_blocking_runs_job() {
        let pool = WorkerPool::new("test", 2).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.spawn_blocking(move || {
            tx.send(42).unwrap();
        })
        .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_scheduled_task_runs_after_delay() {
        let pool = WorkerPool::new("test", 1).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.schedule(Box::new(Notify(tx)), Duration::from_millis(20));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "ran");
    }

    #[test]
    fn test_shutdown_rejects_jobs() {
        let pool = WorkerPool::new("test", 1).unwrap();
        pool.shutdown();
        let err = pool.spawn_blocking(|| {}).unwrap_err();
        assert_eq!(err.code(), "QDB_EXEC_SHUTDOWN");
        pool.shutdown();
    }

    #[test]
    fn test_pools_are_independent() {
        let config = ExecutionConfig {
            dispatcher_threads: 1,
            service_threads: 1,
            ..ExecutionConfig::default()
        };
        let manager = ExecutionManager::new(&config).unwrap();

        // Occupy the single service slot.
        let (release_tx, release_rx) = mpsc::channel::<()>();
        manager
            .services()
            .spawn_blocking(move || {
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
            })
            .unwrap();

        let (tx, rx) = mpsc::channel();
        manager
            .dispatcher()
            .spawn_blocking(move || tx.send("dispatched").unwrap())
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "dispatched");

        release_tx.send(()).unwrap();
        manager.shutdown();
    }
}
