//! Worker pools and scheduling
//!
//! Two independent pools serve the database:
//! - the dispatcher runs user pipelines
//! - the service pool runs deferred background tasks
//!
//! A backlog on one never starves the other. Pools are constructed explicitly
//! and injected; there is no global runtime. Background services only see the
//! `Scheduler` trait, so an embedder (or a test) may substitute its own,
//! e.g. `ManualScheduler`.

mod errors;
mod pool;
mod scheduler;

pub use errors::{ExecutionError, ExecutionResult};
pub use pool::{ExecutionManager, WorkerPool};
pub use scheduler::{ManualScheduler, PeriodicTask, ScheduledRecord, Scheduler, Task};
