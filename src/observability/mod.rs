//! Observability
//!
//! - Structured logging through `tracing`, installed with `init_logging`
//! - Lock-free operational counters in `MetricsRegistry`
//!
//! Observability never affects execution: logging failures are ignored and
//! counters are plain atomics.

mod logger;
mod metrics;

pub use logger::{init_logging, LOG_ENV_VAR};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
