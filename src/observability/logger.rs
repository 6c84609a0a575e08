//! Log subscriber installation
//!
//! All crate code logs through `tracing` macros. The embedding process may
//! install its own subscriber; `init_logging` is a convenience that installs a
//! fmt subscriber configured from `LoggingConfig`.

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Environment variable that overrides the configured filter directive
pub const LOG_ENV_VAR: &str = "QUARRYDB_LOG";

/// Build the filter: `QUARRYDB_LOG` wins over the configured directive
fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a global fmt subscriber.
///
/// Returns false when a global subscriber was already installed, which is
/// not an error.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = build_filter(config);
    let result = if config.json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .with_thread_names(true)
            .try_init()
    } else {
        fmt()
            .compact()
            .with_env_filter(filter)
            .with_thread_names(true)
            .try_init()
    };
    result.is_ok()
}
