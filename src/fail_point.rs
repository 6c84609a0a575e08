//! Fail point injection for testing failure paths
//!
//! Each database instance owns a `FailPoints` registry. Production code calls
//! `check(name)` at interesting locations; an armed point makes the call
//! return an error instead of proceeding. Points can be armed for a fixed
//! number of hits or permanently.
//!
//! Points listed in the `QUARRYDB_FAIL_POINT` environment variable
//! (comma separated) are armed permanently when the registry is created.
//!
//! ```ignore
//! db.fail_points().arm(points::INDEX_SYNC_REBUILD, 2);
//! ```

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;

/// Environment variable listing permanently armed points
pub const FAIL_POINT_ENV_VAR: &str = "QUARRYDB_FAIL_POINT";

/// Returned by `check` when an armed point fires
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Fail point triggered: {0}")]
pub struct FailPointTriggered(pub String);

#[derive(Debug, Clone, Copy)]
enum Arming {
    Always,
    Times(u32),
}

#[derive(Debug, Default)]
struct Registry {
    armed: HashMap<String, Arming>,
    hits: HashMap<String, u64>,
}

/// Registry of armed fail points
#[derive(Debug, Default)]
pub struct FailPoints {
    inner: Mutex<Registry>,
}

impl FailPoints {
    /// Create a registry, arming points named in `QUARRYDB_FAIL_POINT`
    pub fn new() -> Self {
        let registry = Self::default();
        if let Ok(names) = std::env::var(FAIL_POINT_ENV_VAR) {
            for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                registry.arm_always(name);
            }
        }
        registry
    }

    /// Fail the next `times` evaluations of `name`
    pub fn arm(&self, name: &str, times: u32) {
        self.inner
            .lock()
            .armed
            .insert(name.to_string(), Arming::Times(times));
    }

    /// Fail every evaluation of `name` until disarmed
    pub fn arm_always(&self, name: &str) {
        self.inner.lock().armed.insert(name.to_string(), Arming::Always);
    }

    pub fn disarm(&self, name: &str) {
        self.inner.lock().armed.remove(name);
    }

    /// Evaluate a point. Every evaluation is counted, whether it fires or not.
    pub fn check(&self, name: &str) -> Result<(), FailPointTriggered> {
        let mut inner = self.inner.lock();
        *inner.hits.entry(name.to_string()).or_insert(0) += 1;

        let fire = match inner.armed.get_mut(name) {
            None => false,
            Some(Arming::Always) => true,
            Some(Arming::Times(0)) => false,
            Some(Arming::Times(n)) => {
                *n -= 1;
                true
            }
        };
        if matches!(inner.armed.get(name), Some(Arming::Times(0))) {
            inner.armed.remove(name);
        }

        if fire {
            tracing::debug!(point = name, "fail point triggered");
            Err(FailPointTriggered(name.to_string()))
        } else {
            Ok(())
        }
    }

    /// Number of times `name` was evaluated
    pub fn hits(&self, name: &str) -> u64 {
        self.inner.lock().hits.get(name).copied().unwrap_or(0)
    }
}

/// All defined fail point names
pub mod points {
    // Index maintenance
    pub const INDEX_SYNC_REBUILD: &str = "index_sync_rebuild";
    pub const INDEX_ASYNC_BUILD: &str = "index_async_build";
    pub const INDEX_ASYNC_REPLACE: &str = "index_async_replace";

    // Statistics
    pub const COLUMN_ANALYZE: &str = "column_analyze";
    pub const STATISTICS_PERSIST: &str = "statistics_persist";

    // Commit path
    pub const ENTITY_PREPARE_COMMIT: &str = "entity_prepare_commit";

    /// Get all fail point names
    pub fn all() -> &'static [&'static str] {
        &[
            INDEX_SYNC_REBUILD,
            INDEX_ASYNC_BUILD,
            INDEX_ASYNC_REPLACE,
            COLUMN_ANALYZE,
            STATISTICS_PERSIST,
            ENTITY_PREPARE_COMMIT,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unarmed_point_passes() {
        let registry = FailPoints::default();
        assert!(registry.check("anything").is_ok());
        assert_eq!(registry.hits("anything"), 1);
    }

    #[test]
    fn test_armed_point_fires_n_times() {
        let registry = FailPoints::default();
        registry.arm(points::INDEX_SYNC_REBUILD, 2);

        assert!(registry.check(points::INDEX_SYNC_REBUILD).is_err());
        assert!(registry.check(points::INDEX_SYNC_REBUILD).is_err());
        assert!(registry.check(points::INDEX_SYNC_REBUILD).is_ok());
        assert_eq!(registry.hits(points::INDEX_SYNC_REBUILD), 3);
    }

    #[test]
    fn test_always_until_disarmed() {
        let registry = FailPoints::default();
        registry.arm_always(points::COLUMN_ANALYZE);
        for _ in 0..5 {
            assert!(registry.check(points::COLUMN_ANALYZE).is_err());
        }
        registry.disarm(points::COLUMN_ANALYZE);
        assert!(registry.check(points::COLUMN_ANALYZE).is_ok());
    }

    #[test]
    fn test_point_names_are_lowercase_with_underscores() {
        for point in points::all() {
            assert!(
                point.chars().all(|c| c.is_lowercase() || c == '_'),
                "Fail point '{}' should be lowercase with underscores",
                point
            );
        }
    }
}
