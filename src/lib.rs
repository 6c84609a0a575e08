//! quarrydb - transactional concurrency-control core of an embedded analytic database
//!
//! Transactions coordinate per-object sub-units, shared/exclusive locks on
//! named objects and an event log that is delivered to observers in commit
//! order. Background services react to committed events: they analyze stale
//! columns, rebuild stale indexes, track data changes and persist statistics.
//!
//! # Layout
//!
//! - `storage`: snapshot key-value environment with optimistic commit
//! - `transaction`: transactions, locks, events and the manager
//! - `catalogue`: schemas, entities and columns as transactional objects
//! - `index`: index structures, index DBOs and rebuilders
//! - `statistics`: column statistics and their collectors
//! - `services`: auto-analyzer, auto-rebuilder, change tracker, persister
//! - `execution`: worker pools and task scheduling
//! - `database`: the facade wiring everything together

pub mod catalogue;
pub mod config;
pub mod database;
pub mod execution;
pub mod fail_point;
pub mod index;
pub mod observability;
pub mod services;
pub mod statistics;
pub mod storage;
pub mod transaction;
pub mod values;

pub use config::Config;
pub use database::{Database, OpenError};
pub use transaction::{Transaction, TransactionManager, TransactionType};
