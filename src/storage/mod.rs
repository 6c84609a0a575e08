//! Storage environment
//!
//! A versioned, in-memory key/value environment of named stores. It plays the
//! role of the persistent storage engine underneath the transaction core:
//!
//! - `Environment::begin` pins a consistent snapshot of every store
//! - Writes are buffered in the `StorageTx` and readable by it
//! - `StorageTx::commit` validates optimistically and returns `false` on a
//!   write conflict instead of failing
//! - A successful commit publishes all of its writes at once
//!
//! Keys and values are raw bytes. Metadata values are JSON encoded through the
//! typed helpers.

mod environment;
mod errors;

pub use environment::{decode_tuple_key, tuple_key, Environment, StorageTx};
pub use errors::{StorageError, StorageResult};
