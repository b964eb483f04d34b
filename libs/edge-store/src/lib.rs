//! edge-store - Bucketed key-value persistence
//!
//! Rule runtime state, window buffers, minute snapshots and the failed-action
//! queue all persist through [`KvStore`]: bucket + key + JSON blob, with
//! ordered range scans.
//!
//! Backends:
//! - [`MemoryKvStore`]: `BTreeMap` per bucket, for tests and volatile deployments
//! - [`SqliteKvStore`]: durable, via sqlx

pub mod error;
mod memory_impl;
mod sqlite_impl;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory_impl::MemoryKvStore;
pub use sqlite_impl::SqliteKvStore;
pub use traits::{KvStore, KvStoreExt};
