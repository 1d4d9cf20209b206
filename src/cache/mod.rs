//! Bucket storage and the caching strategies built on it.
//!
//! This module provides:
//! - Named, versioned buckets mapping request keys to response snapshots
//! - A SQLite-backed store with an optional byte quota
//! - The cache-first, network-first and stale-while-revalidate strategies

mod storage;
mod strategy;
mod types;

pub use storage::{BucketHandle, BucketStore, SqliteStorage, StorageError};
pub use strategy::{StrategyEngine, StrategyError};
pub use types::{RequestKey, ResponseSource, Served, Snapshot};
