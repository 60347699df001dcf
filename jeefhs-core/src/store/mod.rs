//! Local event store for jeefhs
//!
//! This module provides the durable buffer between event producers and the
//! sync daemon using SQLite with:
//! - Schema migrations
//! - A one-way synced flag, enforced by triggers
//! - Retention-based compaction of already-synced rows

pub mod local;
pub mod schema;

pub use local::{LocalStore, StoreStats};

use crate::error::{Error, Result};

/// Run a store call on tokio's blocking pool.
///
/// Commits wait on fsync (`synchronous = FULL`); async callers go through
/// here so a slow disk never parks a runtime worker.
pub async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}
