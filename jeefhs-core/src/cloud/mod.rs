//! Cloud store client interface
//!
//! The sync daemon only ever sees [`CloudStore::write_batch`]: a batch either
//! fully commits or is treated as fully failed. Adapters must make the write
//! idempotent on `(device_id, seq)` so a batch re-sent after an ambiguous
//! failure never creates duplicate cloud rows.
//!
//! ## Adapters
//!
//! - [`HttpCloudStore`] posts batches to an ingest API that upserts on
//!   `(device_id, seq)`.
//! - [`MemoryCloudStore`] keeps rows in process, with fault injection for
//!   exercising outages and ambiguous timeouts.

mod http;
mod memory;

pub use http::HttpCloudStore;
pub use memory::MemoryCloudStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::EventRecord;

/// What the cloud reported for a committed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReceipt {
    /// Rows newly written
    pub inserted: usize,
    /// Rows that already existed for the same `(device_id, seq)`
    pub duplicates: usize,
}

/// Remote, append-only event store.
#[async_trait]
pub trait CloudStore: Send + Sync {
    /// Write an ordered batch of records.
    ///
    /// `Ok` means every record in the batch is durably stored remotely.
    /// `Err` means the outcome is unknown; the caller retries the whole batch.
    async fn write_batch(&self, records: &[EventRecord]) -> Result<BatchReceipt>;
}
