//! In-process cloud store
//!
//! Rows are keyed on `(device_id, seq)` exactly like the real ingest API, so
//! retried batches collapse into one row per event. Faults can be injected to
//! reproduce outages and ambiguous timeouts.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::probe::ConnectivityProbe;
use crate::types::{EventRecord, SequenceNumber};

use super::{BatchReceipt, CloudStore};

#[derive(Default)]
struct CloudState {
    rows: BTreeMap<(String, SequenceNumber), EventRecord>,
    /// Keys in the order the cloud first stored them
    arrival: Vec<(String, SequenceNumber)>,
    unreachable: bool,
    fail_next: usize,
    reject_next: usize,
    land_then_fail_next: usize,
    latency: Duration,
    write_attempts: usize,
}

/// Cloud store held in memory.
///
/// Cloning shares the same underlying rows, so a test can hand one clone to
/// the daemon and inspect another.
#[derive(Clone)]
pub struct MemoryCloudStore {
    device_id: String,
    state: Arc<Mutex<CloudState>>,
}

impl MemoryCloudStore {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            state: Arc::new(Mutex::new(CloudState::default())),
        }
    }

    /// Simulate the network going down or coming back
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unwrap().unreachable = !reachable;
    }

    /// Fail the next `n` writes before anything is stored
    pub fn fail_next(&self, n: usize) {
        self.state.lock().unwrap().fail_next = n;
    }

    /// Reject the next `n` writes as if the schema did not match
    pub fn reject_next(&self, n: usize) {
        self.state.lock().unwrap().reject_next = n;
    }

    /// Store the next `n` batches, then report a timeout anyway
    pub fn land_then_fail_next(&self, n: usize) {
        self.state.lock().unwrap().land_then_fail_next = n;
    }

    /// Delay every write by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = latency;
    }

    /// Rows in the order they first arrived
    pub fn rows(&self) -> Vec<EventRecord> {
        let state = self.state.lock().unwrap();
        state
            .arrival
            .iter()
            .filter_map(|key| state.rows.get(key).cloned())
            .collect()
    }

    /// Sequence numbers in arrival order
    pub fn arrival_order(&self) -> Vec<SequenceNumber> {
        self.state
            .lock()
            .unwrap()
            .arrival
            .iter()
            .map(|(_, seq)| *seq)
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.state.lock().unwrap().rows.len()
    }

    /// Total `write_batch` calls, successful or not
    pub fn write_attempts(&self) -> usize {
        self.state.lock().unwrap().write_attempts
    }
}

#[async_trait]
impl CloudStore for MemoryCloudStore {
    async fn write_batch(&self, records: &[EventRecord]) -> Result<BatchReceipt> {
        let latency = self.state.lock().unwrap().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().unwrap();
        state.write_attempts += 1;

        if state.unreachable {
            return Err(Error::Connectivity("cloud unreachable".to_string()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(Error::Connectivity("connection reset".to_string()));
        }
        if state.reject_next > 0 {
            state.reject_next -= 1;
            return Err(Error::Replication("batch rejected".to_string()));
        }

        let mut receipt = BatchReceipt::default();
        for record in records {
            let key = (self.device_id.clone(), record.seq);
            if state.rows.contains_key(&key) {
                receipt.duplicates += 1;
                continue;
            }
            let mut stored = record.clone();
            stored.synced = true;
            state.rows.insert(key.clone(), stored);
            state.arrival.push(key);
            receipt.inserted += 1;
        }

        if state.land_then_fail_next > 0 {
            state.land_then_fail_next -= 1;
            return Err(Error::Connectivity(
                "timed out waiting for acknowledgement".to_string(),
            ));
        }

        Ok(receipt)
    }
}

#[async_trait]
impl ConnectivityProbe for MemoryCloudStore {
    async fn is_reachable(&self) -> bool {
        !self.state.lock().unwrap().unreachable
    }
}
