//! Sync daemon
//!
//! Replicates the local event buffer to the cloud store. The daemon is an
//! explicit state machine driven one [`SyncDaemon::step`] at a time:
//!
//! ```text
//!            tick                 reachable + rows
//!   IDLE ───────────▶ PROBING ─────────────────────▶ SYNCING
//!    ▲                  │  │                          │    │
//!    │   unreachable /  │  │ storage fault            │    │ write failed /
//!    │   nothing to do  │  ▼                          │    │ timed out
//!    ◀──────────────────┘ BACKOFF ◀─────────────────────────┘
//!    ▲                      │
//!    │                      └──── delay elapsed ────▶ PROBING
//!    └──────────── batch written and marked ────────┘
//! ```
//!
//! Outages are the normal case: an unreachable probe goes back to IDLE with the
//! ordinary poll interval. Only a failed attempt (write, timeout, or local
//! storage fault) enters BACKOFF. After a successful batch the daemon returns
//! to IDLE with no delay while unsynced rows remain, so a backlog drains
//! without waiting for the timer.
//!
//! The daemon keeps nothing durable. The batch it works on is always the
//! oldest unsynced rows, re-read from the store, so restarting it never loses
//! or reorders anything.

mod backoff;

pub use backoff::Backoff;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cloud::CloudStore;
use crate::config::SyncConfig;
use crate::error::Error;
use crate::probe::ConnectivityProbe;
use crate::store::{self, LocalStore};
use crate::types::{EventRecord, SequenceNumber};

/// Where the daemon is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DaemonState {
    /// Waiting for the next cycle
    #[default]
    Idle,
    /// Checking connectivity and reading the next batch
    Probing,
    /// Batch write in flight
    Syncing,
    /// Waiting after a failure
    Backoff,
}

impl DaemonState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonState::Idle => "idle",
            DaemonState::Probing => "probing",
            DaemonState::Syncing => "syncing",
            DaemonState::Backoff => "backoff",
        }
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One executed step of the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: DaemonState,
    pub to: DaemonState,
    /// How long to wait before the next step
    pub delay: Duration,
}

/// Counters for observability
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Probe attempts (one per cycle)
    pub cycles: u64,
    /// Probes that found the cloud unreachable
    pub unreachable_probes: u64,
    /// Batches the cloud confirmed
    pub batches_written: u64,
    /// Rows flipped to synced
    pub records_synced: u64,
    /// Rows the cloud already had (retries after ambiguous failures)
    pub duplicates_acknowledged: u64,
    /// Failed or timed-out batch writes
    pub write_failures: u64,
    /// Local read/mark failures
    pub storage_faults: u64,
    /// When the last batch was confirmed
    pub last_success_at: Option<DateTime<Utc>>,
    /// Most recent failure message
    pub last_error: Option<String>,
}

/// Snapshot published after every step
#[derive(Debug, Clone, Default)]
pub struct DaemonStatus {
    pub state: DaemonState,
    pub stats: SyncStats,
    /// Sequence numbers of the batch being written, if any
    pub in_flight: Vec<SequenceNumber>,
}

/// Background replicator from [`LocalStore`] to a [`CloudStore`].
pub struct SyncDaemon {
    store: Arc<LocalStore>,
    cloud: Box<dyn CloudStore>,
    probe: Box<dyn ConnectivityProbe>,
    config: SyncConfig,
    state: DaemonState,
    in_flight: Vec<EventRecord>,
    backoff: Backoff,
    stats: SyncStats,
    status_tx: watch::Sender<DaemonStatus>,
}

impl SyncDaemon {
    pub fn new(
        store: Arc<LocalStore>,
        cloud: Box<dyn CloudStore>,
        probe: Box<dyn ConnectivityProbe>,
        config: SyncConfig,
    ) -> Self {
        let (status_tx, _) = watch::channel(DaemonStatus::default());
        Self {
            store,
            cloud,
            probe,
            backoff: Backoff::from_config(&config),
            config,
            state: DaemonState::Idle,
            in_flight: Vec::new(),
            stats: SyncStats::default(),
            status_tx,
        }
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Receive a [`DaemonStatus`] after every step
    pub fn subscribe(&self) -> watch::Receiver<DaemonStatus> {
        self.status_tx.subscribe()
    }

    /// Execute the current state's action and move to the next state.
    ///
    /// Never fails: every fault is folded into a transition to IDLE or BACKOFF.
    pub async fn step(&mut self) -> Transition {
        let from = self.state;
        let (to, delay) = match from {
            DaemonState::Idle | DaemonState::Backoff => (DaemonState::Probing, Duration::ZERO),
            DaemonState::Probing => self.probe_and_read().await,
            DaemonState::Syncing => self.write_in_flight().await,
        };
        self.state = to;
        self.publish_status();

        tracing::trace!(from = %from, to = %to, delay_ms = delay.as_millis() as u64, "Sync step");
        Transition { from, to, delay }
    }

    async fn probe_and_read(&mut self) -> (DaemonState, Duration) {
        self.stats.cycles += 1;

        let reachable = tokio::time::timeout(self.config.write_timeout(), self.probe.is_reachable())
            .await
            .unwrap_or(false);
        if !reachable {
            self.stats.unreachable_probes += 1;
            tracing::debug!("Cloud unreachable, waiting for next tick");
            return (DaemonState::Idle, self.config.poll_interval());
        }

        let db = Arc::clone(&self.store);
        let batch_size = self.config.batch_size;
        match store::blocking(move || db.read_unsynced(batch_size)).await {
            Ok(batch) if batch.is_empty() => (DaemonState::Idle, self.config.poll_interval()),
            Ok(batch) => {
                tracing::debug!(
                    first_seq = batch[0].seq,
                    count = batch.len(),
                    "Read batch for replication"
                );
                self.in_flight = batch;
                (DaemonState::Syncing, Duration::ZERO)
            }
            Err(e) => self.storage_fault(e),
        }
    }

    async fn write_in_flight(&mut self) -> (DaemonState, Duration) {
        if self.in_flight.is_empty() {
            return (DaemonState::Idle, Duration::ZERO);
        }

        let batch = std::mem::take(&mut self.in_flight);
        let timeout = self.config.write_timeout();
        let result = match tokio::time::timeout(timeout, self.cloud.write_batch(&batch)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Connectivity(format!(
                "batch write timed out after {:?}",
                timeout
            ))),
        };

        let receipt = match result {
            Ok(receipt) => receipt,
            Err(e) => {
                // Nothing is marked; the same rows are re-read and re-sent after backoff.
                self.stats.write_failures += 1;
                self.stats.last_error = Some(e.to_string());
                let delay = self.backoff.next_delay();
                tracing::warn!(
                    error = %e,
                    batch_len = batch.len(),
                    first_seq = batch[0].seq,
                    failures = self.backoff.failures(),
                    retry_in_ms = delay.as_millis() as u64,
                    "Batch write failed"
                );
                return (DaemonState::Backoff, delay);
            }
        };

        let seqs: Vec<SequenceNumber> = batch.iter().map(|r| r.seq).collect();
        let db = Arc::clone(&self.store);
        let to_mark = seqs.clone();
        let marked = match store::blocking(move || db.mark_synced(&to_mark)).await {
            Ok(marked) => marked,
            // The cloud has the rows; resending them later is a no-op there.
            Err(e) => return self.storage_fault(e),
        };

        self.backoff.reset();
        self.stats.batches_written += 1;
        self.stats.records_synced += marked as u64;
        self.stats.duplicates_acknowledged += receipt.duplicates as u64;
        self.stats.last_success_at = Some(Utc::now());

        tracing::info!(
            count = seqs.len(),
            first_seq = seqs[0],
            last_seq = seqs[seqs.len() - 1],
            inserted = receipt.inserted,
            duplicates = receipt.duplicates,
            "Synced batch to cloud"
        );

        let db = Arc::clone(&self.store);
        match store::blocking(move || db.has_unsynced()).await {
            Ok(true) => (DaemonState::Idle, Duration::ZERO),
            Ok(false) => (DaemonState::Idle, self.config.poll_interval()),
            Err(e) => self.storage_fault(e),
        }
    }

    fn storage_fault(&mut self, error: Error) -> (DaemonState, Duration) {
        self.stats.storage_faults += 1;
        self.stats.last_error = Some(error.to_string());
        let delay = self.backoff.next_delay();
        tracing::error!(
            error = %error,
            retry_in_ms = delay.as_millis() as u64,
            "Local storage fault during sync"
        );
        (DaemonState::Backoff, delay)
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(DaemonStatus {
            state: self.state,
            stats: self.stats.clone(),
            in_flight: self.in_flight.iter().map(|r| r.seq).collect(),
        });
    }

    /// Run cycles back to back until nothing is left or an attempt fails.
    ///
    /// Stops at the first transition that would wait: an empty store, an
    /// unreachable cloud, or a failure that entered BACKOFF.
    pub async fn drain(&mut self) -> Transition {
        loop {
            let transition = self.step().await;
            if !transition.delay.is_zero() {
                return transition;
            }
        }
    }

    /// Drive the state machine until `shutdown` flips to true.
    ///
    /// Shutdown is only observed between steps, so an in-flight write always
    /// completes or times out before this returns.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SyncStats {
        tracing::info!(
            poll_interval_secs = self.config.poll_interval_secs,
            batch_size = self.config.batch_size,
            "Sync daemon started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let transition = self.step().await;
            if transition.delay.is_zero() {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(transition.delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(
            batches_written = self.stats.batches_written,
            records_synced = self.stats.records_synced,
            write_failures = self.stats.write_failures,
            "Sync daemon stopped"
        );
        self.stats
    }

    /// Start [`run`](Self::run) on the tokio runtime.
    pub fn spawn(self) -> DaemonHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let status_rx = self.subscribe();
        let join = tokio::spawn(self.run(shutdown_rx));
        DaemonHandle {
            shutdown_tx,
            status_rx,
            join,
        }
    }
}

/// Handle to a spawned [`SyncDaemon`]
pub struct DaemonHandle {
    shutdown_tx: watch::Sender<bool>,
    status_rx: watch::Receiver<DaemonStatus>,
    join: JoinHandle<SyncStats>,
}

impl DaemonHandle {
    /// Latest published status
    pub fn status(&self) -> DaemonStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DaemonStatus> {
        self.status_rx.clone()
    }

    /// Ask the daemon to stop and wait for it, including any in-flight write.
    pub async fn shutdown(self) -> SyncStats {
        let _ = self.shutdown_tx.send(true);
        match self.join.await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(error = %e, "Sync daemon task failed");
                SyncStats::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MemoryCloudStore;
    use crate::payload;
    use crate::types::EventCategory;

    fn config() -> SyncConfig {
        SyncConfig {
            poll_interval_secs: 10,
            batch_size: 10,
            backoff_base_secs: 1,
            backoff_cap_secs: 8,
            write_timeout_secs: 5,
            ..Default::default()
        }
    }

    fn setup(config: SyncConfig) -> (Arc<LocalStore>, MemoryCloudStore, SyncDaemon) {
        let store = LocalStore::open_in_memory().unwrap();
        store.migrate().unwrap();
        let store = Arc::new(store);
        let cloud = MemoryCloudStore::new("pi_01");
        let daemon = SyncDaemon::new(
            Arc::clone(&store),
            Box::new(cloud.clone()),
            Box::new(cloud.clone()),
            config,
        );
        (store, cloud, daemon)
    }

    fn append(store: &LocalStore, n: usize) -> Vec<SequenceNumber> {
        (0..n)
            .map(|i| {
                store
                    .append(
                        EventCategory::Environmental,
                        Utc::now(),
                        &payload! { "temperature" => 20.0 + i as f64 },
                    )
                    .unwrap()
            })
            .collect()
    }

    fn expect(t: Transition, from: DaemonState, to: DaemonState) {
        assert_eq!((t.from, t.to), (from, to), "unexpected transition {:?}", t);
    }

    #[tokio::test]
    async fn test_offline_then_restored() {
        let (store, cloud, mut daemon) = setup(config());
        cloud.set_reachable(false);
        let seqs = append(&store, 5);

        expect(daemon.step().await, DaemonState::Idle, DaemonState::Probing);
        let t = daemon.step().await;
        expect(t, DaemonState::Probing, DaemonState::Idle);
        // No backoff penalty while offline
        assert_eq!(t.delay, Duration::from_secs(10));
        assert_eq!(cloud.write_attempts(), 0);

        let pending = store.read_unsynced(10).unwrap();
        assert_eq!(pending.iter().map(|r| r.seq).collect::<Vec<_>>(), seqs);

        cloud.set_reachable(true);
        expect(daemon.step().await, DaemonState::Idle, DaemonState::Probing);
        expect(daemon.step().await, DaemonState::Probing, DaemonState::Syncing);
        let t = daemon.step().await;
        expect(t, DaemonState::Syncing, DaemonState::Idle);
        assert_eq!(t.delay, Duration::from_secs(10));

        assert_eq!(cloud.write_attempts(), 1);
        assert_eq!(cloud.arrival_order(), seqs);
        assert_eq!(store.count_unsynced().unwrap(), 0);

        // Nothing new: a full cycle performs no write
        expect(daemon.step().await, DaemonState::Idle, DaemonState::Probing);
        expect(daemon.step().await, DaemonState::Probing, DaemonState::Idle);
        assert_eq!(cloud.write_attempts(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_backs_off_and_retries_full_batch() {
        let (store, cloud, mut daemon) = setup(config());
        append(&store, 3);
        cloud.fail_next(2);

        let mut delays = Vec::new();
        for _ in 0..2 {
            let before = daemon.state();
            expect(daemon.step().await, before, DaemonState::Probing);
            expect(daemon.step().await, DaemonState::Probing, DaemonState::Syncing);
            let t = daemon.step().await;
            expect(t, DaemonState::Syncing, DaemonState::Backoff);
            delays.push(t.delay);
            assert_eq!(store.count_unsynced().unwrap(), 3);
        }
        assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);

        expect(daemon.step().await, DaemonState::Backoff, DaemonState::Probing);
        expect(daemon.step().await, DaemonState::Probing, DaemonState::Syncing);
        expect(daemon.step().await, DaemonState::Syncing, DaemonState::Idle);

        assert_eq!(store.count_unsynced().unwrap(), 0);
        assert_eq!(cloud.row_count(), 3);
        assert_eq!(daemon.backoff().failures(), 0);
        assert_eq!(daemon.stats().write_failures, 2);
        assert_eq!(daemon.stats().batches_written, 1);
    }

    #[tokio::test]
    async fn test_replication_fault_is_retried_like_connectivity() {
        let (store, cloud, mut daemon) = setup(config());
        append(&store, 1);
        cloud.reject_next(1);

        let t = daemon.drain().await;
        expect(t, DaemonState::Syncing, DaemonState::Backoff);
        assert!(daemon
            .stats()
            .last_error
            .as_deref()
            .unwrap()
            .contains("replication"));

        let t = daemon.drain().await;
        expect(t, DaemonState::Syncing, DaemonState::Idle);
        assert_eq!(cloud.row_count(), 1);
    }

    #[tokio::test]
    async fn test_drain_loop_skips_timer_while_backlog_remains() {
        let (store, cloud, mut daemon) = setup(SyncConfig {
            batch_size: 2,
            ..config()
        });
        let seqs = append(&store, 5);

        let mut zero_delay_idles = 0;
        loop {
            let t = daemon.step().await;
            if t.to == DaemonState::Idle {
                if t.delay.is_zero() {
                    zero_delay_idles += 1;
                } else {
                    break;
                }
            }
        }

        assert_eq!(zero_delay_idles, 2);
        assert_eq!(daemon.stats().batches_written, 3);
        assert_eq!(cloud.write_attempts(), 3);
        assert_eq!(cloud.arrival_order(), seqs);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_write_times_out() {
        let (store, cloud, mut daemon) = setup(SyncConfig {
            write_timeout_secs: 1,
            ..config()
        });
        append(&store, 2);
        cloud.set_latency(Duration::from_secs(30));

        let t = daemon.drain().await;
        expect(t, DaemonState::Syncing, DaemonState::Backoff);
        assert!(daemon
            .stats()
            .last_error
            .as_deref()
            .unwrap()
            .contains("timed out"));
        assert_eq!(store.count_unsynced().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_status_is_published() {
        let (store, _cloud, mut daemon) = setup(config());
        append(&store, 2);
        let status = daemon.subscribe();

        daemon.step().await;
        daemon.step().await;
        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.state, DaemonState::Syncing);
        assert_eq!(snapshot.in_flight.len(), 2);

        daemon.step().await;
        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.state, DaemonState::Idle);
        assert!(snapshot.in_flight.is_empty());
        assert_eq!(snapshot.stats.records_synced, 2);
    }
}
