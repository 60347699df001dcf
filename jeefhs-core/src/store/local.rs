//! Durable local event buffer
//!
//! All statements go through a single connection behind a mutex. An append
//! commits before the lock is released, so a concurrent `read_unsynced` either
//! sees the whole record or none of it, and never skips a committed one.

use crate::error::{Error, Result};
use crate::types::{
    compute_checksum, format_timestamp, EventCategory, EventRecord, Payload, SequenceNumber,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Summary counts for operator tooling.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStats {
    /// Rows currently held locally
    pub total: i64,
    /// Rows not yet replicated
    pub unsynced: i64,
    /// Rows replicated but not yet compacted
    pub synced: i64,
    /// Highest sequence number ever assigned (survives compaction)
    pub last_seq: Option<SequenceNumber>,
    /// Capture time of the oldest unsynced row
    pub oldest_unsynced_at: Option<DateTime<Utc>>,
}

/// SQLite-backed append log with a per-row synced flag.
pub struct LocalStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl LocalStore {
    /// Open or create an event store at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // FULL makes every committed append survive power loss, not just a process crash.
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            ",
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Run migrations on this store
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    /// Location on disk, if file-backed
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ============================================
    // Producer side
    // ============================================

    /// Persist a new event with `synced = false` and return its sequence number.
    ///
    /// Any error here means the event was not recorded; callers must treat it
    /// as fatal for that event.
    pub fn append(
        &self,
        category: EventCategory,
        captured_at: DateTime<Utc>,
        payload: &Payload,
    ) -> Result<SequenceNumber> {
        let payload_json = serde_json::to_string(payload)?;
        let checksum = compute_checksum(category, &captured_at, payload)?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO events (category, captured_at, payload, checksum, synced)
            VALUES (?1, ?2, ?3, ?4, 0)
            "#,
            params![
                category.as_str(),
                format_timestamp(&captured_at),
                payload_json,
                checksum,
            ],
        )?;
        let seq = conn.last_insert_rowid();

        tracing::trace!(seq, category = %category, "Appended event");
        Ok(seq)
    }

    // ============================================
    // Replicator side
    // ============================================

    /// Up to `limit` unsynced records, oldest first.
    ///
    /// Fails with [`Error::Corrupt`] if any returned row no longer matches its checksum.
    pub fn read_unsynced(&self, limit: usize) -> Result<Vec<EventRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT seq, category, captured_at, payload, checksum, synced, synced_at
            FROM events
            WHERE synced = 0
            ORDER BY seq ASC
            LIMIT ?1
            "#,
        )?;

        let records = stmt
            .query_map(params![limit as i64], Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if let Some(bad) = records.iter().find(|r| !r.verify()) {
            tracing::error!(seq = bad.seq, "Checksum mismatch in event store");
            return Err(Error::Corrupt { seq: bad.seq });
        }

        Ok(records)
    }

    /// Flip the synced flag for the given sequence numbers.
    ///
    /// Idempotent: rows already synced, or unknown sequence numbers, are left
    /// untouched. Returns how many rows changed.
    pub fn mark_synced(&self, seqs: &[SequenceNumber]) -> Result<usize> {
        if seqs.is_empty() {
            return Ok(0);
        }

        let synced_at = format_timestamp(&Utc::now());
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE events SET synced = 1, synced_at = ?1 WHERE seq = ?2 AND synced = 0",
            )?;
            for seq in seqs {
                changed += stmt.execute(params![synced_at, seq])?;
            }
        }
        tx.commit()?;

        tracing::debug!(requested = seqs.len(), changed, "Marked events synced");
        Ok(changed)
    }

    // ============================================
    // Retention
    // ============================================

    /// Delete synced records captured more than `retention_horizon` ago.
    ///
    /// Unsynced records are never touched, regardless of age.
    pub fn compact(&self, retention_horizon: Duration) -> Result<usize> {
        // A horizon reaching past the representable range keeps everything
        let cutoff = chrono::Duration::from_std(retention_horizon)
            .ok()
            .and_then(|horizon| Utc::now().checked_sub_signed(horizon))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.compact_before(cutoff)
    }

    /// Delete synced records captured strictly before `cutoff`.
    pub fn compact_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM events WHERE synced = 1 AND captured_at < ?1",
            params![format_timestamp(&cutoff)],
        )?;

        if deleted > 0 {
            tracing::info!(deleted, cutoff = %cutoff, "Compacted synced events");
        }
        Ok(deleted)
    }

    // ============================================
    // Queries
    // ============================================

    /// Fetch one record by sequence number
    pub fn get(&self, seq: SequenceNumber) -> Result<Option<EventRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                r#"
                SELECT seq, category, captured_at, payload, checksum, synced, synced_at
                FROM events WHERE seq = ?1
                "#,
                params![seq],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Number of records waiting for replication
    pub fn count_unsynced(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM events WHERE synced = 0", [], |r| {
            r.get(0)
        })?;
        Ok(count)
    }

    /// True if at least one record is waiting for replication
    pub fn has_unsynced(&self) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM events WHERE synced = 0)",
            [],
            |r| r.get(0),
        )?;
        Ok(exists)
    }

    /// Counts for status reporting
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock().unwrap();

        let (total, unsynced): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(synced = 0), 0) FROM events",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;

        let last_seq: Option<i64> = conn
            .query_row(
                "SELECT seq FROM sqlite_sequence WHERE name = 'events'",
                [],
                |r| r.get(0),
            )
            .optional()?;

        let oldest: Option<String> = conn.query_row(
            "SELECT MIN(captured_at) FROM events WHERE synced = 0",
            [],
            |r| r.get(0),
        )?;
        let oldest_unsynced_at = oldest
            .map(|s| parse_timestamp(&s, 0))
            .transpose()?;

        Ok(StoreStats {
            total,
            unsynced,
            synced: total - unsynced,
            last_seq,
            oldest_unsynced_at,
        })
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<EventRecord> {
        let category: String = row.get(1)?;
        let category = category
            .parse::<EventCategory>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, e.into()))?;

        let captured_at: String = row.get(2)?;
        let payload: String = row.get(3)?;
        let payload: Payload = serde_json::from_str(&payload)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
        let synced_at: Option<String> = row.get(6)?;

        Ok(EventRecord {
            seq: row.get(0)?,
            category,
            captured_at: parse_timestamp(&captured_at, 2)?,
            payload,
            checksum: row.get(4)?,
            synced: row.get(5)?,
            synced_at: synced_at.map(|s| parse_timestamp(&s, 6)).transpose()?,
        })
    }
}

fn parse_timestamp(s: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn store() -> LocalStore {
        let store = LocalStore::open_in_memory().unwrap();
        store.migrate().unwrap();
        store
    }

    fn reading(store: &LocalStore, temperature: f64) -> SequenceNumber {
        store
            .append(
                EventCategory::Environmental,
                Utc::now(),
                &payload! { "temperature" => temperature, "humidity" => 40.0 },
            )
            .unwrap()
    }

    #[test]
    fn test_append_assigns_increasing_seq() {
        let store = store();
        let a = reading(&store, 20.0);
        let b = reading(&store, 21.0);
        let c = reading(&store, 22.0);
        assert!(a < b && b < c);

        let record = store.get(b).unwrap().unwrap();
        assert_eq!(record.category, EventCategory::Environmental);
        assert!(!record.synced);
        assert!(record.synced_at.is_none());
        assert!(record.verify());
    }

    #[test]
    fn test_read_unsynced_is_ordered_and_bounded() {
        let store = store();
        let seqs: Vec<_> = (0..5).map(|i| reading(&store, i as f64)).collect();

        let batch = store.read_unsynced(3).unwrap();
        assert_eq!(
            batch.iter().map(|r| r.seq).collect::<Vec<_>>(),
            seqs[..3].to_vec()
        );

        let all = store.read_unsynced(10).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all.iter().map(|r| r.seq).collect::<Vec<_>>(), seqs);
    }

    #[test]
    fn test_mark_synced_is_idempotent() {
        let store = store();
        let seqs: Vec<_> = (0..4).map(|i| reading(&store, i as f64)).collect();

        assert_eq!(store.mark_synced(&seqs[..2]).unwrap(), 2);
        let first = store.get(seqs[0]).unwrap().unwrap();
        let stats_before = store.stats().unwrap();

        // Same set again: nothing changes, including the synced_at timestamp
        assert_eq!(store.mark_synced(&seqs[..2]).unwrap(), 0);
        assert_eq!(store.get(seqs[0]).unwrap().unwrap(), first);
        assert_eq!(store.stats().unwrap(), stats_before);

        // Overlapping set only flips the new row
        assert_eq!(store.mark_synced(&seqs[1..3]).unwrap(), 1);
        assert_eq!(store.count_unsynced().unwrap(), 1);

        // Unknown seqs are ignored
        assert_eq!(store.mark_synced(&[9_999]).unwrap(), 0);
        assert_eq!(store.mark_synced(&[]).unwrap(), 0);
    }

    #[test]
    fn test_compact_only_removes_old_synced_rows() {
        let store = store();
        let old = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let recent = Utc::now();

        let old_synced = store
            .append(EventCategory::Heartbeat, old, &payload! {})
            .unwrap();
        let old_unsynced = store
            .append(EventCategory::Heartbeat, old, &payload! {})
            .unwrap();
        let recent_synced = store
            .append(EventCategory::Heartbeat, recent, &payload! {})
            .unwrap();
        store.mark_synced(&[old_synced, recent_synced]).unwrap();

        // Horizon beyond chrono's range keeps everything
        assert_eq!(store.compact(Duration::from_secs(u64::MAX)).unwrap(), 0);

        let deleted = store.compact(Duration::from_secs(3600)).unwrap();
        assert_eq!(deleted, 1);

        assert!(store.get(old_synced).unwrap().is_none());
        assert!(store.get(old_unsynced).unwrap().is_some());
        assert!(store.get(recent_synced).unwrap().is_some());

        // Even a zero horizon never removes unsynced rows
        store.compact(Duration::ZERO).unwrap();
        assert!(store.get(old_unsynced).unwrap().is_some());
    }

    #[test]
    fn test_seq_not_reused_after_compaction() {
        let store = store();
        let old = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let first = store
            .append(EventCategory::Heartbeat, old, &payload! {})
            .unwrap();
        store.mark_synced(&[first]).unwrap();
        store.compact(Duration::ZERO).unwrap();
        assert_eq!(store.stats().unwrap().total, 0);

        let next = store
            .append(EventCategory::Heartbeat, Utc::now(), &payload! {})
            .unwrap();
        assert!(next > first);
        assert_eq!(store.stats().unwrap().last_seq, Some(next));
    }

    #[test]
    fn test_corrupt_row_is_reported() {
        let store = store();
        let seq = reading(&store, 20.0);
        store
            .connection_for_tests()
            .execute(
                "UPDATE events SET payload = '{\"temperature\":99.0}' WHERE seq = ?1",
                [seq],
            )
            .unwrap();

        match store.read_unsynced(10) {
            Err(Error::Corrupt { seq: bad }) => assert_eq!(bad, seq),
            other => panic!("expected corruption error, got {:?}", other),
        }
    }

    #[test]
    fn test_stats() {
        let store = store();
        assert_eq!(store.stats().unwrap(), StoreStats::default());
        assert!(!store.has_unsynced().unwrap());

        let a = reading(&store, 1.0);
        reading(&store, 2.0);
        store.mark_synced(&[a]).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.unsynced, 1);
        assert_eq!(stats.synced, 1);
        assert!(stats.oldest_unsynced_at.is_some());
        assert!(store.has_unsynced().unwrap());
    }

    #[test]
    fn test_concurrent_producer_and_replicator() {
        let store = Arc::new(store());
        let total = 200;

        let producer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..total {
                    store
                        .append(
                            EventCategory::Heartbeat,
                            Utc::now(),
                            &payload! { "n" => i as i64 },
                        )
                        .unwrap();
                }
            })
        };

        let mut replicated = Vec::new();
        loop {
            // Checked before the read: once the producer is done, an empty read means drained.
            let producer_done = producer.is_finished();
            let batch = store.read_unsynced(16).unwrap();
            if batch.is_empty() {
                if producer_done {
                    break;
                }
                std::thread::yield_now();
                continue;
            }
            let seqs: Vec<_> = batch.iter().map(|r| r.seq).collect();
            assert_eq!(store.mark_synced(&seqs).unwrap(), seqs.len());
            replicated.extend(seqs);
        }
        producer.join().unwrap();

        assert_eq!(replicated.len(), total);
        assert!(replicated.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(store.count_unsynced().unwrap(), 0);
    }

    #[test]
    fn test_reopen_preserves_unsynced_and_sequence() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("events.db");

        let (a, b) = {
            let store = LocalStore::open(&path).unwrap();
            store.migrate().unwrap();
            let a = reading(&store, 1.0);
            let b = reading(&store, 2.0);
            store.mark_synced(&[a]).unwrap();
            (a, b)
        };

        let store = LocalStore::open(&path).unwrap();
        store.migrate().unwrap();
        let pending = store.read_unsynced(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].seq, b);
        assert!(store.get(a).unwrap().unwrap().synced);

        let c = reading(&store, 3.0);
        assert!(c > b);
    }

    impl LocalStore {
        fn connection_for_tests(&self) -> std::sync::MutexGuard<'_, Connection> {
            self.conn.lock().unwrap()
        }
    }
}
