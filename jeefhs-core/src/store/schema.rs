//! Event store schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

use crate::error::{Error, Result};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: event buffer
    r#"
    -- AUTOINCREMENT (not plain rowid) so sequence numbers are never reused,
    -- even after the highest rows are compacted away.
    CREATE TABLE IF NOT EXISTS events (
        seq              INTEGER PRIMARY KEY AUTOINCREMENT,
        category         TEXT NOT NULL,
        captured_at      TEXT NOT NULL,
        payload          JSON NOT NULL,
        checksum         TEXT NOT NULL,
        synced           INTEGER NOT NULL DEFAULT 0 CHECK (synced IN (0, 1)),
        synced_at        TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_events_unsynced
        ON events(seq) WHERE synced = 0;

    CREATE INDEX IF NOT EXISTS idx_events_synced_captured
        ON events(captured_at) WHERE synced = 1;
    "#,
    // Version 2: one-way synced flag
    r#"
    CREATE TRIGGER IF NOT EXISTS events_synced_is_final
    BEFORE UPDATE OF synced ON events
    WHEN OLD.synced = 1 AND NEW.synced = 0
    BEGIN
        SELECT RAISE(ABORT, 'synced flag cannot be cleared');
    END;

    CREATE TRIGGER IF NOT EXISTS events_keep_unsynced
    BEFORE DELETE ON events
    WHEN OLD.synced = 0
    BEGIN
        SELECT RAISE(ABORT, 'unsynced events cannot be deleted');
    END;
    "#,
];

/// Bring `conn` up to [`SCHEMA_VERSION`].
///
/// Each step commits together with its `user_version` bump, so a crash
/// mid-upgrade resumes at the first unapplied step. A database written by a
/// newer build is refused rather than downgraded.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let found = get_schema_version(conn)?;
    if found > SCHEMA_VERSION {
        return Err(Error::Config(format!(
            "event store schema v{found} is newer than this build (v{SCHEMA_VERSION})"
        )));
    }

    for (version, sql) in (1..).zip(MIGRATIONS).skip(found as usize) {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        tracing::info!(version, "Applied event store migration");
    }

    if found < SCHEMA_VERSION {
        tracing::info!(from = found, to = SCHEMA_VERSION, "Event store schema upgraded");
    }
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    Ok(conn.pragma_query_value(None, "user_version", |r| r.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migrated() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_rerun_is_a_no_op() {
        let conn = migrated();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_resumes_from_partial_upgrade() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(MIGRATIONS[0]).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();

        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);

        let triggers: i64 = conn
            .query_row("SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(triggers, 2);
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1).unwrap();
        assert!(matches!(run_migrations(&conn), Err(Error::Config(_))));
    }

    #[test]
    fn test_synced_flag_cannot_revert() {
        let conn = migrated();
        conn.execute(
            "INSERT INTO events (category, captured_at, payload, checksum, synced)
             VALUES ('heartbeat', '2025-01-01T00:00:00.000000Z', '{}', 'x', 1)",
            [],
        )
        .unwrap();

        let result = conn.execute("UPDATE events SET synced = 0", []);
        assert!(result.is_err());
    }

    #[test]
    fn test_unsynced_rows_cannot_be_deleted() {
        let conn = migrated();
        conn.execute(
            "INSERT INTO events (category, captured_at, payload, checksum)
             VALUES ('heartbeat', '2025-01-01T00:00:00.000000Z', '{}', 'x')",
            [],
        )
        .unwrap();

        assert!(conn.execute("DELETE FROM events", []).is_err());

        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 1);
    }
}
