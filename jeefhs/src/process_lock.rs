//! Process-level lock for the replication owner.
//!
//! Only one process at a time may run sync cycles against a given event
//! database: the agent (`jeefhs`) or a manual `jeefhs-sync flush`. Two
//! replicators would read the same unsynced rows and send them twice.
//!
//! The lock is an advisory flock on a file in the runtime directory, named
//! after a hash of the database path so separate databases never contend.
//! The file is never unlinked, so every contender flocks the same inode.

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

const REPLICATOR_LOCK_FILE: &str = "jeefhs-replicator.lock";

/// Held while this process owns replication for a database.
///
/// Dropping the guard releases the lock; the file stays for the next owner.
#[derive(Debug)]
pub struct ReplicatorGuard {
    file: File,
}

impl Drop for ReplicatorGuard {
    fn drop(&mut self) {
        let _ = flock(&self.file, LOCK_UN);
    }
}

/// Take replication ownership of `db_path`, failing if another process has it.
pub fn acquire_replicator_guard(db_path: &Path) -> Result<ReplicatorGuard> {
    acquire_in(&runtime_dir(), db_path)
}

fn acquire_in(dir: &Path, db_path: &Path) -> Result<ReplicatorGuard> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create lock directory {}", dir.display()))?;

    let path = dir.join(lock_filename(db_path));
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file {}", path.display()))?;

    if let Err(e) = flock(&file, LOCK_EX | LOCK_NB) {
        if e.kind() != io::ErrorKind::WouldBlock {
            return Err(e).with_context(|| format!("failed to lock {}", path.display()));
        }
        let owner = read_owner(&mut file)
            .map(|pid| format!(" (pid {pid})"))
            .unwrap_or_default();
        anyhow::bail!(
            "another jeefhs agent or flush is already replicating {}{}",
            db_path.display(),
            owner
        );
    }

    record_owner(&mut file, db_path)
        .with_context(|| format!("failed to write lock file {}", path.display()))?;
    tracing::debug!(lock = %path.display(), db = %db_path.display(), "Acquired replicator lock");

    Ok(ReplicatorGuard { file })
}

fn record_owner(file: &mut File, db_path: &Path) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "pid={}", std::process::id())?;
    writeln!(file, "db={}", db_path.display())?;
    file.flush()
}

fn read_owner(file: &mut File) -> Option<u32> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut contents).ok()?;
    contents
        .lines()
        .find_map(|line| line.strip_prefix("pid="))
        .and_then(|pid| pid.trim().parse().ok())
}

fn runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join("jeefhs")
}

fn lock_filename(db_path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    db_path.hash(&mut hasher);
    format!("{REPLICATOR_LOCK_FILE}.{:016x}", hasher.finish())
}

const LOCK_EX: i32 = 2;
const LOCK_NB: i32 = 4;
const LOCK_UN: i32 = 8;

fn flock(file: &File, operation: i32) -> io::Result<()> {
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    match unsafe { sys::flock(file.as_raw_fd(), operation) } {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

#[cfg(unix)]
mod sys {
    extern "C" {
        pub fn flock(fd: i32, operation: i32) -> i32;
    }
}

#[cfg(not(unix))]
compile_error!("jeefhs process locks require a Unix target (Linux/macOS)");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_replicator_is_refused() {
        let dir = tempfile::TempDir::new().unwrap();
        let locks = dir.path().join("run");
        let db = dir.path().join("events.db");

        let guard = acquire_in(&locks, &db).unwrap();
        // flock is per open file description, so a second open in-process contends too
        let err = acquire_in(&locks, &db).unwrap_err().to_string();
        assert!(err.contains("already replicating"));
        assert!(err.contains(&format!("pid {}", std::process::id())));

        let other = dir.path().join("other.db");
        assert!(acquire_in(&locks, &other).is_ok());

        drop(guard);
        assert!(acquire_in(&locks, &db).is_ok());
    }

    #[test]
    fn test_lock_file_outlives_guard() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("events.db");
        let path = dir.path().join(lock_filename(&db));

        let guard = acquire_in(dir.path(), &db).unwrap();
        let inode = fs::metadata(&path).unwrap().ino();
        drop(guard);

        // Same inode for the next owner, so openers racing a release still contend
        assert_eq!(fs::metadata(&path).unwrap().ino(), inode);
        let _guard = acquire_in(dir.path(), &db).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().ino(), inode);
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with(&format!("pid={}\n", std::process::id())));
    }

    #[test]
    fn test_lock_filename_is_scoped_to_database() {
        let a = lock_filename(Path::new("/a/events.db"));
        let b = lock_filename(Path::new("/b/events.db"));
        assert_ne!(a, b);
        assert!(a.starts_with(REPLICATOR_LOCK_FILE));
    }
}
