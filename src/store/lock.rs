//! Exclusive, timeout-bounded, cross-process locking for the ledger.
//!
//! The lock lives in a sidecar file (`<ledger>.lock`) rather than on the
//! ledger itself: the ledger is replaced by rename on every write, and a
//! flock held on a renamed-away inode would no longer exclude anyone.
//!
//! Synchronization protocol:
//! - Writer acquires `flock(LOCK_EX)` → reads rows → writes replacement → releases
//! - `flock` release synchronizes-with the next successful acquisition

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{DroverError, Result};
use crate::ledger::{file as ledger_file, Job};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const POLL_JITTER_MS: u64 = 25;

/// Held for the duration of one ledger transaction. The OS releases the
/// flock when the file handle drops.
#[derive(Debug)]
struct LockGuard {
    _lock_file: File,
}

/// Serializes all ledger access across processes.
#[derive(Debug, Clone)]
pub struct LockManager {
    ledger_path: PathBuf,
    lock_path: PathBuf,
    timeout: Duration,
}

impl LockManager {
    pub fn new(ledger_path: PathBuf, timeout: Duration) -> Self {
        let mut lock_name = ledger_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "ledger".into());
        lock_name.push(".lock");
        let lock_path = ledger_path.with_file_name(lock_name);
        Self {
            ledger_path,
            lock_path,
            timeout,
        }
    }

    pub fn ledger_path(&self) -> &Path {
        &self.ledger_path
    }

    /// Run one atomic read-modify-write transaction against the ledger.
    ///
    /// The transform receives the full current row set. Returning
    /// `Some(rows)` replaces the ledger contents via atomic rename before
    /// the lock is released; `None` leaves the file untouched (read-only
    /// transaction). This is the only way any component touches the
    /// ledger file.
    ///
    /// # Errors
    ///
    /// `DroverError::LockTimeout` if the lock cannot be acquired within
    /// the configured timeout. Callers should treat that as retryable.
    pub fn with_exclusive_lock<T, F>(&self, transform: F) -> Result<T>
    where
        F: FnOnce(Vec<Job>) -> Result<(Option<Vec<Job>>, T)>,
    {
        let _guard = self.acquire()?;
        ledger_file::ensure_exists(&self.ledger_path)?;
        let rows = ledger_file::read_rows(&self.ledger_path)?;
        let (replacement, value) = transform(rows)?;
        if let Some(rows) = replacement {
            ledger_file::write_atomic(&self.ledger_path, &rows)?;
        }
        Ok(value)
    }

    fn acquire(&self) -> Result<LockGuard> {
        if let Some(parent) = self.lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)?;

        let start = Instant::now();
        loop {
            if try_flock_exclusive(&lock_file)? {
                return Ok(LockGuard {
                    _lock_file: lock_file,
                });
            }
            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                return Err(DroverError::LockTimeout {
                    path: self.lock_path.clone(),
                    elapsed_secs: elapsed.as_secs(),
                });
            }
            // Jitter keeps a pack of polling workers from thundering in step.
            let jitter_ms = rand::random::<u64>() % (POLL_JITTER_MS + 1);
            std::thread::sleep(POLL_INTERVAL + Duration::from_millis(jitter_ms));
        }
    }
}

/// Try to acquire an exclusive flock on a file (non-blocking).
///
/// Returns `Ok(true)` if acquired, `Ok(false)` if held elsewhere.
pub(crate) fn try_flock_exclusive(file: &File) -> Result<bool> {
    let fd = file.as_raw_fd();
    // SAFETY: flock is a standard POSIX call and fd is a valid descriptor
    // owned by `file` for the duration of the call.
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path) -> LockManager {
        LockManager::new(dir.join("ledger.csv"), Duration::from_millis(300))
    }

    #[test]
    fn test_transaction_creates_ledger_and_persists_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());

        let inserted = mgr
            .with_exclusive_lock(|mut rows| {
                assert!(rows.is_empty());
                rows.push(Job::seeded(
                    "j1".into(),
                    "alice".into(),
                    String::new(),
                    "t".into(),
                    3,
                ));
                Ok((Some(rows), 1usize))
            })
            .unwrap();
        assert_eq!(inserted, 1);

        let count = mgr
            .with_exclusive_lock(|rows| Ok((None, rows.len())))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_read_only_transaction_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.with_exclusive_lock(|rows| Ok((Some(rows), ()))).unwrap();
        let before = std::fs::read(mgr.ledger_path()).unwrap();

        mgr.with_exclusive_lock(|rows| Ok((None, rows.len()))).unwrap();
        let after = std::fs::read(mgr.ledger_path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_lock_times_out_when_held_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        // Hold the sidecar lock from a second handle, as another process would.
        let holder = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(dir.path().join("ledger.csv.lock"))
            .unwrap();
        assert!(try_flock_exclusive(&holder).unwrap());

        let err = mgr
            .with_exclusive_lock(|rows| Ok((None, rows.len())))
            .unwrap_err();
        assert!(matches!(err, DroverError::LockTimeout { .. }));
    }

    #[test]
    fn test_transform_error_aborts_write() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.with_exclusive_lock(|rows| Ok((Some(rows), ()))).unwrap();

        let result: Result<()> = mgr.with_exclusive_lock(|_| {
            Err(DroverError::Internal("transform failed".into()))
        });
        assert!(result.is_err());

        // Ledger still readable and empty.
        let count = mgr
            .with_exclusive_lock(|rows| Ok((None, rows.len())))
            .unwrap();
        assert_eq!(count, 0);
    }
}
