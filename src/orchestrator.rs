//! Session supervision: one orchestrator per ledger at a time.
//!
//! The orchestrator seeds the store if needed, spawns worker processes,
//! waits for every worker of a pass to exit, consults the retry pass
//! manager, and repeats until the ledger settles or the pass budget is
//! spent. Session-scoped resources are released only after all workers
//! have exited; teardown never races ahead of worker shutdown.
//!
//! Concurrent-session detection is identity-based: a flock-held session
//! file next to the ledger records who owns the run. A second
//! orchestrator over the same ledger reads that record and refuses to
//! start, naming the holder.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::error::{DroverError, Result};
use crate::retry::{PassOutcome, RetryPassManager};
use crate::seed::JobSource;
use crate::store::lock::try_flock_exclusive;
use crate::store::{JobStore, LedgerStats};

/// Identity of a running session, persisted in the session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Exclusive ownership of one ledger's session scope.
///
/// The flock is held for the guard's lifetime; the record stays readable
/// by other processes (`drover stop`, conflict reporting) the whole time.
#[derive(Debug)]
pub struct SessionGuard {
    record: SessionRecord,
    path: PathBuf,
    _lock_file: std::fs::File,
}

impl SessionGuard {
    pub fn acquire(ledger_path: &Path) -> Result<SessionGuard> {
        let path = session_path(ledger_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if !try_flock_exclusive(&lock_file)? {
            return Err(match read_session(ledger_path)? {
                Some(record) => DroverError::SessionConflict {
                    session_id: record.session_id,
                    pid: record.pid,
                },
                None => DroverError::SessionConflict {
                    session_id: "<unreadable session record>".into(),
                    pid: 0,
                },
            });
        }

        let record = SessionRecord {
            session_id: Uuid::new_v4().to_string(),
            pid: std::process::id(),
            started_at: Utc::now(),
        };
        lock_file.set_len(0)?;
        lock_file.write_all(serde_json::to_string_pretty(&record)?.as_bytes())?;
        lock_file.sync_all()?;

        Ok(SessionGuard {
            record,
            path,
            _lock_file: lock_file,
        })
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    /// Remove the session file and drop the flock. Called only after
    /// all workers have exited.
    pub fn release(self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Could not remove session file");
        }
    }
}

pub fn session_path(ledger_path: &Path) -> PathBuf {
    let mut name = ledger_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "ledger".into());
    name.push(".session");
    ledger_path.with_file_name(name)
}

/// Read the session record for a ledger, if a session file exists.
/// Used by `drover stop` and for conflict reporting.
pub fn read_session(ledger_path: &Path) -> Result<Option<SessionRecord>> {
    let path = session_path(ledger_path);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if contents.trim().is_empty() {
        return Ok(None);
    }
    Ok(serde_json::from_str(&contents).ok())
}

/// Ask the session owning this ledger (if any) to shut down gracefully.
/// Returns the record that was signaled.
pub fn signal_stop(ledger_path: &Path) -> Result<Option<SessionRecord>> {
    match read_session(ledger_path)? {
        Some(record) => {
            send_sigterm(record.pid);
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

/// What one session accomplished, for the exit summary.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub workers: u32,
    pub passes_run: u32,
    /// None when the session was interrupted before a pass decision.
    pub outcome: Option<PassOutcome>,
    pub interrupted: bool,
    pub stats: LedgerStats,
}

pub struct Orchestrator {
    config: CoordinatorConfig,
    store: JobStore,
    workers: u32,
}

impl Orchestrator {
    pub fn new(config: CoordinatorConfig, store: JobStore, workers: u32) -> Self {
        Self {
            config,
            store,
            workers: workers.max(1),
        }
    }

    /// Run one session to completion.
    ///
    /// `seed_source` is consulted when the ledger holds no rows (or when
    /// `force_reseed` is set); insertion stays idempotent either way.
    pub async fn run(
        &self,
        shutdown: CancellationToken,
        seed_source: Option<&dyn JobSource>,
        force_reseed: bool,
    ) -> Result<RunSummary> {
        let session = SessionGuard::acquire(&self.config.ledger_path)?;
        tracing::info!(
            session_id = %session.record().session_id,
            pid = session.record().pid,
            ledger = %self.config.ledger_path.display(),
            workers = self.workers,
            "Session started"
        );

        let result = self.run_inner(&shutdown, seed_source, force_reseed).await;

        // By the time run_inner returns, every worker has exited or been
        // killed; only now may session-scoped resources go away.
        session.release();
        let summary = result?;
        tracing::info!(
            workers_stopped = summary.workers,
            passes_run = summary.passes_run,
            interrupted = summary.interrupted,
            pending = summary.stats.pending,
            success = summary.stats.success,
            failed = summary.stats.failed,
            failed_account = summary.stats.failed_account,
            failed_infrastructure = summary.stats.failed_infrastructure,
            retrying = summary.stats.retrying,
            skipped = summary.stats.skipped,
            "Session complete"
        );
        Ok(summary)
    }

    async fn run_inner(
        &self,
        shutdown: &CancellationToken,
        seed_source: Option<&dyn JobSource>,
        force_reseed: bool,
    ) -> Result<RunSummary> {
        let stale_age = self.config.stale_claim_age;
        let released = self
            .store_call(move |s| s.release_stale_claims(stale_age))
            .await?;
        if released > 0 {
            tracing::info!(released, "Released stale claims left by a previous session");
        }

        if let Some(source) = seed_source {
            let stats = self.store_call(|s| s.stats()).await?;
            if stats.total() == 0 || force_reseed {
                let seeds = source.jobs()?;
                let policy = self.config.retry.clone();
                let jobs: Vec<_> = seeds.into_iter().map(|s| s.into_job(&policy)).collect();
                let inserted = self.store_call(move |s| s.seed(jobs)).await?;
                tracing::info!(inserted, "Seeded ledger");
            }
        }

        let mut pass = 1u32;
        let mut interrupted = false;
        let mut outcome = None;
        loop {
            if shutdown.is_cancelled() {
                interrupted = true;
                break;
            }
            tracing::info!(pass, "Starting pass");
            if self.run_worker_pass(pass, shutdown).await? {
                interrupted = true;
                break;
            }

            let store = self.store.clone();
            let max_passes = self.config.max_passes;
            let decision = tokio::task::spawn_blocking(move || {
                RetryPassManager::new(store, max_passes).evaluate(pass)
            })
            .await
            .map_err(|e| DroverError::Internal(format!("pass evaluation panicked: {e}")))??;

            match decision {
                PassOutcome::NextPass { pass_number, reset } => {
                    tracing::info!(pass_number, reset, "Continuing with next pass");
                    pass = pass_number;
                }
                terminal => {
                    outcome = Some(terminal);
                    break;
                }
            }
        }

        let stats = self.store_call(|s| s.stats()).await?;
        Ok(RunSummary {
            workers: self.workers,
            passes_run: pass,
            outcome,
            interrupted,
            stats,
        })
    }

    /// Spawn the worker fleet for one pass and wait for every process to
    /// exit. Returns true if shutdown interrupted the pass.
    async fn run_worker_pass(&self, pass: u32, shutdown: &CancellationToken) -> Result<bool> {
        let exe = std::env::current_exe()?;
        let mut children: Vec<(u32, Child)> = Vec::new();

        for worker_id in 1..=self.workers {
            let spawn = Command::new(&exe)
                .arg("worker")
                .arg("--ledger")
                .arg(&self.config.ledger_path)
                .arg("--worker-id")
                .arg(worker_id.to_string())
                .arg("--port-base")
                .arg(self.config.port_range_start(worker_id).to_string())
                .spawn();
            match spawn {
                Ok(child) => {
                    tracing::info!(worker_id, pass, pid = ?child.id(), "Worker spawned");
                    children.push((worker_id, child));
                }
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "Could not spawn worker");
                    for (_, child) in &children {
                        if let Some(pid) = child.id() {
                            send_sigterm(pid);
                        }
                    }
                    self.await_children(children, shutdown).await?;
                    return Err(e.into());
                }
            }
        }

        self.await_children(children, shutdown).await
    }

    /// Wait for every child. On shutdown, forward SIGTERM to the
    /// still-running workers, then give each a bounded grace period
    /// before killing it.
    async fn await_children(
        &self,
        mut children: Vec<(u32, Child)>,
        shutdown: &CancellationToken,
    ) -> Result<bool> {
        let pids: Vec<Option<u32>> = children.iter().map(|(_, c)| c.id()).collect();
        let mut shutdown_hit = false;

        for i in 0..children.len() {
            let grace = self.config.worker_grace;
            if shutdown_hit {
                let (worker_id, child) = &mut children[i];
                wait_bounded(*worker_id, child, grace).await;
                continue;
            }
            let (worker_id, child) = &mut children[i];
            tokio::select! {
                _ = shutdown.cancelled() => {
                    shutdown_hit = true;
                    tracing::info!("Shutdown signaled, stopping workers");
                    for pid in pids.iter().skip(i).flatten() {
                        send_sigterm(*pid);
                    }
                    wait_bounded(*worker_id, child, grace).await;
                }
                status = child.wait() => match status {
                    Ok(status) => {
                        tracing::info!(worker_id = *worker_id, code = ?status.code(), "Worker exited")
                    }
                    Err(e) => {
                        tracing::warn!(worker_id = *worker_id, error = %e, "Worker wait failed")
                    }
                },
            }
        }
        Ok(shutdown_hit)
    }

    async fn store_call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&JobStore) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| DroverError::Internal(format!("store task panicked: {e}")))?
    }
}

async fn wait_bounded(worker_id: u32, child: &mut Child, grace: Duration) {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(worker_id, code = ?status.code(), "Worker exited")
        }
        Ok(Err(e)) => tracing::warn!(worker_id, error = %e, "Worker wait failed"),
        Err(_) => {
            tracing::warn!(worker_id, "Worker did not exit within grace period, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(worker_id, error = %e, "Could not kill worker");
            }
        }
    }
}

fn send_sigterm(pid: u32) {
    // SAFETY: sending a signal to a pid we recorded ourselves.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_acquire_writes_identity() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.csv");
        let guard = SessionGuard::acquire(&ledger).unwrap();
        assert_eq!(guard.record().pid, std::process::id());

        let record = read_session(&ledger).unwrap().unwrap();
        assert_eq!(record.session_id, guard.record().session_id);
    }

    #[test]
    fn test_second_session_refused_with_holder_identity() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.csv");
        let first = SessionGuard::acquire(&ledger).unwrap();

        match SessionGuard::acquire(&ledger) {
            Err(DroverError::SessionConflict { session_id, pid }) => {
                assert_eq!(session_id, first.record().session_id);
                assert_eq!(pid, std::process::id());
            }
            other => panic!("expected SessionConflict, got {other:?}"),
        }
    }

    #[test]
    fn test_release_allows_new_session() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.csv");
        let first = SessionGuard::acquire(&ledger).unwrap();
        first.release();
        let second = SessionGuard::acquire(&ledger).unwrap();
        second.release();
        assert!(read_session(&ledger).unwrap().is_none());
    }

    #[test]
    fn test_read_session_absent() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.csv");
        assert!(read_session(&ledger).unwrap().is_none());
    }
}
