//! The worker loop: claim, verify, execute, report, repeat.
//!
//! Each iteration walks an explicit state machine:
//!
//! `Idle -> Claimed -> Verifying -> Executing -> Reporting -> Idle`
//!
//! The shutdown token is checked between every state; a signaled worker
//! finishes (or releases) its current job before exiting. Executor
//! failures and panics are captured as error strings and recorded in the
//! ledger; one bad job never kills the worker process. A worker that is
//! killed outright leaves its claim for the stale sweep.
//!
//! - [`Worker`]: the loop itself
//! - [`TaskExecutor`]: the opaque unit of work invoked per claim

pub mod executor;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::CoordinatorConfig;
use crate::error::{DroverError, Result};
use crate::ledger::Job;
use crate::store::{ClaimVerdict, JobOutcome, JobStore};

pub use executor::{ExecutionOutcome, ShellExecutor, TaskExecutor};

/// Bounded internal retries for lock-timeout on store operations; only
/// after these are spent does the timeout propagate.
const LOCK_RETRIES: u32 = 3;
const LOCK_RETRY_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerSummary {
    pub executed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct Worker {
    id: u32,
    store: JobStore,
    executor: Arc<dyn TaskExecutor>,
    config: CoordinatorConfig,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        id: u32,
        store: JobStore,
        executor: Arc<dyn TaskExecutor>,
        config: CoordinatorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            store,
            executor,
            config,
            shutdown,
        }
    }

    /// Run until no claimable work remains or shutdown is signaled.
    pub async fn run(self) -> Result<WorkerSummary> {
        let mut summary = WorkerSummary::default();
        let mut idle_rounds = 0u32;
        let mut iteration = 0u32;

        tracing::info!(worker_id = self.id, "Worker started");

        loop {
            // Idle
            if self.shutdown.is_cancelled() {
                break;
            }
            if iteration % self.config.stale_sweep_every.max(1) == 0 {
                let age = self.config.stale_claim_age;
                let released = self
                    .store_call(move |s| s.release_stale_claims(age))
                    .await?;
                if released > 0 {
                    tracing::info!(worker_id = self.id, released, "Stale claims released");
                }
            }
            iteration += 1;

            // Claimed
            let worker_id = self.id;
            let job = match self.store_call(move |s| s.claim_next(worker_id)).await? {
                Some(job) => job,
                None => {
                    idle_rounds += 1;
                    if idle_rounds >= self.config.idle_exit_after {
                        tracing::info!(worker_id = self.id, "No claimable work, exiting");
                        break;
                    }
                    if self.pause(self.config.idle_poll_interval).await {
                        break;
                    }
                    continue;
                }
            };
            idle_rounds = 0;

            if self.shutdown.is_cancelled() {
                self.release_best_effort(&job).await;
                break;
            }

            // Verifying
            let verdict = {
                let job_id = job.job_id.clone();
                self.store_call(move |s| s.verify_claim(&job_id, worker_id))
                    .await?
            };
            match verdict {
                ClaimVerdict::Valid => {}
                ClaimVerdict::Lost { reason } => {
                    tracing::warn!(worker_id = self.id, job_id = %job.job_id, reason = %reason, "Claim lost before execution");
                    continue;
                }
                ClaimVerdict::Duplicate { reason } => {
                    tracing::warn!(worker_id = self.id, job_id = %job.job_id, reason = %reason, "Skipping duplicate job");
                    let job_id = job.job_id.clone();
                    self.store_call(move |s| {
                        s.update_status(
                            &job_id,
                            worker_id,
                            JobOutcome::Skipped {
                                reason: reason.clone(),
                            },
                        )
                    })
                    .await?;
                    summary.skipped += 1;
                    continue;
                }
            }

            if self.shutdown.is_cancelled() {
                self.release_best_effort(&job).await;
                break;
            }

            // Executing. Runs to completion even if shutdown fires
            // mid-job; the executor is the unit of work we never abandon
            // halfway.
            let outcome = self.execute_insulated(&job).await;

            // Reporting
            summary.executed += 1;
            let report = if outcome.success {
                summary.succeeded += 1;
                JobOutcome::Success
            } else {
                summary.failed += 1;
                JobOutcome::Failed {
                    error: outcome.error,
                }
            };
            let job_id = job.job_id.clone();
            self.store_call(move |s| s.update_status(&job_id, worker_id, report.clone()))
                .await?;

            if self.pause(self.config.inter_job_delay).await {
                break;
            }
        }

        tracing::info!(
            worker_id = self.id,
            executed = summary.executed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "Worker stopped"
        );
        Ok(summary)
    }

    /// Invoke the executor so that neither errors nor panics escape.
    /// A panic surfaces as a join error and becomes an error string.
    async fn execute_insulated(&self, job: &Job) -> ExecutionOutcome {
        let executor = self.executor.clone();
        let job = job.clone();
        match tokio::spawn(async move { executor.execute(&job).await }).await {
            Ok(outcome) => outcome,
            Err(e) => ExecutionOutcome::failure(format!("task executor panicked: {e}")),
        }
    }

    /// One best-effort release on the shutdown path. Failure here is
    /// logged, not propagated; the stale sweep is the backstop.
    async fn release_best_effort(&self, job: &Job) {
        let worker_id = self.id;
        let job_id = job.job_id.clone();
        let result = self
            .store_call(move |s| s.release_claim(&job_id, worker_id))
            .await;
        if let Err(e) = result {
            tracing::warn!(worker_id = self.id, job_id = %job.job_id, error = %e, "Could not release claim on shutdown");
        }
    }

    /// Run a store operation off the async runtime, retrying a bounded
    /// number of lock timeouts before letting one propagate.
    async fn store_call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&JobStore) -> Result<T> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let mut attempt = 0;
        loop {
            let store = self.store.clone();
            let f = f.clone();
            let result = tokio::task::spawn_blocking(move || f(&store))
                .await
                .map_err(|e| DroverError::Internal(format!("store task panicked: {e}")))?;
            match result {
                Err(DroverError::LockTimeout { path, elapsed_secs }) if attempt < LOCK_RETRIES => {
                    attempt += 1;
                    tracing::warn!(
                        worker_id = self.id,
                        attempt,
                        elapsed_secs,
                        "Ledger lock timed out, retrying"
                    );
                    if self.pause(LOCK_RETRY_PAUSE).await {
                        return Err(DroverError::LockTimeout { path, elapsed_secs });
                    }
                }
                other => return other,
            }
        }
    }

    /// Cancellable sleep. Returns true if shutdown fired.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}
