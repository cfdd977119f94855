//! The job store: atomic read-modify-write operations over the ledger.
//!
//! Every public method is exactly one locked transaction. No state is
//! held in memory between calls; each operation re-reads the full row
//! set under the lock, applies its transform, and atomically replaces
//! the file. Processes treat each other as fully untrusted concurrents;
//! the lock is the only thing serializing them.
//!
//! - [`JobStore::seed`]: idempotent insertion of new rows
//! - [`JobStore::claim_next`]: deterministic scan-order claiming
//! - [`JobStore::verify_claim`]: pre-execution re-check + duplicate suppression
//! - [`JobStore::update_status`]: terminal/retry transitions
//! - [`JobStore::release_stale_claims`]: crash recovery sweep
//! - [`JobStore::reset_for_retry`]: pass-manager requeue
//! - [`JobStore::stats`]: per-status and per-category counts

pub mod lock;

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::classify::classify;
use crate::config::RetryPolicy;
use crate::error::{DroverError, Result};
use crate::ledger::{ErrorCategory, Job, JobStatus};
use lock::LockManager;

/// Outcome a worker reports for one completed execution attempt.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Success,
    Failed { error: String },
    Skipped { reason: String },
}

/// Result of re-checking a claim immediately before execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimVerdict {
    Valid,
    /// The claim no longer belongs to this worker (stale-released or
    /// reassigned). Nothing to clean up.
    Lost { reason: String },
    /// Another row already recorded a success for the same
    /// subject+payload; executing would duplicate external side effects.
    Duplicate { reason: String },
}

/// Counts by status, with failed rows broken out by category so an
/// operator can tell permanently-dead from will-be-retried.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub pending: usize,
    pub claimed: usize,
    pub success: usize,
    pub failed: usize,
    pub retrying: usize,
    pub skipped: usize,
    pub failed_account: usize,
    pub failed_infrastructure: usize,
    pub failed_unknown: usize,
}

impl LedgerStats {
    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.success + self.failed + self.retrying + self.skipped
    }

    /// No row can make further progress without a pass reset.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.claimed == 0 && self.retrying == 0
    }
}

#[derive(Debug, Clone)]
pub struct JobStore {
    lock: LockManager,
    policy: RetryPolicy,
}

impl JobStore {
    pub fn new(lock: LockManager, policy: RetryPolicy) -> Self {
        Self { lock, policy }
    }

    pub fn ledger_path(&self) -> &std::path::Path {
        self.lock.ledger_path()
    }

    /// Insert rows whose `job_id` is not already present. Returns the
    /// number inserted. Seeds are validated before the transaction ever
    /// opens; a job missing a required column never reaches the file.
    pub fn seed(&self, jobs: Vec<Job>) -> Result<usize> {
        for job in &jobs {
            validate_seed(job)?;
        }
        self.lock.with_exclusive_lock(move |mut rows| {
            let existing: HashSet<String> = rows.iter().map(|j| j.job_id.clone()).collect();
            let mut inserted = 0;
            for job in jobs {
                if existing.contains(&job.job_id) {
                    continue;
                }
                rows.push(job);
                inserted += 1;
            }
            if inserted == 0 {
                return Ok((None, 0));
            }
            Ok((Some(rows), inserted))
        })
    }

    /// Claim the first eligible row in ledger order.
    ///
    /// Eligible means `pending`, or `retrying` with `retry_at` in the
    /// past, and no live claim on the same subject. The left-to-right
    /// scan gives a stable, auditable claim order.
    pub fn claim_next(&self, worker_id: u32) -> Result<Option<Job>> {
        self.lock.with_exclusive_lock(move |mut rows| {
            let now = Utc::now();
            let claimed_subjects: HashSet<&str> = rows
                .iter()
                .filter(|j| j.status == JobStatus::Claimed)
                .map(|j| j.subject.as_str())
                .collect();

            let index = rows
                .iter()
                .position(|j| j.is_claimable(now, &claimed_subjects));
            match index {
                Some(i) => {
                    rows[i].claim(worker_id, now);
                    let job = rows[i].clone();
                    tracing::debug!(job_id = %job.job_id, worker_id, "Job claimed");
                    Ok((Some(rows), Some(job)))
                }
                None => Ok((None, None)),
            }
        })
    }

    /// Re-check a claim immediately before the executor performs any
    /// externally-visible side effect. Closes the race window between
    /// claim and execution start.
    pub fn verify_claim(&self, job_id: &str, worker_id: u32) -> Result<ClaimVerdict> {
        let job_id = job_id.to_string();
        self.lock.with_exclusive_lock(move |rows| {
            let job = match rows.iter().find(|j| j.job_id == job_id) {
                Some(j) => j,
                None => {
                    return Ok((
                        None,
                        ClaimVerdict::Lost {
                            reason: format!("job {job_id} no longer in ledger"),
                        },
                    ))
                }
            };
            if !job.is_claimed_by(worker_id) {
                return Ok((
                    None,
                    ClaimVerdict::Lost {
                        reason: format!(
                            "job {} is {} (worker {:?}), not claimed by worker {}",
                            job.job_id, job.status, job.worker_id, worker_id
                        ),
                    },
                ));
            }
            let duplicate = rows.iter().find(|other| {
                other.job_id != job.job_id
                    && other.status == JobStatus::Success
                    && other.subject == job.subject
                    && other.payload_path == job.payload_path
                    && other.payload_text == job.payload_text
            });
            if let Some(other) = duplicate {
                return Ok((
                    None,
                    ClaimVerdict::Duplicate {
                        reason: format!(
                            "job {} already succeeded for subject {} with the same payload",
                            other.job_id, other.subject
                        ),
                    },
                ));
            }
            Ok((None, ClaimVerdict::Valid))
        })
    }

    /// Apply the outcome of one completed execution attempt and return
    /// the status the row ended up in.
    ///
    /// On failure the attempt counter is incremented, the raw error is
    /// classified, and the row goes to `retrying` (with `retry_at` set)
    /// or terminal `failed` based on category and attempt budget.
    pub fn update_status(
        &self,
        job_id: &str,
        worker_id: u32,
        outcome: JobOutcome,
    ) -> Result<JobStatus> {
        let job_id = job_id.to_string();
        let policy = self.policy.clone();
        self.lock.with_exclusive_lock(move |mut rows| {
            let job = rows
                .iter_mut()
                .find(|j| j.job_id == job_id)
                .ok_or_else(|| DroverError::JobNotFound(job_id.clone()))?;
            if !job.is_claimed_by(worker_id) {
                // The claim was stale-released while we executed. Record
                // nothing; the row is already back in circulation.
                tracing::warn!(
                    job_id = %job.job_id,
                    worker_id,
                    status = %job.status,
                    "Dropping outcome report for a claim this worker no longer holds"
                );
                return Ok((None, job.status));
            }

            let now = Utc::now();
            match outcome {
                JobOutcome::Success => {
                    job.status = JobStatus::Success;
                    job.worker_id = None;
                    job.completed_at = Some(now);
                    job.error.clear();
                    job.error_type.clear();
                    job.error_category = None;
                    job.retry_at = None;
                }
                JobOutcome::Skipped { reason } => {
                    job.status = JobStatus::Skipped;
                    job.worker_id = None;
                    job.completed_at = Some(now);
                    job.error = reason;
                }
                JobOutcome::Failed { error } => {
                    job.attempts += 1;
                    let (category, error_type) = classify(&error);
                    job.error = error;
                    job.error_type = error_type.to_string();
                    job.error_category = Some(category);
                    job.worker_id = None;
                    job.completed_at = Some(now);

                    if should_retry(job, category, &policy) {
                        job.status = JobStatus::Retrying;
                        job.retry_at = Some(
                            now + chrono::Duration::from_std(policy.retry_delay)
                                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
                        );
                    } else {
                        job.status = JobStatus::Failed;
                        job.retry_at = None;
                    }
                }
            }
            let status = job.status;
            tracing::info!(job_id = %job.job_id, status = %status, attempts = job.attempts, "Job outcome recorded");
            Ok((Some(rows), status))
        })
    }

    /// Best-effort return of an interrupted claim to `pending` without
    /// burning an attempt. Used on the worker shutdown path; a claim
    /// that never gets here is picked up by the stale sweep instead.
    pub fn release_claim(&self, job_id: &str, worker_id: u32) -> Result<bool> {
        let job_id = job_id.to_string();
        self.lock.with_exclusive_lock(move |mut rows| {
            let job = match rows.iter_mut().find(|j| j.job_id == job_id) {
                Some(j) if j.is_claimed_by(worker_id) => j,
                _ => return Ok((None, false)),
            };
            job.release();
            tracing::info!(job_id = %job_id, worker_id, "Claim released");
            Ok((Some(rows), true))
        })
    }

    /// Reset `claimed` rows older than `max_age` back to `pending`.
    ///
    /// This is the crash-recovery mechanism: a worker that died mid-job
    /// leaves its claim here to be reclaimed rather than stuck forever.
    /// An owner that is merely wedged is treated the same once the age
    /// elapses; the resulting double-execution risk is accepted.
    pub fn release_stale_claims(&self, max_age: Duration) -> Result<usize> {
        self.lock.with_exclusive_lock(move |mut rows| {
            let age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
            let cutoff = Utc::now()
                .checked_sub_signed(age)
                .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
            let mut released = 0;
            for job in rows.iter_mut() {
                if job.status != JobStatus::Claimed {
                    continue;
                }
                let expired = job.claimed_at.map_or(true, |at| at <= cutoff);
                if expired {
                    tracing::warn!(
                        job_id = %job.job_id,
                        worker_id = ?job.worker_id,
                        claimed_at = ?job.claimed_at,
                        "Releasing stale claim"
                    );
                    job.release();
                    released += 1;
                }
            }
            if released == 0 {
                return Ok((None, 0));
            }
            Ok((Some(rows), released))
        })
    }

    /// Requeue failed/retrying rows for another pass, stamping
    /// `pass_number`. Returns the number reset.
    ///
    /// Normal eligibility: category is not `account` and the attempt
    /// budget (per-job ceiling and per-category sub-ceiling) still has
    /// room. `include_non_retryable` is the operator override behind
    /// `reset-failed --include-non-retryable`; it requeues `account`
    /// rows too and resets their attempt counters.
    pub fn reset_for_retry(&self, pass_number: u32, include_non_retryable: bool) -> Result<usize> {
        let policy = self.policy.clone();
        self.lock.with_exclusive_lock(move |mut rows| {
            let mut reset = 0;
            for job in rows.iter_mut() {
                if !matches!(job.status, JobStatus::Failed | JobStatus::Retrying) {
                    continue;
                }
                let category = job.error_category.unwrap_or(ErrorCategory::Unknown);
                if include_non_retryable {
                    job.attempts = 0;
                } else if category == ErrorCategory::Account
                    || !has_attempt_budget(job, category, &policy)
                {
                    continue;
                }
                job.status = JobStatus::Pending;
                job.worker_id = None;
                job.claimed_at = None;
                job.retry_at = None;
                job.error.clear();
                job.error_type.clear();
                job.error_category = None;
                job.pass_number = pass_number;
                reset += 1;
            }
            if reset == 0 {
                return Ok((None, 0));
            }
            Ok((Some(rows), reset))
        })
    }

    /// Highest pass number stamped on any row; 0 for a fresh ledger.
    /// Lets an operator reset pick the next pass without a session.
    pub fn max_pass_number(&self) -> Result<u32> {
        self.lock.with_exclusive_lock(|rows| {
            Ok((None, rows.iter().map(|j| j.pass_number).max().unwrap_or(0)))
        })
    }

    pub fn stats(&self) -> Result<LedgerStats> {
        self.lock.with_exclusive_lock(|rows| {
            let mut stats = LedgerStats::default();
            for job in &rows {
                match job.status {
                    JobStatus::Pending => stats.pending += 1,
                    JobStatus::Claimed => stats.claimed += 1,
                    JobStatus::Success => stats.success += 1,
                    JobStatus::Retrying => stats.retrying += 1,
                    JobStatus::Skipped => stats.skipped += 1,
                    JobStatus::Failed => {
                        stats.failed += 1;
                        match job.error_category {
                            Some(ErrorCategory::Account) => stats.failed_account += 1,
                            Some(ErrorCategory::Infrastructure) => {
                                stats.failed_infrastructure += 1
                            }
                            Some(ErrorCategory::Unknown) | None => stats.failed_unknown += 1,
                        }
                    }
                }
            }
            Ok((None, stats))
        })
    }
}

/// Whether a just-failed job still has room to retry under the per-job
/// ceiling and the category sub-ceiling. `account` never retries.
fn should_retry(job: &Job, category: ErrorCategory, policy: &RetryPolicy) -> bool {
    category != ErrorCategory::Account && has_attempt_budget(job, category, policy)
}

fn has_attempt_budget(job: &Job, category: ErrorCategory, policy: &RetryPolicy) -> bool {
    if job.attempts >= job.max_attempts {
        return false;
    }
    let ceiling = match category {
        ErrorCategory::Account => return false,
        ErrorCategory::Infrastructure => policy.infra_attempt_ceiling,
        ErrorCategory::Unknown => policy.unknown_attempt_ceiling,
    };
    job.attempts < ceiling
}

fn validate_seed(job: &Job) -> Result<()> {
    if job.job_id.is_empty() {
        return Err(DroverError::InvalidSeed("empty job_id".into()));
    }
    if job.subject.is_empty() {
        return Err(DroverError::InvalidSeed(format!(
            "job {} has no subject",
            job.job_id
        )));
    }
    if job.max_attempts == 0 {
        return Err(DroverError::InvalidSeed(format!(
            "job {} has max_attempts = 0",
            job.job_id
        )));
    }
    if job.status != JobStatus::Pending || job.attempts != 0 || job.pass_number != 0 {
        return Err(DroverError::InvalidSeed(format!(
            "job {} is not a pristine pending row",
            job.job_id
        )));
    }
    Ok(())
}
