//! Pass-level retry orchestration.
//!
//! After a full sweep of workers has exited, the pass manager inspects
//! the ledger and decides whether another pass is worth running. The
//! decision consumes the classifier's categories uniformly; neither the
//! worker nor the executor ever makes retry decisions.

use crate::error::Result;
use crate::store::JobStore;

/// Where a session stands after a completed pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Every job reached `success` or `skipped`.
    AllComplete,
    /// Failed rows remain but none are eligible for another attempt;
    /// they stay in their last failed state for operator inspection.
    OnlyNonRetryable,
    /// The pass ceiling was hit with retryable rows still on the table.
    MaxPassesReached,
    /// Eligible rows were requeued; run another pass.
    NextPass { pass_number: u32, reset: usize },
}

#[derive(Debug)]
pub struct RetryPassManager {
    store: JobStore,
    max_passes: u32,
}

impl RetryPassManager {
    pub fn new(store: JobStore, max_passes: u32) -> Self {
        Self { store, max_passes }
    }

    /// Decide what follows the pass that just completed.
    ///
    /// Eligibility for requeue is per-job: category is not `account` and
    /// the attempt budget still has room. The pass ceiling is checked
    /// first; when it is hit, remaining rows are left untouched.
    pub fn evaluate(&self, completed_pass: u32) -> Result<PassOutcome> {
        let stats = self.store.stats()?;
        if stats.failed == 0 && stats.retrying == 0 {
            return Ok(PassOutcome::AllComplete);
        }
        if completed_pass >= self.max_passes {
            tracing::warn!(
                completed_pass,
                max_passes = self.max_passes,
                failed = stats.failed,
                retrying = stats.retrying,
                "Pass ceiling reached with unfinished jobs"
            );
            return Ok(PassOutcome::MaxPassesReached);
        }

        let next_pass = completed_pass + 1;
        let reset = self.store.reset_for_retry(next_pass, false)?;
        if reset == 0 {
            return Ok(PassOutcome::OnlyNonRetryable);
        }
        tracing::info!(pass_number = next_pass, reset, "Requeued retryable jobs");
        Ok(PassOutcome::NextPass {
            pass_number: next_pass,
            reset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::ledger::Job;
    use crate::store::lock::LockManager;
    use crate::store::JobOutcome;
    use std::time::Duration;

    fn store(dir: &std::path::Path) -> JobStore {
        let lock = LockManager::new(dir.join("ledger.csv"), Duration::from_secs(5));
        JobStore::new(lock, RetryPolicy::default())
    }

    fn seed_one(store: &JobStore, job_id: &str, subject: &str) {
        store
            .seed(vec![Job::seeded(
                job_id.into(),
                subject.into(),
                String::new(),
                "t".into(),
                3,
            )])
            .unwrap();
    }

    /// Claim the next job and report a failure with the given raw
    /// message, exercising the real classification path.
    fn fail_next(store: &JobStore, message: &str) {
        let job = store.claim_next(1).unwrap().unwrap();
        store
            .update_status(
                &job.job_id,
                1,
                JobOutcome::Failed {
                    error: message.into(),
                },
            )
            .unwrap();
    }

    #[test]
    fn test_all_complete_when_nothing_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        seed_one(&store, "j1", "a");
        let job = store.claim_next(1).unwrap().unwrap();
        store
            .update_status(&job.job_id, 1, JobOutcome::Success)
            .unwrap();

        let mgr = RetryPassManager::new(store, 3);
        assert_eq!(mgr.evaluate(1).unwrap(), PassOutcome::AllComplete);
    }

    #[test]
    fn test_only_non_retryable_when_account_rows_remain() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        seed_one(&store, "j1", "a");
        fail_next(&store, "account suspended");

        let mgr = RetryPassManager::new(store, 3);
        assert_eq!(mgr.evaluate(1).unwrap(), PassOutcome::OnlyNonRetryable);
    }

    #[test]
    fn test_max_passes_reached_leaves_rows_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        seed_one(&store, "j1", "a");
        fail_next(&store, "connection timed out");

        let mgr = RetryPassManager::new(store.clone(), 3);
        assert_eq!(mgr.evaluate(3).unwrap(), PassOutcome::MaxPassesReached);
        let stats = store.stats().unwrap();
        assert_eq!(stats.retrying, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_next_pass_requeues_retryable_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        seed_one(&store, "j1", "a");
        fail_next(&store, "connection timed out");

        let mgr = RetryPassManager::new(store.clone(), 3);
        match mgr.evaluate(1).unwrap() {
            PassOutcome::NextPass { pass_number, reset } => {
                assert_eq!(pass_number, 2);
                assert_eq!(reset, 1);
            }
            other => panic!("expected NextPass, got {other:?}"),
        }
        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 1);
    }

    #[test]
    fn test_account_and_infrastructure_split_across_passes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        seed_one(&store, "j1", "a");
        seed_one(&store, "j2", "b");
        fail_next(&store, "account banned");
        fail_next(&store, "automation bridge crashed");

        let mgr = RetryPassManager::new(store.clone(), 3);
        match mgr.evaluate(1).unwrap() {
            PassOutcome::NextPass { reset, .. } => assert_eq!(reset, 1),
            other => panic!("expected NextPass, got {other:?}"),
        }
        let stats = store.stats().unwrap();
        // The infrastructure row went back to pending; the account row
        // stayed terminally failed.
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.failed_account, 1);
    }
}
