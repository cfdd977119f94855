use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Claimed,
    Success,
    Failed,
    Retrying,
    Skipped,
}

impl JobStatus {
    /// Terminal states are never left except by an explicit pass reset
    /// (`failed` only).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed | JobStatus::Skipped)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Claimed => write!(f, "claimed"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Retrying => write!(f, "retrying"),
            JobStatus::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Permanent, subject-level. Never retried.
    Account,
    /// Transient environment/dependency trouble. Retried up to its ceiling.
    Infrastructure,
    /// Unclassified. Retried conservatively, logged for pattern improvement.
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Account => write!(f, "account"),
            ErrorCategory::Infrastructure => write!(f, "infrastructure"),
            ErrorCategory::Unknown => write!(f, "unknown"),
        }
    }
}

/// One row of the ledger.
///
/// Field order here is the ledger column order; the header in
/// [`crate::ledger::file`] must list every field by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub subject: String,
    pub payload_path: String,
    pub payload_text: String,
    pub status: JobStatus,
    pub worker_id: Option<u32>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: String,
    pub error_type: String,
    pub error_category: Option<ErrorCategory>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub retry_at: Option<DateTime<Utc>>,
    pub pass_number: u32,
}

impl Job {
    /// A freshly seeded row. Every column is populated; `pass_number`
    /// starts at 0 so later passes can be distinguished from the seed.
    pub fn seeded(
        job_id: String,
        subject: String,
        payload_path: String,
        payload_text: String,
        max_attempts: u32,
    ) -> Self {
        Self {
            job_id,
            subject,
            payload_path,
            payload_text,
            status: JobStatus::Pending,
            worker_id: None,
            claimed_at: None,
            completed_at: None,
            error: String::new(),
            error_type: String::new(),
            error_category: None,
            attempts: 0,
            max_attempts,
            retry_at: None,
            pass_number: 0,
        }
    }

    /// Whether this row may be handed to a worker right now.
    ///
    /// `claimed_subjects` holds subjects that already have a live claim;
    /// at most one claimed row per subject may exist at any instant.
    pub fn is_claimable(
        &self,
        now: DateTime<Utc>,
        claimed_subjects: &std::collections::HashSet<&str>,
    ) -> bool {
        if claimed_subjects.contains(self.subject.as_str()) {
            return false;
        }
        match self.status {
            JobStatus::Pending => true,
            JobStatus::Retrying => self.retry_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    /// Record a claim by `worker_id`.
    pub fn claim(&mut self, worker_id: u32, now: DateTime<Utc>) {
        self.status = JobStatus::Claimed;
        self.worker_id = Some(worker_id);
        self.claimed_at = Some(now);
        self.retry_at = None;
    }

    /// Return an interrupted or abandoned claim to the pool without
    /// burning an attempt.
    pub fn release(&mut self) {
        self.status = JobStatus::Pending;
        self.worker_id = None;
        self.claimed_at = None;
    }

    pub fn is_claimed_by(&self, worker_id: u32) -> bool {
        self.status == JobStatus::Claimed && self.worker_id == Some(worker_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn job(status: JobStatus) -> Job {
        let mut j = Job::seeded(
            "j1".into(),
            "alice".into(),
            String::new(),
            "do the thing".into(),
            3,
        );
        j.status = status;
        j
    }

    #[test]
    fn test_pending_is_claimable() {
        let j = job(JobStatus::Pending);
        assert!(j.is_claimable(Utc::now(), &HashSet::new()));
    }

    #[test]
    fn test_claimed_subject_blocks_claim() {
        let j = job(JobStatus::Pending);
        let mut subjects = HashSet::new();
        subjects.insert("alice");
        assert!(!j.is_claimable(Utc::now(), &subjects));
    }

    #[test]
    fn test_retrying_respects_retry_at() {
        let mut j = job(JobStatus::Retrying);
        let now = Utc::now();
        j.retry_at = Some(now + chrono::Duration::seconds(60));
        assert!(!j.is_claimable(now, &HashSet::new()));
        j.retry_at = Some(now - chrono::Duration::seconds(1));
        assert!(j.is_claimable(now, &HashSet::new()));
    }

    #[test]
    fn test_terminal_states_not_claimable() {
        for status in [JobStatus::Success, JobStatus::Failed, JobStatus::Skipped] {
            assert!(status.is_terminal());
            assert!(!job(status).is_claimable(Utc::now(), &HashSet::new()));
        }
    }

    #[test]
    fn test_release_clears_owner_fields() {
        let mut j = job(JobStatus::Pending);
        j.claim(4, Utc::now());
        assert!(j.is_claimed_by(4));
        j.release();
        assert_eq!(j.status, JobStatus::Pending);
        assert!(j.worker_id.is_none());
        assert!(j.claimed_at.is_none());
    }
}
