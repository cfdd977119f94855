//! Seeding: turning an external description of work into ledger rows.
//!
//! The seeding step is an external collaborator as far as coordination
//! is concerned; the store only requires that every produced row is
//! fully populated before it reaches the file. Re-seeding with an
//! overlapping manifest is safe: insertion is keyed by `job_id`.

use std::path::PathBuf;

use serde::Deserialize;

use crate::config::RetryPolicy;
use crate::error::{DroverError, Result};
use crate::ledger::Job;

/// One entry of a seed manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSeed {
    pub job_id: String,
    pub subject: String,
    #[serde(default)]
    pub payload_path: String,
    #[serde(default)]
    pub payload_text: String,
    /// Per-job attempt ceiling; the policy default applies when absent.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl JobSeed {
    pub fn into_job(self, policy: &RetryPolicy) -> Job {
        Job::seeded(
            self.job_id,
            self.subject,
            self.payload_path,
            self.payload_text,
            self.max_attempts.unwrap_or(policy.default_max_attempts),
        )
    }
}

/// Anything that can enumerate work items to seed.
pub trait JobSource {
    fn jobs(&self) -> Result<Vec<JobSeed>>;
}

/// Reads a JSON manifest: an array of [`JobSeed`] objects.
#[derive(Debug, Clone)]
pub struct ManifestSource {
    path: PathBuf,
}

impl ManifestSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl JobSource for ManifestSource {
    fn jobs(&self) -> Result<Vec<JobSeed>> {
        let contents = std::fs::read_to_string(&self.path).map_err(|e| {
            DroverError::InvalidSeed(format!("cannot read manifest {}: {e}", self.path.display()))
        })?;
        let seeds: Vec<JobSeed> = serde_json::from_str(&contents).map_err(|e| {
            DroverError::InvalidSeed(format!("bad manifest {}: {e}", self.path.display()))
        })?;
        Ok(seeds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_parses_and_applies_policy_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seeds.json");
        std::fs::write(
            &path,
            r#"[
                {"job_id": "j1", "subject": "alice", "payload_text": "post A"},
                {"job_id": "j2", "subject": "bob", "payload_path": "/tmp/b", "max_attempts": 5}
            ]"#,
        )
        .unwrap();

        let seeds = ManifestSource::new(path).jobs().unwrap();
        assert_eq!(seeds.len(), 2);

        let policy = RetryPolicy::default();
        let j1 = seeds[0].clone().into_job(&policy);
        let j2 = seeds[1].clone().into_job(&policy);
        assert_eq!(j1.max_attempts, policy.default_max_attempts);
        assert_eq!(j2.max_attempts, 5);
        assert_eq!(j2.payload_path, "/tmp/b");
        assert_eq!(j1.pass_number, 0);
        assert_eq!(j1.attempts, 0);
    }

    #[test]
    fn test_bad_manifest_is_a_seed_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seeds.json");
        std::fs::write(&path, "not json").unwrap();
        let err = ManifestSource::new(path).jobs().unwrap_err();
        assert!(matches!(err, DroverError::InvalidSeed(_)));
    }

    #[test]
    fn test_missing_manifest_is_a_seed_error() {
        let err = ManifestSource::new(PathBuf::from("/nonexistent/seeds.json"))
            .jobs()
            .unwrap_err();
        assert!(matches!(err, DroverError::InvalidSeed(_)));
    }
}
