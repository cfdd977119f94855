use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::ledger::Job;

/// What one execution attempt produced. `error` carries the raw message
/// handed to the classifier; empty on success.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub error: String,
}

impl ExecutionOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: String::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

/// The opaque unit of work executed once a job is claimed.
///
/// Implementations must not let any internal failure escape: every
/// error becomes `ExecutionOutcome::failure`, never a panic or an `Err`
/// crossing this boundary.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> ExecutionOutcome;
}

/// Runs the job's payload text as a shell command.
///
/// The payload path, subject, and the worker's reserved port range are
/// exported through the environment so the command can reach its inputs
/// without argument plumbing.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    env: Vec<(String, String)>,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self { env: Vec::new() }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    async fn execute(&self, job: &Job) -> ExecutionOutcome {
        tracing::info!(job_id = %job.job_id, subject = %job.subject, "Executing job");

        let result = Command::new("sh")
            .arg("-c")
            .arg(&job.payload_text)
            .env("DROVER_JOB_ID", &job.job_id)
            .env("DROVER_SUBJECT", &job.subject)
            .env("DROVER_PAYLOAD_PATH", &job.payload_path)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match result {
            Ok(output) => {
                if output.status.success() {
                    return ExecutionOutcome::ok();
                }
                let stderr = String::from_utf8_lossy(&output.stderr);
                let message = if stderr.trim().is_empty() {
                    format!("exit code: {:?}", output.status.code())
                } else {
                    stderr.trim().to_string()
                };
                ExecutionOutcome::failure(message)
            }
            Err(e) => ExecutionOutcome::failure(format!("failed to spawn task: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_command(command: &str) -> Job {
        Job::seeded(
            "j1".into(),
            "alice".into(),
            "/tmp/payload".into(),
            command.into(),
            3,
        )
    }

    #[tokio::test]
    async fn test_successful_command() {
        let outcome = ShellExecutor::new().execute(&job_with_command("true")).await;
        assert!(outcome.success);
        assert!(outcome.error.is_empty());
    }

    #[tokio::test]
    async fn test_failing_command_captures_stderr() {
        let outcome = ShellExecutor::new()
            .execute(&job_with_command("echo 'device offline' >&2; exit 1"))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.error, "device offline");
    }

    #[tokio::test]
    async fn test_failure_without_stderr_reports_exit_code() {
        let outcome = ShellExecutor::new().execute(&job_with_command("exit 3")).await;
        assert!(!outcome.success);
        assert!(outcome.error.contains("exit code"));
    }

    #[tokio::test]
    async fn test_payload_exposed_via_environment() {
        let outcome = ShellExecutor::new()
            .execute(&job_with_command(
                "test \"$DROVER_SUBJECT\" = alice && test \"$DROVER_PAYLOAD_PATH\" = /tmp/payload",
            ))
            .await;
        assert!(outcome.success);
    }
}
