use std::path::PathBuf;
use std::time::Duration;

/// Retry policy knobs shared by the job store and the pass manager.
///
/// Attempt ceilings are cumulative across passes. The per-category
/// ceilings bound retries tighter than `default_max_attempts` for error
/// classes we have less confidence in.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Per-job attempt ceiling applied when a seed does not carry its own.
    pub default_max_attempts: u32,
    /// Attempt ceiling for `infrastructure`-classified failures.
    pub infra_attempt_ceiling: u32,
    /// Attempt ceiling for unclassified failures.
    pub unknown_attempt_ceiling: u32,
    /// Delay before a `retrying` job becomes claimable again.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            infra_attempt_ceiling: 3,
            unknown_attempt_ceiling: 2,
            retry_delay: Duration::from_secs(60),
        }
    }
}

/// Configuration for one coordinator session and its workers.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Path to the ledger file (single source of truth).
    pub ledger_path: PathBuf,
    /// Maximum time to wait for the ledger lock before giving up.
    pub lock_timeout: Duration,
    /// Age after which a `claimed` row with no completion is presumed
    /// abandoned and force-released.
    pub stale_claim_age: Duration,
    /// Pause between two jobs on the same worker.
    pub inter_job_delay: Duration,
    /// Sleep between claim attempts when no work is claimable.
    pub idle_poll_interval: Duration,
    /// Consecutive empty claim attempts before a worker exits cleanly.
    pub idle_exit_after: u32,
    /// Run the stale-claim sweep once every this many worker iterations.
    pub stale_sweep_every: u32,
    /// Retry-pass ceiling for one session.
    pub max_passes: u32,
    /// How long the orchestrator waits for a signaled worker to exit
    /// before killing it.
    pub worker_grace: Duration,
    /// First port handed to worker 1; each worker gets a disjoint range.
    pub base_port: u16,
    /// Width of each worker's port range.
    pub port_stride: u16,
    pub retry: RetryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ledger_path: PathBuf::from("drover-ledger.csv"),
            lock_timeout: Duration::from_secs(30),
            stale_claim_age: Duration::from_secs(600),
            inter_job_delay: Duration::from_secs(2),
            idle_poll_interval: Duration::from_secs(5),
            idle_exit_after: 3,
            stale_sweep_every: 10,
            max_passes: 3,
            worker_grace: Duration::from_secs(30),
            base_port: 5000,
            port_stride: 10,
            retry: RetryPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn new(ledger_path: PathBuf) -> Self {
        Self {
            ledger_path,
            ..Default::default()
        }
    }

    /// Apply `DROVER_*` environment overrides on top of the current values.
    ///
    /// Unparseable values are ignored in favor of the existing setting.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(secs) = env_u64("DROVER_LOCK_TIMEOUT_SECS") {
            self.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("DROVER_STALE_CLAIM_SECS") {
            self.stale_claim_age = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("DROVER_INTER_JOB_DELAY_SECS") {
            self.inter_job_delay = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("DROVER_MAX_PASSES") {
            self.max_passes = n as u32;
        }
        if let Some(secs) = env_u64("DROVER_RETRY_DELAY_SECS") {
            self.retry.retry_delay = Duration::from_secs(secs);
        }
        self
    }

    /// Inclusive start of the port range reserved for a worker.
    pub fn port_range_start(&self, worker_id: u32) -> u16 {
        self.base_port
            .saturating_add(self.port_stride.saturating_mul(worker_id.saturating_sub(1) as u16))
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}
