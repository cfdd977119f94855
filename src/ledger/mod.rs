//! The job ledger: one tabular file, one row per job.
//!
//! The ledger is the single source of truth for job state. No component
//! holds authoritative state in memory across operations; every read and
//! write goes through the job store's locked transactions.
//!
//! - [`Job`]: one ledger row, with its status state machine
//! - [`file`]: the on-disk codec (header validation, atomic rewrite)

pub mod file;
pub mod job;

pub use job::{ErrorCategory, Job, JobStatus};
