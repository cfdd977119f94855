use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DroverError {
    #[error("Timed out waiting for ledger lock {path} after {elapsed_secs}s")]
    LockTimeout { path: PathBuf, elapsed_secs: u64 },

    #[error("Ledger header mismatch: expected {expected:?}, found {found:?}")]
    SchemaMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid seed: {0}")]
    InvalidSeed(String),

    #[error("Session {session_id} (pid {pid}) already owns this ledger")]
    SessionConflict { session_id: String, pid: u32 },

    #[error("Ledger format error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DroverError>;
