//! On-disk codec for the ledger file.
//!
//! The format is CSV with a fixed header naming every column of
//! [`Job`](super::Job). Readers validate the header exactly and fail
//! loudly on mismatch rather than silently dropping columns; that is the
//! guard against a writer drifting away from the schema.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::error::{DroverError, Result};
use crate::ledger::Job;

/// Every column, in row order. Must stay in sync with the field order of
/// [`Job`].
pub const HEADER: [&str; 15] = [
    "job_id",
    "subject",
    "payload_path",
    "payload_text",
    "status",
    "worker_id",
    "claimed_at",
    "completed_at",
    "error",
    "error_type",
    "error_category",
    "attempts",
    "max_attempts",
    "retry_at",
    "pass_number",
];

/// Create the ledger with a bare header row if it does not exist yet.
pub fn ensure_exists(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    write_atomic(path, &[])
}

/// Read and validate the full row set.
pub fn read_rows(path: &Path) -> Result<Vec<Job>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)?;

    let found: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if found != HEADER {
        return Err(DroverError::SchemaMismatch {
            expected: HEADER.iter().map(|s| s.to_string()).collect(),
            found,
        });
    }

    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

/// Replace the entire ledger in one atomic step: write a sibling temp
/// file, fsync it, rename over the target, fsync the directory. A crash
/// at any point leaves either the old file or the new one, never a
/// half-written mix.
pub fn write_atomic(path: &Path, rows: &[Job]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DroverError::Internal(format!("bad ledger path: {}", path.display())))?;
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp.{}", std::process::id()));

    let tmp = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(tmp);
    writer.write_record(HEADER)?;
    for row in rows {
        writer.serialize(row)?;
    }
    let mut tmp = writer
        .into_inner()
        .map_err(|e| DroverError::Internal(format!("flushing ledger temp file: {e}")))?;
    tmp.flush()?;
    tmp.sync_all()?;
    drop(tmp);

    std::fs::rename(&tmp_path, path)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            // Make the rename itself durable.
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}
