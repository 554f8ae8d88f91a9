//! Crash-safe file writes shared by the store, the monitor, and the hook.

use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::error::{Result, TermgramError};

/// Write JSON to `path` atomically: temp file in the same directory, fsync,
/// rename over the target. A crash mid-write leaves the old file intact.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| TermgramError::State(format!("no parent dir for {}", path.display())))?;
    std::fs::create_dir_all(parent)?;

    let content = serde_json::to_string_pretty(data)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(
            ".{}.",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("state")
        ))
        .suffix(".tmp")
        .tempfile_in(parent)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| TermgramError::State(format!("rename failed: {e}")))?;
    Ok(())
}
