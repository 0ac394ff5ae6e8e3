//! Run report persistence.
//!
//! Every run writes the JSON-serialized list of task results to a
//! timestamped file under the user's logs directory, flushed before exit on
//! both success and abort paths.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::debug;

use crate::core::types::TaskResult;

/// OS-conventional logs directory for taskfarm.
pub fn default_log_dir() -> Option<PathBuf> {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|dir| dir.join("taskfarm").join("logs"))
}

/// Write the run log and return its path. The file name embeds a UTC
/// timestamp so reruns never collide.
pub fn write_run_log(dir: &Path, results: &[TaskResult]) -> Result<PathBuf> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
    let path = dir.join(format!("run-{stamp}.json"));
    let mut buf = serde_json::to_string_pretty(results).context("serialize run log")?;
    buf.push('\n');
    write_atomic(&path, &buf)?;
    debug!(path = %path.display(), results = results.len(), "run log written");
    Ok(path)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("log path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp log {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace log {}", path.display()))?;
    Ok(())
}
