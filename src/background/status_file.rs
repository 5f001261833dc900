//! Durable status, event, and result file IO.
//!
//! `status.json` is replaced atomically (tmp + rename) so pollers never see
//! a torn document. `events.jsonl` is append-only; each entry is one small
//! line, so appends are atomic without locks. The terminal result file is
//! written with the same tmp + rename discipline, after the terminal status.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{BackgroundStatus, TerminalResult};

pub const STATUS_FILE: &str = "status.json";
pub const EVENTS_FILE: &str = "events.jsonl";

pub fn status_path(async_dir: &Path) -> PathBuf {
    async_dir.join(STATUS_FILE)
}

pub fn step_log_path(async_dir: &Path, flat_index: usize) -> PathBuf {
    async_dir.join(format!("output-{}.log", flat_index))
}

pub fn markdown_log_path(async_dir: &Path, id: &str) -> PathBuf {
    async_dir.join(format!("subagent-log-{}.md", id))
}

/// Atomically replace `status.json`.
pub fn write_status(async_dir: &Path, status: &BackgroundStatus) -> Result<()> {
    let path = status_path(async_dir);
    let content = serde_json::to_string_pretty(status).context("Failed to serialize status")?;
    atomic_write(&path, content.as_bytes())
}

pub fn read_status(async_dir: &Path) -> Result<BackgroundStatus> {
    let path = status_path(async_dir);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// One timeline entry in `events.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Append one event line. Small writes in append mode are atomic, so
/// concurrent appenders need no lock.
pub fn append_event(async_dir: &Path, event: &str, data: serde_json::Value) -> Result<()> {
    let entry = RunEvent {
        timestamp: Utc::now(),
        event: event.to_string(),
        data,
    };
    let line = serde_json::to_string(&entry).context("Failed to serialize event")?;
    let path = async_dir.join(EVENTS_FILE);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    writeln!(file, "{}", line).with_context(|| format!("Failed to append {}", path.display()))
}

pub fn read_events(async_dir: &Path) -> Result<Vec<RunEvent>> {
    let path = async_dir.join(EVENTS_FILE);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

/// Atomically write the terminal result file. Callers must write the
/// terminal status first.
pub fn write_result(path: &Path, result: &TerminalResult) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(result).context("Failed to serialize result")?;
    atomic_write(path, content.as_bytes())
}

pub fn read_result(path: &Path) -> Result<TerminalResult> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Write to a sibling tmp file, sync, then rename over the target.
fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        file.write_all(content)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", tmp_path.display()))?;
    }
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to rename into {}", path.display()))
}
