//! Artifact persistence and cleanup.
//!
//! Every run can leave three files per agent instance under the artifacts
//! directory: the resolved input task, the untruncated output, and a JSON
//! metadata record. The raw JSONL event stream is opt-in and size-capped.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Usage;

/// Raw event stream cap. Streams are abandoned, not failed, at the cap.
pub const EVENT_STREAM_CAP_BYTES: u64 = 50 * 1024 * 1024;

/// Session-scoped artifact directories older than this are swept on startup.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    /// Also persist the raw JSONL event stream.
    #[serde(default)]
    pub capture_events: bool,
}

impl ArtifactConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::new(),
            capture_events: false,
        }
    }
}

/// Metadata record written alongside input/output artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub agent: String,
    pub model: String,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub usage: Usage,
    pub skills: Vec<String>,
}

fn base_name(run_id: &str, agent: &str, index: Option<usize>) -> String {
    match index {
        Some(i) => format!("{}_{}_{}", run_id, agent, i),
        None => format!("{}_{}", run_id, agent),
    }
}

/// Path the output artifact will land at, usable before the write happens
/// (truncation markers reference it).
pub fn output_artifact_path(
    config: &ArtifactConfig,
    run_id: &str,
    agent: &str,
    index: Option<usize>,
) -> Option<PathBuf> {
    if !config.enabled {
        return None;
    }
    Some(
        config
            .dir
            .join(format!("{}_output.md", base_name(run_id, agent, index))),
    )
}

/// Write the input/output/meta artifact set for one step. Returns the paths
/// written, in a stable order.
pub fn write_step_artifacts(
    config: &ArtifactConfig,
    run_id: &str,
    agent: &str,
    index: Option<usize>,
    task: &str,
    output: &str,
    meta: &ArtifactMeta,
) -> Result<Vec<PathBuf>> {
    if !config.enabled {
        return Ok(Vec::new());
    }

    std::fs::create_dir_all(&config.dir).with_context(|| {
        format!("Failed to create artifacts dir: {}", config.dir.display())
    })?;

    let base = base_name(run_id, agent, index);
    let input_path = config.dir.join(format!("{}_input.md", base));
    let output_path = config.dir.join(format!("{}_output.md", base));
    let meta_path = config.dir.join(format!("{}_meta.json", base));

    std::fs::write(&input_path, task)
        .with_context(|| format!("Failed to write {}", input_path.display()))?;
    std::fs::write(&output_path, output)
        .with_context(|| format!("Failed to write {}", output_path.display()))?;
    let meta_json = serde_json::to_string_pretty(meta).context("Failed to serialize meta")?;
    std::fs::write(&meta_path, meta_json)
        .with_context(|| format!("Failed to write {}", meta_path.display()))?;

    Ok(vec![input_path, output_path, meta_path])
}

/// Path for the opt-in raw event stream.
pub fn event_stream_path(
    config: &ArtifactConfig,
    run_id: &str,
    agent: &str,
    index: Option<usize>,
) -> Option<PathBuf> {
    if !config.enabled || !config.capture_events {
        return None;
    }
    Some(
        config
            .dir
            .join(format!("{}_events.jsonl", base_name(run_id, agent, index))),
    )
}

/// Create a directory and verify it is actually readable and writable.
///
/// Broken ACL inheritance on some filesystems leaves a directory behind
/// that exists but rejects access; one remove-and-recreate attempt clears
/// the common case.
pub fn ensure_dir_rw(path: &Path) -> Result<()> {
    let mut last_err = None;
    for attempt in 0..2 {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;

        let probe = path.join(".probe");
        match std::fs::write(&probe, b"") {
            Ok(()) => {
                let readable = std::fs::read_dir(path).is_ok();
                let _ = std::fs::remove_file(&probe);
                if readable {
                    return Ok(());
                }
                last_err = Some(anyhow::anyhow!("directory is not readable"));
            }
            Err(e) => last_err = Some(e.into()),
        }

        if attempt == 0 {
            tracing::debug!("Recreating {} after access failure", path.display());
            let _ = std::fs::remove_dir(path);
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("directory access check failed")))
        .with_context(|| format!("{} is not read/write accessible", path.display()))
}

/// Remove subdirectories of `root` whose mtime is older than `max_age`.
/// Returns the number of directories removed. Errors on individual entries
/// are skipped; the sweep is best-effort.
pub fn sweep_stale_dirs(root: &Path, max_age: Duration) -> usize {
    let Ok(entries) = std::fs::read_dir(root) else {
        return 0;
    };
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let Ok(mtime) = meta.modified() else { continue };
        let Ok(age) = now.duration_since(mtime) else {
            continue;
        };
        if age > max_age && std::fs::remove_dir_all(&path).is_ok() {
            tracing::debug!("Swept stale dir {}", path.display());
            removed += 1;
        }
    }
    removed
}
