//! Durable status and result schemas for background jobs.
//!
//! `status.json` is the authoritative state of a detached run; the terminal
//! result file under the results root announces completion. Both are plain
//! camelCase JSON so external pollers can consume them without this crate.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Background job state machine: `queued → running → complete | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Complete,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }
}

/// Per-step state: `pending → running → complete | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Pending,
    Running,
    Complete,
    Failed,
}

/// One flattened step row in `status.json`. Parallel groups expand to one
/// row per inner task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEntry {
    pub agent: String,
    pub status: StepState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<String>,
}

impl StepEntry {
    pub fn pending(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            status: StepState::Pending,
            started_at: None,
            ended_at: None,
            duration_ms: None,
            exit_code: None,
            tokens: None,
            skills: Vec::new(),
        }
    }
}

/// The `status.json` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundStatus {
    pub run_id: String,
    pub mode: String,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub pid: u32,
    pub cwd: PathBuf,
    /// Lowest-indexed non-complete step.
    pub current_step: usize,
    pub steps: Vec<StepEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackgroundStatus {
    pub fn new(run_id: impl Into<String>, mode: impl Into<String>, cwd: PathBuf, steps: Vec<StepEntry>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            mode: mode.into(),
            state: JobState::Running,
            started_at: now,
            last_update: now,
            ended_at: None,
            pid: std::process::id(),
            cwd,
            current_step: 0,
            steps,
            total_tokens: None,
            output_file: None,
            session_dir: None,
            session_file: None,
            error: None,
        }
    }

    /// Advance `last_update`, keeping it monotonic even if the clock steps back.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.last_update {
            self.last_update = now;
        }
    }

    /// Recompute `current_step` as the lowest-indexed non-complete step.
    pub fn recompute_current_step(&mut self) {
        self.current_step = self
            .steps
            .iter()
            .position(|s| s.status != StepState::Complete)
            .unwrap_or(self.steps.len());
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// One entry in the terminal result file's `results` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEntry {
    pub agent: String,
    pub output: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifact_paths: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

/// The terminal result file written to `<resultsRoot>/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalResult {
    pub id: String,
    /// Lead agent name, or the chain's agent token list joined with `→`.
    pub agent: String,
    pub success: bool,
    pub summary: String,
    pub results: Vec<ResultEntry>,
    pub exit_code: i32,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts_dir: Option<PathBuf>,
    pub cwd: PathBuf,
    pub async_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_step_is_lowest_non_complete() {
        let mut status = BackgroundStatus::new(
            "run-1",
            "chain",
            PathBuf::from("/tmp"),
            vec![
                StepEntry::pending("a"),
                StepEntry::pending("b"),
                StepEntry::pending("c"),
            ],
        );
        status.steps[0].status = StepState::Complete;
        status.steps[1].status = StepState::Running;
        status.recompute_current_step();
        assert_eq!(status.current_step, 1);

        status.steps[1].status = StepState::Complete;
        status.steps[2].status = StepState::Complete;
        status.recompute_current_step();
        assert_eq!(status.current_step, 3);
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut status =
            BackgroundStatus::new("run-1", "single", PathBuf::from("/tmp"), vec![]);
        let before = status.last_update;
        status.touch();
        assert!(status.last_update >= before);
    }

    #[test]
    fn test_status_json_uses_camel_case() {
        let status = BackgroundStatus::new("run-1", "single", PathBuf::from("/tmp"), vec![]);
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"runId\""));
        assert!(json.contains("\"startedAt\""));
        assert!(json.contains("\"lastUpdate\""));
        assert!(json.contains("\"currentStep\""));
    }
}
