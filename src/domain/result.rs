//! Results of agent execution.
//!
//! A [`StepResult`] captures one executed agent instance; [`Details`] is the
//! aggregate surfaced to the caller, covering all three modes plus the
//! management and background paths.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Token usage accumulated from the runner's event stream.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: Option<f64>,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        if let Some(cost) = other.cost_usd {
            *self.cost_usd.get_or_insert(0.0) += cost;
        }
    }
}

/// One record in the recorded message stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum MessageRecord {
    Assistant {
        text: String,
    },
    ToolCall {
        name: String,
        summary: String,
    },
    ToolResult {
        tool: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// Compact run statistics for display.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProgressSummary {
    pub tool_calls: usize,
    pub tokens: u64,
    pub duration_ms: u64,
}

/// Truncation applied to the display output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Truncation {
    pub was_truncated: bool,
    pub reason: String,
    pub saved_to: Option<PathBuf>,
}

/// Result of one executed agent instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub agent: String,
    pub model: String,
    /// Fully resolved task, including any prepended bracket instructions.
    pub task: String,
    pub messages: Vec<MessageRecord>,
    /// Display output, possibly truncated (see `truncation`).
    pub output: String,
    /// 0 success, >0 runner failure, -1 skipped by fail-fast, -2 cancelled.
    pub exit_code: i32,
    pub usage: Usage,
    pub progress: ProgressSummary,
    pub skills: Vec<String>,
    pub artifact_paths: Vec<PathBuf>,
    pub truncation: Option<Truncation>,
    pub error: Option<String>,
    /// Resolved `[Write to]` target, when one was set.
    pub output_file: Option<PathBuf>,
    pub session_file: Option<PathBuf>,
    /// Non-fatal issues (missing skills, missing declared output file).
    pub warnings: Vec<String>,
}

impl StepResult {
    pub const EXIT_SKIPPED: i32 = -1;
    pub const EXIT_CANCELLED: i32 = -2;

    /// Placeholder text used for fail-fast skipped peers.
    pub const SKIPPED_BODY: &'static str = "(skipped — fail-fast)";

    pub fn empty(agent: impl Into<String>, model: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            model: model.into(),
            task: task.into(),
            messages: Vec::new(),
            output: String::new(),
            exit_code: 0,
            usage: Usage::default(),
            progress: ProgressSummary::default(),
            skills: Vec::new(),
            artifact_paths: Vec::new(),
            truncation: None,
            error: None,
            output_file: None,
            session_file: None,
            warnings: Vec::new(),
        }
    }

    /// A peer skipped because a fail-fast sibling already failed.
    pub fn skipped(agent: impl Into<String>) -> Self {
        let mut result = Self::empty(agent, "", "");
        result.exit_code = Self::EXIT_SKIPPED;
        result.output = Self::SKIPPED_BODY.to_string();
        result
    }

    /// A run that never got past spawning the runner.
    pub fn launch_failure(
        agent: impl Into<String>,
        model: impl Into<String>,
        task: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let mut result = Self::empty(agent, model, task);
        result.exit_code = 1;
        result.error = Some(error.into());
        result
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    pub fn was_skipped(&self) -> bool {
        self.exit_code == Self::EXIT_SKIPPED
    }
}

/// Live progress for one agent slot, merged into `Details::progress`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiveAgentProgress {
    pub agent: String,
    pub tool_calls: usize,
    pub tokens: u64,
    pub last_event: Option<String>,
    pub done: bool,
}

/// Request-level failure categories. Step-level failures live on the
/// individual [`StepResult`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    DepthGuard,
    Normalization,
}

/// Artifact directory summary for the whole request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub dir: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Aggregate result surfaced to the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Details {
    /// "single" | "parallel" | "chain" | "management".
    pub mode: String,
    pub results: Vec<StepResult>,
    /// Combined display output (aggregate blocks for parallel modes).
    pub output: Option<String>,
    #[serde(default)]
    pub progress: Vec<LiveAgentProgress>,
    /// Per top-level chain step: agent name, or `"[a+b+c]"` for a group.
    #[serde(default)]
    pub chain_agents: Vec<String>,
    pub current_step_index: Option<usize>,
    pub total_steps: Option<usize>,
    pub async_id: Option<String>,
    pub async_dir: Option<PathBuf>,
    pub artifacts: Option<ArtifactSummary>,
    pub error: Option<String>,
    pub error_kind: Option<FailureKind>,
    /// Non-fatal notes, e.g. the background-to-foreground downgrade.
    pub note: Option<String>,
}

impl Details {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            mode: "error".to_string(),
            error: Some(message.into()),
            error_kind: Some(kind),
            ..Default::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.results.iter().all(|r| r.succeeded() || r.was_skipped())
    }
}
