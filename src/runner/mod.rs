//! Interface to the opaque runner executable.
//!
//! The runner is an external coding-agent CLI: the engine hands it a fully
//! resolved step ([`ResolvedStep`]), streams its JSONL stdout back, and
//! treats the exit code as the primary success signal.

mod command;
mod stream;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::ExtensionPolicy;

pub use command::{
    resolve_runner_binary, RunnerCommand, INLINE_TASK_LIMIT, MCP_DIRECT_TOOLS_ENV,
    MCP_NONE_SENTINEL,
};
pub use stream::{summarize_tool_call, RunnerBlock, RunnerEvent, RunnerMessage, RunnerUsage};

/// A step with every override applied: the exact model, system prompt
/// (skills injected), task (template variables and bracket instructions
/// resolved), and sandbox lists the runner will see.
///
/// Serializable because background worker inputs carry these verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedStep {
    pub agent: String,
    pub model: String,
    pub task: String,
    pub system_prompt: String,
    pub skills: Vec<String>,
    pub tools: Vec<String>,
    pub mcp_direct_tools: Option<Vec<String>>,
    pub extensions: ExtensionPolicy,
    pub output_file: Option<PathBuf>,
    pub progress: bool,
    /// Non-fatal resolution issues, copied onto the step's result.
    pub warnings: Vec<String>,
}
