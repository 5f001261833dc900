//! Runner JSONL output stream parsing.
//!
//! The runner emits one JSON event per stdout line. Only four event types
//! matter to the engine; anything else (or any unparseable line) is ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events from the runner's stream-json output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerEvent {
    /// A completed assistant message: text and tool-call parts, plus usage.
    MessageEnd {
        #[serde(default)]
        message: RunnerMessage,
        #[serde(default)]
        usage: Option<RunnerUsage>,
    },

    ToolExecutionStart {
        #[serde(default)]
        tool_name: String,
        #[serde(default)]
        input: Value,
    },

    ToolExecutionEnd {
        #[serde(default)]
        tool_name: String,
        #[serde(default)]
        duration_ms: Option<u64>,
    },

    /// A tool result delivered back to the agent.
    ToolResultEnd {
        #[serde(default)]
        tool_name: String,
        #[serde(default)]
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// Assistant message content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerMessage {
    #[serde(default)]
    pub content: Vec<RunnerBlock>,
}

/// Content block within an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerBlock {
    Text {
        text: String,
    },
    ToolCall {
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
}

/// Token usage reported on `message_end`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunnerUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

impl RunnerEvent {
    /// Parse a JSON line into a runner event. Unknown or malformed lines
    /// yield `None` and are skipped by the caller.
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }
}

/// Format a tool call for one-line display.
pub fn summarize_tool_call(name: &str, input: &Value) -> String {
    let detail = match name {
        "Read" | "Write" | "Edit" => input.get("file_path").and_then(|v| v.as_str()),
        "Bash" => input.get("command").and_then(|v| v.as_str()),
        "Glob" | "Grep" => input.get("pattern").and_then(|v| v.as_str()),
        _ => None,
    };
    match detail {
        Some(detail) => format!("{}: {}", name, detail),
        None => name.to_string(),
    }
}
