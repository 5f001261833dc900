//! Live log events emitted while a runner streams.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of log event from an agent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEventKind {
    /// Agent is calling a tool
    ToolCall,
    /// Tool returned output
    ToolOutput,
    /// Agent produced a text response
    Text,
    /// Agent or runner encountered an error
    Error,
    /// Engine-originated message (start/stop, downgrade notes)
    System,
}

/// A log event from agent execution, tagged with the run it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: LogEventKind,
    /// Run id this event belongs to (None for engine-wide events)
    pub run_id: Option<String>,
    /// Short summary (e.g., "Read src/orders.rs")
    pub summary: String,
    /// Tool name if this is a tool event
    pub tool_name: Option<String>,
}

impl LogEvent {
    pub fn new(kind: LogEventKind, summary: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            run_id: None,
            summary: summary.into(),
            tool_name: None,
        }
    }

    pub fn for_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn tool_call(tool_name: impl Into<String>, summary: impl Into<String>) -> Self {
        let mut event = Self::new(LogEventKind::ToolCall, summary);
        event.tool_name = Some(tool_name.into());
        event
    }

    pub fn tool_output(tool_name: impl Into<String>, summary: impl Into<String>) -> Self {
        let mut event = Self::new(LogEventKind::ToolOutput, summary);
        event.tool_name = Some(tool_name.into());
        event
    }

    pub fn text(summary: impl Into<String>) -> Self {
        Self::new(LogEventKind::Text, summary)
    }

    pub fn error(summary: impl Into<String>) -> Self {
        Self::new(LogEventKind::Error, summary)
    }

    pub fn system(summary: impl Into<String>) -> Self {
        Self::new(LogEventKind::System, summary)
    }
}
