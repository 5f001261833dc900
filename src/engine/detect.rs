//! Trailing tool-error detection.
//!
//! A runner can exit 0 even though its final tool calls failed. The
//! heuristic: errors the agent responded to with text afterwards are
//! recovered; errors after the last text response (or with no text response
//! at all) mean the run failed. Deterministic and pure over the recorded
//! message stream.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::MessageRecord;

#[derive(Debug, Clone, Default)]
pub struct ErrorDetection {
    pub has_error: bool,
    pub reason: Option<String>,
}

/// Inspect the message stream of a run that exited 0.
pub fn detect_trailing_error(messages: &[MessageRecord]) -> ErrorDetection {
    let last_text = messages.iter().rposition(|m| match m {
        MessageRecord::Assistant { text } => !text.trim().is_empty(),
        _ => false,
    });

    // With a trailing text response, only errors after it count; with no
    // text response at all there is no recovery evidence, so the whole
    // stream is in scope.
    let scan_from = last_text.map(|i| i + 1).unwrap_or(0);

    for record in &messages[scan_from..] {
        if let MessageRecord::ToolResult {
            tool,
            content,
            is_error,
        } = record
        {
            if *is_error {
                return ErrorDetection {
                    has_error: true,
                    reason: Some(format!("tool '{}' reported an error after the last response", tool)),
                };
            }
            if is_fatal_tool_output(tool, content) {
                return ErrorDetection {
                    has_error: true,
                    reason: Some(format!("fatal pattern in '{}' output after the last response", tool)),
                };
            }
        }
    }

    ErrorDetection::default()
}

static BASH_FATAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)permission denied|command not found|\bcode\s+12[67]\b")
        .expect("invalid bash fatal pattern")
});

/// Tool-specific fatal patterns in otherwise non-error results.
fn is_fatal_tool_output(tool: &str, content: &str) -> bool {
    match tool.to_ascii_lowercase().as_str() {
        "bash" | "shell" => BASH_FATAL.is_match(content),
        _ => false,
    }
}
