//! Display-output truncation and parallel aggregation.

use std::path::Path;

use crate::domain::{StepResult, Truncation};

/// Byte and line caps applied to the final display output. Whichever limit
/// triggers first wins; the head slice is kept.
#[derive(Debug, Clone, Copy)]
pub struct OutputLimits {
    pub max_bytes: usize,
    pub max_lines: usize,
}

pub const DEFAULT_MAX_BYTES: usize = 200 * 1024;
pub const DEFAULT_MAX_LINES: usize = 5000;

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            max_lines: DEFAULT_MAX_LINES,
        }
    }
}

impl OutputLimits {
    pub fn with_byte_cap(max_bytes: Option<usize>) -> Self {
        Self {
            max_bytes: max_bytes.unwrap_or(DEFAULT_MAX_BYTES),
            max_lines: DEFAULT_MAX_LINES,
        }
    }
}

/// Truncate `text` for display. The untruncated body is expected to already
/// be on disk at `saved_to` (the output artifact); the marker points there.
pub fn truncate_display(
    text: &str,
    limits: &OutputLimits,
    saved_to: Option<&Path>,
) -> (String, Option<Truncation>) {
    let line_cut = byte_index_of_line(text, limits.max_lines);
    let byte_cut = floor_char_boundary(text, limits.max_bytes);

    let (cut, reason) = match (line_cut, byte_cut < text.len()) {
        (Some(lc), true) => {
            if lc <= byte_cut {
                (lc, format!("{} lines", limits.max_lines))
            } else {
                (byte_cut, format!("{} bytes", limits.max_bytes))
            }
        }
        (Some(lc), false) => (lc, format!("{} lines", limits.max_lines)),
        (None, true) => (byte_cut, format!("{} bytes", limits.max_bytes)),
        (None, false) => return (text.to_string(), None),
    };

    let mut display = text[..cut].to_string();
    let marker = match saved_to {
        Some(path) => format!("\n…truncated at {}, see {}", reason, path.display()),
        None => format!("\n…truncated at {}", reason),
    };
    display.push_str(&marker);

    let truncation = Truncation {
        was_truncated: true,
        reason,
        saved_to: saved_to.map(|p| p.to_path_buf()),
    };
    (display, Some(truncation))
}

/// Byte index just after `max_lines` lines, or None if the text is shorter.
fn byte_index_of_line(text: &str, max_lines: usize) -> Option<usize> {
    if max_lines == 0 {
        return Some(0);
    }
    let mut seen = 0usize;
    for (idx, byte) in text.bytes().enumerate() {
        if byte == b'\n' {
            seen += 1;
            if seen == max_lines {
                // Keep the trailing newline out of the head slice.
                return if idx + 1 < text.len() { Some(idx) } else { None };
            }
        }
    }
    None
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut i = index;
    while i > 0 && !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Body text for one task inside an aggregate block.
fn block_body(result: &StepResult) -> String {
    if result.was_skipped() {
        return StepResult::SKIPPED_BODY.to_string();
    }
    if result.exit_code != 0 {
        let mut body = format!("⚠️ FAILED (exit code {})", result.exit_code);
        if let Some(error) = &result.error {
            body.push_str(": ");
            body.push_str(error);
        }
        return body;
    }
    if result.output.trim().is_empty() && result.output_file.is_none() {
        return "⚠️ EMPTY OUTPUT".to_string();
    }
    result.output.clone()
}

/// Concatenate results into `=== <label> i (agent) ===` blocks, in input
/// order. `label` is "Task" for top-level parallel and "Parallel Task" for
/// groups inside a chain.
pub fn aggregate_blocks(results: &[StepResult], label: &str) -> String {
    let mut out = String::new();
    for (i, result) in results.iter().enumerate() {
        if i > 0 {
            out.push_str("\n\n");
        }
        out.push_str(&format!(
            "=== {} {} ({}) ===\n{}",
            label,
            i + 1,
            result.agent,
            block_body(result)
        ));
    }
    out
}
