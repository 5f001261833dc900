//! Template variable resolution for chain steps.
//!
//! Substitution is literal and single-pass: every occurrence of a variable
//! in the source string is replaced exactly once, and replacement text is
//! never rescanned, so output containing `{task}` survives verbatim.

use crate::domain::ThinkingLevel;

pub const VAR_TASK: &str = "{task}";
pub const VAR_PREVIOUS: &str = "{previous}";
pub const VAR_CHAIN_DIR: &str = "{chain_dir}";

/// Replace each variable occurrence in `input` with its value, scanning
/// left to right over the original string only.
pub fn resolve_template(input: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while !rest.is_empty() {
        let mut earliest: Option<(usize, usize, &str)> = None;
        for (key, value) in vars {
            if key.is_empty() {
                continue;
            }
            if let Some(pos) = rest.find(key) {
                let better = match earliest {
                    Some((best_pos, _, _)) => pos < best_pos,
                    None => true,
                };
                if better {
                    earliest = Some((pos, key.len(), value));
                }
            }
        }

        match earliest {
            Some((pos, key_len, value)) => {
                out.push_str(&rest[..pos]);
                out.push_str(value);
                rest = &rest[pos + key_len..];
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }

    out
}

/// Append the thinking level to a model id as `:<level>`.
///
/// Unset or `off` leaves the model unchanged, as does a model that already
/// carries a known `:<level>` suffix.
pub fn apply_thinking_suffix(model: &str, level: ThinkingLevel) -> String {
    if level == ThinkingLevel::Off {
        return model.to_string();
    }
    if let Some((_, suffix)) = model.rsplit_once(':') {
        if ThinkingLevel::KNOWN_SUFFIXES.contains(&suffix) {
            return model.to_string();
        }
    }
    format!("{}:{}", model, level.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_occurrence_replaced() {
        let out = resolve_template(
            "{previous} and again {previous}",
            &[(VAR_PREVIOUS, "found 3 files")],
        );
        assert_eq!(out, "found 3 files and again found 3 files");
    }

    #[test]
    fn test_no_recursive_expansion() {
        // The replacement text itself contains a variable; it must survive.
        let out = resolve_template(
            "start {previous} end",
            &[(VAR_PREVIOUS, "literal {task} inside"), (VAR_TASK, "BOOM")],
        );
        assert_eq!(out, "start literal {task} inside end");
    }

    #[test]
    fn test_multiple_variables_in_order() {
        let out = resolve_template(
            "do {task} with {previous} in {chain_dir}",
            &[
                (VAR_TASK, "review"),
                (VAR_PREVIOUS, "notes"),
                (VAR_CHAIN_DIR, "/tmp/chain/run-1"),
            ],
        );
        assert_eq!(out, "do review with notes in /tmp/chain/run-1");
    }

    #[test]
    fn test_unknown_braces_left_alone() {
        let out = resolve_template("keep {unknown} as-is", &[(VAR_TASK, "x")]);
        assert_eq!(out, "keep {unknown} as-is");
    }

    #[test]
    fn test_thinking_suffix_appended() {
        assert_eq!(
            apply_thinking_suffix("anthropic/claude-opus-4", ThinkingLevel::High),
            "anthropic/claude-opus-4:high"
        );
    }

    #[test]
    fn test_thinking_off_unchanged() {
        assert_eq!(
            apply_thinking_suffix("anthropic/claude-opus-4", ThinkingLevel::Off),
            "anthropic/claude-opus-4"
        );
    }

    #[test]
    fn test_existing_suffix_wins() {
        assert_eq!(
            apply_thinking_suffix("anthropic/claude-opus-4:low", ThinkingLevel::High),
            "anthropic/claude-opus-4:low"
        );
    }

    #[test]
    fn test_non_level_colon_segment_still_suffixed() {
        // Provider ids may contain colons that are not thinking levels.
        assert_eq!(
            apply_thinking_suffix("openai/o4:2025", ThinkingLevel::Medium),
            "openai/o4:2025:medium"
        );
    }
}
