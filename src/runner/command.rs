//! Runner command construction.
//!
//! Builds the argv and environment for one runner invocation from a
//! [`ResolvedStep`]. The system prompt always travels via a temp file; the
//! task spills to a temp file referenced with the `@file` escape once it
//! exceeds the platform-safe inline threshold.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

use crate::domain::ExtensionPolicy;
use crate::engine::depth;

use super::ResolvedStep;

/// Tasks longer than this are passed via a temp file and `@<path>`.
/// Keeps the command line under the limit of every supported platform.
pub const INLINE_TASK_LIMIT: usize = 8 * 1024;

pub const MCP_DIRECT_TOOLS_ENV: &str = "MCP_DIRECT_TOOLS";

/// Explicit "no MCP direct tools" marker, distinct from an unset variable.
pub const MCP_NONE_SENTINEL: &str = "__none__";

/// A fully-built runner invocation. The temp paths backing `@file` task and
/// system prompt arguments are deleted when this is dropped, so it must
/// outlive the child process.
pub struct RunnerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    temp_files: Vec<tempfile::TempPath>,
}

impl RunnerCommand {
    /// Build the invocation for one step.
    pub fn build(
        step: &ResolvedStep,
        runner: &Path,
        session_dir: Option<&Path>,
    ) -> Result<Self> {
        let mut args = vec!["-p".to_string()];
        let mut temp_files = Vec::new();

        match session_dir {
            Some(dir) => {
                args.push("--session-dir".to_string());
                args.push(dir.display().to_string());
            }
            None => args.push("--no-session".to_string()),
        }

        args.push("--models".to_string());
        args.push(step.model.clone());

        if !step.tools.is_empty() {
            args.push("--tools".to_string());
            args.push(step.tools.join(","));
        }

        match &step.extensions {
            ExtensionPolicy::Inherit => {}
            ExtensionPolicy::Disabled => args.push("--no-extensions".to_string()),
            ExtensionPolicy::Allow(paths) => {
                for path in paths {
                    args.push("--extension".to_string());
                    args.push(path.clone());
                }
            }
        }

        if !step.system_prompt.is_empty() {
            let path = write_temp("system prompt", &step.system_prompt)?;
            args.push("--append-system-prompt".to_string());
            args.push(path.display().to_string());
            temp_files.push(path);
        }

        if step.task.len() > INLINE_TASK_LIMIT {
            let path = write_temp("task", &step.task)?;
            args.push(format!("@{}", path.display()));
            temp_files.push(path);
        } else {
            args.push(step.task.clone());
        }

        let mut env = HashMap::new();
        match &step.mcp_direct_tools {
            None => {}
            Some(tools) if tools.is_empty() => {
                env.insert(MCP_DIRECT_TOOLS_ENV.to_string(), MCP_NONE_SENTINEL.to_string());
            }
            Some(tools) => {
                env.insert(MCP_DIRECT_TOOLS_ENV.to_string(), tools.join(","));
            }
        }
        env.insert(depth::DEPTH_ENV.to_string(), depth::child_depth().to_string());

        Ok(Self {
            program: runner.to_path_buf(),
            args,
            env,
            temp_files,
        })
    }

    /// Materialize as a spawnable tokio command with piped stdio.
    pub fn to_tokio_command(&self, cwd: &Path) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(cwd)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        {
            // CREATE_NO_WINDOW: no console flash on spawn.
            cmd.creation_flags(0x0800_0000);
        }

        cmd
    }

    #[cfg(test)]
    pub(crate) fn temp_file_count(&self) -> usize {
        self.temp_files.len()
    }
}

fn write_temp(what: &str, content: &str) -> Result<tempfile::TempPath> {
    let mut file =
        NamedTempFile::new().with_context(|| format!("Failed to create {} temp file", what))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("Failed to write {} temp file", what))?;
    file.flush()
        .with_context(|| format!("Failed to flush {} temp file", what))?;
    Ok(file.into_temp_path())
}

/// Resolve the runner executable.
///
/// Names containing a path separator are used as-is. Bare names are probed
/// on PATH (with the Windows extensions), then looked up by walking up from
/// the engine's own executable, so a co-packaged runner is found even when
/// PATH is stripped. Falls back to the bare name and lets spawn fail with a
/// descriptive error.
pub fn resolve_runner_binary(name: &str) -> PathBuf {
    let raw = Path::new(name);
    if name.contains(std::path::MAIN_SEPARATOR) || name.contains('/') {
        return raw.to_path_buf();
    }

    if let Some(found) = probe_path(name) {
        return found;
    }

    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent();
        while let Some(current) = dir {
            for candidate in candidate_names(name) {
                let path = current.join(&candidate);
                if path.is_file() {
                    return path;
                }
            }
            dir = current.parent();
        }
    }

    raw.to_path_buf()
}

fn probe_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        for candidate in candidate_names(name) {
            let path = dir.join(&candidate);
            if path.is_file() {
                return Some(path);
            }
        }
    }
    None
}

#[cfg(windows)]
fn candidate_names(name: &str) -> Vec<String> {
    vec![
        format!("{}.exe", name),
        format!("{}.cmd", name),
        format!("{}.bat", name),
        name.to_string(),
    ]
}

#[cfg(not(windows))]
fn candidate_names(name: &str) -> Vec<String> {
    vec![name.to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ResolvedStep;

    fn step() -> ResolvedStep {
        ResolvedStep {
            agent: "scout".to_string(),
            model: "anthropic/claude-opus-4:high".to_string(),
            task: "hello".to_string(),
            system_prompt: "You are a scout.".to_string(),
            skills: vec![],
            tools: vec!["Read".to_string(), "Grep".to_string()],
            mcp_direct_tools: Some(vec![]),
            extensions: ExtensionPolicy::Disabled,
            output_file: None,
            progress: false,
            warnings: vec![],
        }
    }

    #[test]
    fn test_build_args_shape() {
        let cmd = RunnerCommand::build(&step(), Path::new("/usr/bin/pi"), None).unwrap();

        assert_eq!(cmd.args[0], "-p");
        assert!(cmd.args.contains(&"--no-session".to_string()));
        assert!(cmd.args.contains(&"--models".to_string()));
        assert!(cmd.args.contains(&"anthropic/claude-opus-4:high".to_string()));
        assert!(cmd.args.contains(&"--tools".to_string()));
        assert!(cmd.args.contains(&"Read,Grep".to_string()));
        assert!(cmd.args.contains(&"--no-extensions".to_string()));
        // Task stays inline below the threshold.
        assert_eq!(cmd.args.last().unwrap(), "hello");
        // System prompt always travels via file.
        assert_eq!(cmd.temp_file_count(), 1);
    }

    #[test]
    fn test_mcp_sentinel_for_explicit_empty() {
        let cmd = RunnerCommand::build(&step(), Path::new("pi"), None).unwrap();
        assert_eq!(
            cmd.env.get(MCP_DIRECT_TOOLS_ENV).map(String::as_str),
            Some(MCP_NONE_SENTINEL)
        );

        let mut inherit = step();
        inherit.mcp_direct_tools = None;
        let cmd = RunnerCommand::build(&inherit, Path::new("pi"), None).unwrap();
        assert!(!cmd.env.contains_key(MCP_DIRECT_TOOLS_ENV));

        let mut listed = step();
        listed.mcp_direct_tools = Some(vec!["search".to_string(), "fetch".to_string()]);
        let cmd = RunnerCommand::build(&listed, Path::new("pi"), None).unwrap();
        assert_eq!(
            cmd.env.get(MCP_DIRECT_TOOLS_ENV).map(String::as_str),
            Some("search,fetch")
        );
    }

    #[test]
    fn test_long_task_spills_to_file() {
        let mut long = step();
        long.task = "x".repeat(INLINE_TASK_LIMIT + 1);
        let cmd = RunnerCommand::build(&long, Path::new("pi"), None).unwrap();

        let last = cmd.args.last().unwrap();
        assert!(last.starts_with('@'), "expected @file escape, got {}", last);
        // System prompt file + task file.
        assert_eq!(cmd.temp_file_count(), 2);
        let task_path = Path::new(&last[1..]);
        assert_eq!(
            std::fs::read_to_string(task_path).unwrap().len(),
            INLINE_TASK_LIMIT + 1
        );
    }

    #[test]
    fn test_session_dir_flag() {
        let cmd =
            RunnerCommand::build(&step(), Path::new("pi"), Some(Path::new("/tmp/sess"))).unwrap();
        assert!(cmd.args.contains(&"--session-dir".to_string()));
        assert!(!cmd.args.contains(&"--no-session".to_string()));
    }

    #[test]
    fn test_resolve_explicit_path_passthrough() {
        let path = resolve_runner_binary("/opt/bin/runner");
        assert_eq!(path, PathBuf::from("/opt/bin/runner"));
    }
}
