//! Detached background worker.
//!
//! Runs in its own process (the engine re-invokes its executable with the
//! hidden `worker` subcommand). All communication is through files: the
//! input JSON, `status.json`, `events.jsonl`, per-step output logs, and the
//! terminal result file. Ordering invariant: the terminal `status.json`
//! write always precedes the result file write.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;

use crate::domain::{
    BackgroundStatus, JobState, ResultEntry, StepEntry, StepResult, StepState, TerminalResult,
};
use crate::engine::artifacts::ArtifactConfig;
use crate::engine::chain::PROGRESS_FILE;
use crate::engine::executor::{run_sync, ExecContext};
use crate::engine::output::{aggregate_blocks, truncate_display, OutputLimits};
use crate::engine::parallel::{run_group, MAX_CONCURRENCY};
use crate::engine::template::resolve_template;
use crate::runner::ResolvedStep;

use super::input::{WorkerInput, WorkerStep};
use super::status_file;

/// Entry point for the `worker` subcommand.
pub async fn run_worker(input_path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(input_path)
        .with_context(|| format!("Failed to read worker input {}", input_path.display()))?;
    let input: WorkerInput =
        serde_json::from_str(&content).context("Failed to parse worker input")?;
    run(input).await
}

struct WorkerState {
    status: BackgroundStatus,
    input: WorkerInput,
}

impl WorkerState {
    fn persist(&mut self) {
        self.status.recompute_current_step();
        self.status.touch();
        if let Err(e) = status_file::write_status(&self.input.async_dir, &self.status) {
            tracing::warn!("Failed to write status: {:#}", e);
        }
    }

    fn event(&self, name: &str, data: serde_json::Value) {
        if let Err(e) = status_file::append_event(&self.input.async_dir, name, data) {
            tracing::warn!("Failed to append event: {:#}", e);
        }
    }

    fn mark_running(&mut self, flat_index: usize) {
        if let Some(entry) = self.status.steps.get_mut(flat_index) {
            entry.status = StepState::Running;
            entry.started_at = Some(Utc::now());
        }
    }

    fn mark_finished(&mut self, flat_index: usize, result: &StepResult) {
        if let Some(entry) = self.status.steps.get_mut(flat_index) {
            entry.status = if result.succeeded() {
                StepState::Complete
            } else {
                StepState::Failed
            };
            entry.ended_at = Some(Utc::now());
            entry.duration_ms = Some(result.progress.duration_ms);
            entry.exit_code = Some(result.exit_code);
            entry.tokens = Some(result.usage.total_tokens);
            entry.skills = result.skills.clone();
            if entry.started_at.is_none() {
                entry.started_at = entry.ended_at;
            }
        }
    }
}

fn flatten_entries(steps: &[WorkerStep]) -> Vec<StepEntry> {
    let mut entries = Vec::new();
    for step in steps {
        match step {
            WorkerStep::Sequential(s) => entries.push(StepEntry::pending(&s.agent)),
            WorkerStep::Parallel { parallel, .. } => {
                for s in parallel {
                    entries.push(StepEntry::pending(&s.agent));
                }
            }
        }
    }
    entries
}

fn exec_context(input: &WorkerInput, flat_index: usize) -> ExecContext {
    let (_tx, cancel) = watch::channel(false);
    ExecContext {
        run_id: input.id.clone(),
        index: Some(flat_index),
        cwd: input.cwd.clone(),
        runner: input.runner.clone(),
        session_dir: input.session_dir.clone(),
        limits: OutputLimits::with_byte_cap(input.max_output),
        artifacts: match &input.artifacts_dir {
            Some(dir) => ArtifactConfig {
                enabled: true,
                dir: dir.clone(),
                capture_events: input.capture_events,
            },
            None => ArtifactConfig::disabled(),
        },
        cancel,
        events: None,
        progress_hook: None,
        stream_log: Some(status_file::step_log_path(&input.async_dir, flat_index)),
    }
}

/// Ensure the shared progress file exists before a progress-enabled step.
fn ensure_progress_file(input: &WorkerInput, step: &ResolvedStep) {
    if !step.progress {
        return;
    }
    if let Some(dir) = &input.chain_dir {
        let path = dir.join(PROGRESS_FILE);
        if !path.exists() {
            let _ = std::fs::create_dir_all(dir);
            let _ = std::fs::write(&path, "");
        }
    }
}

/// Execute a worker input to completion.
pub async fn run(input: WorkerInput) -> Result<()> {
    crate::engine::artifacts::ensure_dir_rw(&input.async_dir).with_context(|| {
        format!("Failed to create async dir {}", input.async_dir.display())
    })?;

    let started = std::time::Instant::now();
    let mut status = BackgroundStatus::new(
        &input.id,
        &input.mode,
        input.cwd.clone(),
        flatten_entries(&input.steps),
    );
    status.session_dir = input.session_dir.clone();

    let steps = input.steps.clone();
    let mut state = WorkerState { status, input };
    state.persist();
    state.event("subagent.run.started", json!({ "id": state.input.id }));

    let mut previous = String::new();
    let mut results: Vec<StepResult> = Vec::new();
    let mut flat_index = 0usize;
    let mut failed = false;

    for step in &steps {
        match step {
            WorkerStep::Sequential(resolved) => {
                let mut resolved = resolved.clone();
                resolved.task = resolve_template(
                    &resolved.task,
                    &[(state.input.placeholder.as_str(), previous.as_str())],
                );
                ensure_progress_file(&state.input, &resolved);

                state.mark_running(flat_index);
                state.persist();
                state.event(
                    "subagent.step.started",
                    json!({ "agent": resolved.agent, "index": flat_index }),
                );

                let ctx = exec_context(&state.input, flat_index);
                let result = run_sync(&resolved, &ctx).await;

                state.mark_finished(flat_index, &result);
                state.persist();
                state.event(
                    if result.succeeded() {
                        "subagent.step.completed"
                    } else {
                        "subagent.step.failed"
                    },
                    json!({
                        "agent": resolved.agent,
                        "index": flat_index,
                        "exitCode": result.exit_code
                    }),
                );

                previous = result.output.trim().to_string();
                let step_failed = !result.succeeded();
                results.push(result);
                flat_index += 1;

                if step_failed {
                    failed = true;
                    break;
                }
            }

            WorkerStep::Parallel {
                parallel,
                concurrency,
                fail_fast,
            } => {
                let mut tasks = Vec::with_capacity(parallel.len());
                for (task_index, resolved) in parallel.iter().enumerate() {
                    let mut resolved = resolved.clone();
                    resolved.task = resolve_template(
                        &resolved.task,
                        &[(state.input.placeholder.as_str(), previous.as_str())],
                    );
                    ensure_progress_file(&state.input, &resolved);
                    tasks.push((resolved, exec_context(&state.input, flat_index + task_index)));
                }

                for task_index in 0..tasks.len() {
                    state.mark_running(flat_index + task_index);
                }
                state.persist();
                for (task_index, (resolved, _)) in tasks.iter().enumerate() {
                    state.event(
                        "subagent.step.started",
                        json!({ "agent": resolved.agent, "index": flat_index + task_index }),
                    );
                }

                let (_tx, cancel) = watch::channel(false);
                let group_results = run_group(
                    tasks,
                    concurrency.unwrap_or(MAX_CONCURRENCY),
                    *fail_fast,
                    cancel,
                )
                .await;

                for (task_index, result) in group_results.iter().enumerate() {
                    state.mark_finished(flat_index + task_index, result);
                    state.event(
                        if result.succeeded() {
                            "subagent.step.completed"
                        } else {
                            "subagent.step.failed"
                        },
                        json!({
                            "agent": result.agent,
                            "index": flat_index + task_index,
                            "exitCode": result.exit_code,
                            "skipped": result.was_skipped()
                        }),
                    );
                }
                state.persist();

                let group_failed = group_results
                    .iter()
                    .any(|r| !r.succeeded() && !r.was_skipped());
                previous = aggregate_blocks(&group_results, "Parallel Task")
                    .trim()
                    .to_string();
                flat_index += group_results.len();
                results.extend(group_results);

                if group_failed {
                    failed = true;
                    break;
                }
            }
        }
    }

    // Final display output, truncated once at the aggregate level.
    let limits = OutputLimits::with_byte_cap(state.input.max_output);
    let (final_output, truncation) = truncate_display(&previous, &limits, None);
    let truncated = truncation.is_some();

    let total_tokens: u64 = results.iter().map(|r| r.usage.total_tokens).sum();
    let success = !failed;
    let duration_ms = started.elapsed().as_millis() as u64;

    let log_path = write_markdown_log(&state, &results, success, duration_ms);

    state.status.state = if success {
        JobState::Complete
    } else {
        JobState::Failed
    };
    state.status.ended_at = Some(Utc::now());
    state.status.total_tokens = Some(total_tokens);
    state.status.output_file = log_path;
    if failed {
        state.status.error = results
            .iter()
            .rev()
            .find_map(|r| r.error.clone())
            .or(Some("a step failed".to_string()));
    }
    state.persist();
    state.event(
        if success {
            "subagent.run.completed"
        } else {
            "subagent.run.failed"
        },
        json!({ "id": state.input.id, "durationMs": duration_ms }),
    );

    let agent_label = results
        .iter()
        .map(|r| r.agent.as_str())
        .collect::<Vec<_>>()
        .join(" → ");
    let exit_code = results
        .iter()
        .find(|r| !r.succeeded() && !r.was_skipped())
        .map(|r| r.exit_code)
        .unwrap_or(0);
    let summary = if success {
        final_output.lines().next().unwrap_or("").to_string()
    } else {
        state.status.error.clone().unwrap_or_default()
    };

    let result = TerminalResult {
        id: state.input.id.clone(),
        agent: agent_label,
        success,
        summary,
        results: results
            .iter()
            .map(|r| ResultEntry {
                agent: r.agent.clone(),
                output: r.output.clone(),
                success: r.succeeded(),
                skipped: r.was_skipped(),
                artifact_paths: r.artifact_paths.clone(),
                truncated: r.truncation.is_some(),
            })
            .collect(),
        exit_code,
        timestamp: Utc::now(),
        duration_ms,
        truncated,
        artifacts_dir: state.input.artifacts_dir.clone(),
        cwd: state.input.cwd.clone(),
        async_dir: state.input.async_dir.clone(),
        session_id: state.input.session_id.clone(),
        session_file: None,
        share_url: None,
        share_error: None,
    };

    // status.json is terminal before the result file appears.
    status_file::write_result(&state.input.result_path, &result)?;

    Ok(())
}

/// Human-readable run log written at completion.
fn write_markdown_log(
    state: &WorkerState,
    results: &[StepResult],
    success: bool,
    duration_ms: u64,
) -> Option<std::path::PathBuf> {
    let path = status_file::markdown_log_path(&state.input.async_dir, &state.input.id);
    let mut md = format!(
        "# Subagent run {}\n\n- Mode: {}\n- Outcome: {}\n- Duration: {} ms\n\n## Steps\n\n",
        state.input.id,
        state.input.mode,
        if success { "complete" } else { "failed" },
        duration_ms
    );
    for (i, result) in results.iter().enumerate() {
        let outcome = if result.was_skipped() {
            "skipped".to_string()
        } else if result.succeeded() {
            "ok".to_string()
        } else {
            format!("failed (exit {})", result.exit_code)
        };
        md.push_str(&format!(
            "{}. **{}** — {} ({} tools, {} tokens, {} ms)\n",
            i + 1,
            result.agent,
            outcome,
            result.progress.tool_calls,
            result.usage.total_tokens,
            result.progress.duration_ms
        ));
        if let Some(error) = &result.error {
            md.push_str(&format!("   - error: {}\n", error));
        }
    }
    match std::fs::write(&path, md) {
        Ok(()) => Some(path),
        Err(e) => {
            tracing::warn!("Failed to write markdown log: {}", e);
            None
        }
    }
}
