//! Chain orchestration: sequential steps threading `{previous}`, with
//! optional parallel fan-out groups in between.
//!
//! The chain directory is the only shared medium between steps. The
//! orchestrator creates it lazily, guarantees `progress.md` exists before a
//! progress-enabled step runs, and never deletes it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};

use crate::domain::{
    AgentSpec, ChainStep, Details, LiveAgentProgress, LogEvent, StepResult,
};
use crate::store::SkillSource;

use super::artifacts::ArtifactConfig;
use super::executor::{run_sync, ExecContext};
use super::output::{aggregate_blocks, OutputLimits};
use super::parallel::{run_group, MAX_CONCURRENCY};
use super::resolve::resolve_step;
use super::template::{resolve_template, VAR_CHAIN_DIR, VAR_PREVIOUS, VAR_TASK};

pub const PROGRESS_FILE: &str = "progress.md";

/// Shared inputs for one chain run.
pub struct ChainContext {
    pub run_id: String,
    pub cwd: PathBuf,
    pub runner: PathBuf,
    pub session_dir: Option<PathBuf>,
    pub limits: OutputLimits,
    pub artifacts: ArtifactConfig,
    /// Root under which this run's chain directory is created.
    pub chain_base: PathBuf,
    pub cancel: watch::Receiver<bool>,
    pub events: Option<mpsc::Sender<LogEvent>>,
    pub updates: Option<mpsc::Sender<Details>>,
}

struct ChainState {
    chain_dir: Option<PathBuf>,
    previous: String,
    results: Arc<Mutex<Vec<StepResult>>>,
    live: Arc<Mutex<Vec<LiveAgentProgress>>>,
    chain_agents: Vec<String>,
    total_flat: usize,
}

impl ChainState {
    fn ensure_chain_dir(&mut self, ctx: &ChainContext) -> PathBuf {
        if let Some(dir) = &self.chain_dir {
            return dir.clone();
        }
        let dir = ctx.chain_base.join(&ctx.run_id);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!("Failed to create chain dir {}: {}", dir.display(), e);
        }
        self.chain_dir = Some(dir.clone());
        dir
    }

    fn snapshot(&self, ctx: &ChainContext, current: usize) -> Details {
        Details {
            mode: "chain".to_string(),
            results: self.results.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            progress: self.live.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            chain_agents: self.chain_agents.clone(),
            current_step_index: Some(current),
            total_steps: Some(self.total_flat),
            artifacts: if ctx.artifacts.enabled {
                Some(crate::domain::ArtifactSummary {
                    dir: ctx.artifacts.dir.clone(),
                    files: Vec::new(),
                })
            } else {
                None
            },
            ..Default::default()
        }
    }

    fn emit(&self, ctx: &ChainContext, current: usize) {
        if let Some(tx) = &ctx.updates {
            let _ = tx.try_send(self.snapshot(ctx, current));
        }
    }
}

/// Ensure the progress file exists before a progress-enabled step starts.
fn ensure_progress_file(chain_dir: &std::path::Path) -> PathBuf {
    let path = chain_dir.join(PROGRESS_FILE);
    if !path.exists() {
        if let Err(e) = std::fs::write(&path, "") {
            tracing::warn!("Failed to create {}: {}", path.display(), e);
        }
    }
    path
}

/// Run a chain to completion or first failure.
///
/// `agents` must contain every referenced agent (the dispatcher validates
/// this); `initial_task` backs the `{task}` template variable.
pub async fn run_chain(
    steps: &[ChainStep],
    agents: &HashMap<String, AgentSpec>,
    skills: &dyn SkillSource,
    initial_task: Option<&str>,
    ctx: &ChainContext,
) -> Details {
    let total_flat: usize = steps.iter().map(|s| s.flat_len()).sum();
    let chain_agents: Vec<String> = steps.iter().map(|s| s.agent_token()).collect();

    // Pre-size the live vector so the renderer sees a static layout.
    let mut live_init = Vec::with_capacity(total_flat);
    for step in steps {
        match step {
            ChainStep::Sequential(s) => live_init.push(LiveAgentProgress {
                agent: s.agent.clone(),
                ..Default::default()
            }),
            ChainStep::Parallel(group) => {
                for t in &group.tasks {
                    live_init.push(LiveAgentProgress {
                        agent: t.agent.clone(),
                        ..Default::default()
                    });
                }
            }
        }
    }

    let mut state = ChainState {
        chain_dir: None,
        previous: String::new(),
        results: Arc::new(Mutex::new(Vec::new())),
        live: Arc::new(Mutex::new(live_init)),
        chain_agents,
        total_flat,
    };

    let initial_task = initial_task.unwrap_or("");
    let mut flat_index = 0usize;
    let mut chain_failed = false;

    for (step_index, step) in steps.iter().enumerate() {
        if *ctx.cancel.borrow() {
            break;
        }

        match step {
            ChainStep::Sequential(seq) => {
                let raw_task = seq.task.clone().unwrap_or_else(|| VAR_PREVIOUS.to_string());
                if raw_task.contains(VAR_CHAIN_DIR) {
                    state.ensure_chain_dir(ctx);
                }
                let chain_dir_text = state
                    .chain_dir
                    .as_ref()
                    .map(|d| d.display().to_string())
                    .unwrap_or_default();
                let templated = resolve_template(
                    &raw_task,
                    &[
                        (VAR_TASK, initial_task),
                        (VAR_PREVIOUS, &state.previous),
                        (VAR_CHAIN_DIR, &chain_dir_text),
                    ],
                );

                let Some(agent) = agents.get(&seq.agent) else {
                    // Validated upstream; a miss here is a store race.
                    let result = StepResult::launch_failure(
                        &seq.agent,
                        "",
                        templated,
                        format!("agent '{}' disappeared from the store", seq.agent),
                    );
                    state.results.lock().unwrap_or_else(|e| e.into_inner()).push(result);
                    chain_failed = true;
                    break;
                };

                let mut resolved =
                    resolve_step(agent, &templated, &seq.overrides, skills, &ctx.cwd);
                if resolved.progress {
                    let dir = state.ensure_chain_dir(ctx);
                    let progress_path = ensure_progress_file(&dir);
                    resolved.task = format!(
                        "[Progress file: {}]\n{}",
                        progress_path.display(),
                        resolved.task
                    );
                }

                let exec_ctx = self::step_context(ctx, flat_index, &state, ctx.artifacts.clone());
                let mut result = run_sync(&resolved, &exec_ctx).await;

                if let Some(path) = &result.output_file {
                    if !path.exists() {
                        result.warnings.push(format!(
                            "declared output file {} was not produced",
                            path.display()
                        ));
                    }
                }

                let succeeded = result.succeeded();
                state.previous = result.output.trim().to_string();
                state
                    .results
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(result);
                flat_index += 1;
                state.emit(ctx, step_index);

                if !succeeded {
                    chain_failed = true;
                    break;
                }
            }

            ChainStep::Parallel(group) => {
                let dir = state.ensure_chain_dir(ctx);
                // Created up front so concurrent tasks don't race on it.
                if group.tasks.iter().any(|t| {
                    t.overrides.progress.unwrap_or_else(|| {
                        agents.get(&t.agent).map(|a| a.default_progress).unwrap_or(false)
                    })
                }) {
                    ensure_progress_file(&dir);
                }

                let mut tasks = Vec::with_capacity(group.tasks.len());
                let chain_dir_text = dir.display().to_string();
                let mut missing_agent = None;

                for (task_index, task) in group.tasks.iter().enumerate() {
                    let raw_task =
                        task.task.clone().unwrap_or_else(|| VAR_PREVIOUS.to_string());
                    let templated = resolve_template(
                        &raw_task,
                        &[
                            (VAR_TASK, initial_task),
                            (VAR_PREVIOUS, &state.previous),
                            (VAR_CHAIN_DIR, &chain_dir_text),
                        ],
                    );
                    let Some(agent) = agents.get(&task.agent) else {
                        missing_agent = Some(task.agent.clone());
                        break;
                    };
                    let mut resolved =
                        resolve_step(agent, &templated, &task.overrides, skills, &ctx.cwd);
                    if resolved.progress {
                        let progress_path = dir.join(PROGRESS_FILE);
                        resolved.task = format!(
                            "[Progress file: {}]\n{}",
                            progress_path.display(),
                            resolved.task
                        );
                    }

                    let artifacts = if ctx.artifacts.enabled {
                        ArtifactConfig {
                            enabled: true,
                            dir: dir
                                .join(format!("parallel-{}", step_index))
                                .join(format!("{}-{}", task_index, task.agent)),
                            capture_events: ctx.artifacts.capture_events,
                        }
                    } else {
                        ArtifactConfig::disabled()
                    };
                    let exec_ctx =
                        self::step_context(ctx, flat_index + task_index, &state, artifacts);
                    tasks.push((resolved, exec_ctx));
                }

                if let Some(name) = missing_agent {
                    let result = StepResult::launch_failure(
                        &name,
                        "",
                        "",
                        format!("agent '{}' disappeared from the store", name),
                    );
                    state.results.lock().unwrap_or_else(|e| e.into_inner()).push(result);
                    chain_failed = true;
                    break;
                }

                let group_size = tasks.len();
                let results = run_group(
                    tasks,
                    group.concurrency.unwrap_or(MAX_CONCURRENCY),
                    group.fail_fast,
                    ctx.cancel.clone(),
                )
                .await;

                let group_failed = results
                    .iter()
                    .any(|r| !r.succeeded() && !r.was_skipped());
                state.previous = aggregate_blocks(&results, "Parallel Task")
                    .trim()
                    .to_string();
                {
                    let mut guard = state.results.lock().unwrap_or_else(|e| e.into_inner());
                    guard.extend(results);
                }
                flat_index += group_size;
                state.emit(ctx, step_index);

                if group_failed {
                    chain_failed = true;
                    break;
                }
            }
        }
    }

    let mut details = state.snapshot(ctx, steps.len().saturating_sub(1));
    details.output = Some(state.previous.clone());
    if chain_failed {
        // The per-step results already carry the failure; nothing to add at
        // the request level.
        details.current_step_index = Some(
            details
                .results
                .iter()
                .position(|r| !r.succeeded() && !r.was_skipped())
                .unwrap_or(0),
        );
    }
    details
}

fn step_context(
    ctx: &ChainContext,
    flat_index: usize,
    state: &ChainState,
    artifacts: ArtifactConfig,
) -> ExecContext {
    let live = Arc::clone(&state.live);
    let results = Arc::clone(&state.results);
    let updates = ctx.updates.clone();
    let snapshot_base = (
        state.chain_agents.clone(),
        state.total_flat,
        ctx.artifacts.enabled.then(|| ctx.artifacts.dir.clone()),
    );

    let hook: super::executor::ProgressHook = Arc::new(move |progress: LiveAgentProgress| {
        {
            let mut guard = live.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(slot) = guard.get_mut(flat_index) {
                *slot = progress;
            }
        }
        if let Some(tx) = &updates {
            let (chain_agents, total_flat, artifacts_dir) = &snapshot_base;
            let details = Details {
                mode: "chain".to_string(),
                results: results.lock().unwrap_or_else(|e| e.into_inner()).clone(),
                progress: live.lock().unwrap_or_else(|e| e.into_inner()).clone(),
                chain_agents: chain_agents.clone(),
                current_step_index: Some(flat_index),
                total_steps: Some(*total_flat),
                artifacts: artifacts_dir.as_ref().map(|dir| crate::domain::ArtifactSummary {
                    dir: dir.clone(),
                    files: Vec::new(),
                }),
                ..Default::default()
            };
            let _ = tx.try_send(details);
        }
    });

    ExecContext {
        run_id: ctx.run_id.clone(),
        index: Some(flat_index),
        cwd: ctx.cwd.clone(),
        runner: ctx.runner.clone(),
        session_dir: ctx.session_dir.clone(),
        limits: ctx.limits,
        artifacts,
        cancel: ctx.cancel.clone(),
        events: ctx.events.clone(),
        progress_hook: Some(hook),
        stream_log: None,
    }
}
