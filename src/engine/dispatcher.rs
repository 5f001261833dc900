//! Request validation and mode routing.
//!
//! The dispatcher is the only entry point into execution. Validation errors
//! and depth-guard refusals are returned inside [`Details`], never raised;
//! nothing has side effects until validation completes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};

use crate::background::{WorkerInput, WorkerStep};
use crate::domain::{
    AgentSpec, ArtifactSummary, ChainStep, Details, FailureKind, LiveAgentProgress, Request,
    RequestKind, StepResult, TaskSpec,
};
use crate::runner::resolve_runner_binary;
use crate::store::{manage, resolve_scope, SkillSource};

use super::artifacts::ArtifactConfig;
use super::chain::{run_chain, ChainContext, PROGRESS_FILE};
use super::depth;
use super::executor::{run_sync, ExecContext, ProgressHook};
use super::output::{aggregate_blocks, OutputLimits};
use super::parallel::{run_group, MAX_CONCURRENCY, MAX_PARALLEL};
use super::resolve::resolve_step;
use super::template::{resolve_template, VAR_CHAIN_DIR, VAR_TASK};
use super::Engine;

impl Engine {
    /// Execute a request to completion.
    ///
    /// `updates` receives [`Details`] snapshots for live rendering;
    /// `cancel` propagates caller cancellation down to child processes.
    pub async fn execute(
        &self,
        request: Request,
        updates: Option<mpsc::Sender<Details>>,
        cancel: watch::Receiver<bool>,
    ) -> Details {
        // Management actions bypass execution entirely.
        if let Some(action) = request.action.clone() {
            return match manage(self.store.as_ref(), action, &[]) {
                Ok(outcome) => Details {
                    mode: "management".to_string(),
                    output: Some(outcome.message),
                    note: (!outcome.warnings.is_empty()).then(|| outcome.warnings.join("; ")),
                    ..Default::default()
                },
                Err(e) => Details::failure(FailureKind::Validation, format!("{:#}", e)),
            };
        }

        if let Err(message) = depth::check() {
            return Details::failure(FailureKind::DepthGuard, message);
        }

        let agents = match resolve_scope(self.store.as_ref(), request.agent_scope) {
            Ok(agents) => agents,
            Err(e) => {
                return Details::failure(
                    FailureKind::Validation,
                    format!("failed to load agents: {:#}", e),
                )
            }
        };

        if let Err(details) = validate(&request, &agents) {
            return *details;
        }

        let mut note = None;
        let mut background = request.background;
        if background {
            let eligible = !request.clarify
                && matches!(
                    request.kind,
                    RequestKind::Single(_) | RequestKind::Chain { .. }
                );
            if eligible {
                return self.spawn_background(&request, &agents);
            }
            note = Some(if request.clarify {
                "background not available while clarification is pending; ran in foreground"
                    .to_string()
            } else {
                "background not supported for parallel requests; ran in foreground".to_string()
            });
            background = false;
        }
        debug_assert!(!background);

        let mut details = match &request.kind {
            RequestKind::Single(task) => {
                self.run_single(&request, task, &agents, updates, cancel).await
            }
            RequestKind::Parallel { tasks } => {
                self.run_parallel_tasks(&request, tasks, &agents, updates, cancel)
                    .await
            }
            RequestKind::Chain { steps, task } => {
                self.run_chain_request(&request, steps, task.as_deref(), &agents, updates, cancel)
                    .await
            }
        };
        if details.note.is_none() {
            details.note = note;
        }
        details
    }

    async fn run_single(
        &self,
        request: &Request,
        task: &TaskSpec,
        agents: &HashMap<String, AgentSpec>,
        updates: Option<mpsc::Sender<Details>>,
        cancel: watch::Receiver<bool>,
    ) -> Details {
        let agent = &agents[&task.agent];
        let skills: &dyn SkillSource = self.store.as_ref();
        let resolved = resolve_step(agent, &task.task, &task.overrides, skills, &request.cwd);

        let run_id = self.next_run_id();
        let artifacts = self.artifact_config(request, &run_id);

        let hook = updates.clone().map(|tx| -> ProgressHook {
            let agent_name = resolved.agent.clone();
            Arc::new(move |progress: LiveAgentProgress| {
                let details = Details {
                    mode: "single".to_string(),
                    progress: vec![progress],
                    chain_agents: vec![agent_name.clone()],
                    ..Default::default()
                };
                let _ = tx.try_send(details);
            })
        });

        let ctx = ExecContext {
            run_id: run_id.clone(),
            index: None,
            cwd: request.cwd.clone(),
            runner: self.runner_path(),
            session_dir: request.session_dir.clone(),
            limits: OutputLimits::with_byte_cap(request.max_output),
            artifacts: artifacts.clone(),
            cancel,
            events: None,
            progress_hook: hook,
            stream_log: None,
        };

        let result = run_sync(&resolved, &ctx).await;
        self.record_history(
            &result.agent,
            &result.task,
            result.exit_code,
            result.progress.duration_ms,
        );

        Details {
            mode: "single".to_string(),
            output: Some(result.output.clone()),
            artifacts: artifact_summary(&artifacts, std::slice::from_ref(&result)),
            results: vec![result],
            ..Default::default()
        }
    }

    async fn run_parallel_tasks(
        &self,
        request: &Request,
        tasks: &[TaskSpec],
        agents: &HashMap<String, AgentSpec>,
        updates: Option<mpsc::Sender<Details>>,
        cancel: watch::Receiver<bool>,
    ) -> Details {
        let run_id = self.next_run_id();
        let artifacts = self.artifact_config(request, &run_id);
        let skills: &dyn SkillSource = self.store.as_ref();

        let live: Arc<Mutex<Vec<LiveAgentProgress>>> = Arc::new(Mutex::new(
            tasks
                .iter()
                .map(|t| LiveAgentProgress {
                    agent: t.agent.clone(),
                    ..Default::default()
                })
                .collect(),
        ));

        let mut group = Vec::with_capacity(tasks.len());
        for (index, task) in tasks.iter().enumerate() {
            let agent = &agents[&task.agent];
            let resolved = resolve_step(agent, &task.task, &task.overrides, skills, &request.cwd);

            let hook = updates.clone().map(|tx| -> ProgressHook {
                let live = Arc::clone(&live);
                Arc::new(move |progress: LiveAgentProgress| {
                    let snapshot = {
                        let mut guard = live.lock().unwrap_or_else(|e| e.into_inner());
                        if let Some(slot) = guard.get_mut(index) {
                            *slot = progress;
                        }
                        guard.clone()
                    };
                    let _ = tx.try_send(Details {
                        mode: "parallel".to_string(),
                        progress: snapshot,
                        ..Default::default()
                    });
                })
            });

            let ctx = ExecContext {
                run_id: run_id.clone(),
                index: Some(index),
                cwd: request.cwd.clone(),
                runner: self.runner_path(),
                session_dir: request.session_dir.clone(),
                limits: OutputLimits::with_byte_cap(request.max_output),
                artifacts: artifacts.clone(),
                cancel: cancel.clone(),
                events: None,
                progress_hook: hook,
                stream_log: None,
            };
            group.push((resolved, ctx));
        }

        let results = run_group(group, MAX_CONCURRENCY, false, cancel).await;
        for result in &results {
            self.record_history(
                &result.agent,
                &result.task,
                result.exit_code,
                result.progress.duration_ms,
            );
        }

        let progress_snapshot = live.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Details {
            mode: "parallel".to_string(),
            output: Some(aggregate_blocks(&results, "Task")),
            progress: progress_snapshot,
            artifacts: artifact_summary(&artifacts, &results),
            results,
            ..Default::default()
        }
    }

    async fn run_chain_request(
        &self,
        request: &Request,
        steps: &[ChainStep],
        task: Option<&str>,
        agents: &HashMap<String, AgentSpec>,
        updates: Option<mpsc::Sender<Details>>,
        cancel: watch::Receiver<bool>,
    ) -> Details {
        let run_id = self.next_run_id();
        let artifacts = self.artifact_config(request, &run_id);
        let skills: &dyn SkillSource = self.store.as_ref();

        let ctx = ChainContext {
            run_id,
            cwd: request.cwd.clone(),
            runner: self.runner_path(),
            session_dir: request.session_dir.clone(),
            limits: OutputLimits::with_byte_cap(request.max_output),
            artifacts: artifacts.clone(),
            chain_base: request
                .chain_dir
                .clone()
                .unwrap_or_else(|| self.settings.chain_root.clone()),
            cancel,
            events: None,
            updates,
        };

        let details = run_chain(steps, agents, skills, task, &ctx).await;
        for result in &details.results {
            self.record_history(
                &result.agent,
                &result.task,
                result.exit_code,
                result.progress.duration_ms,
            );
        }
        details
    }

    /// Detach a single or chain request into the background worker.
    fn spawn_background(
        &self,
        request: &Request,
        agents: &HashMap<String, AgentSpec>,
    ) -> Details {
        let run_id = self.next_run_id();
        let async_dir = self.settings.async_root.join(&run_id);
        if let Err(e) = super::artifacts::ensure_dir_rw(&async_dir) {
            return Details::failure(
                FailureKind::Validation,
                format!("failed to create {}: {:#}", async_dir.display(), e),
            );
        }

        let skills: &dyn SkillSource = self.store.as_ref();
        let (mode, worker_steps, chain_dir, agent_names) = match &request.kind {
            RequestKind::Single(task) => {
                let agent = &agents[&task.agent];
                let resolved =
                    resolve_step(agent, &task.task, &task.overrides, skills, &request.cwd);
                (
                    "single",
                    vec![WorkerStep::Sequential(resolved)],
                    None,
                    vec![task.agent.clone()],
                )
            }
            RequestKind::Chain { steps, task } => {
                let initial_task = task.clone().unwrap_or_default();
                let chain_base = request
                    .chain_dir
                    .clone()
                    .unwrap_or_else(|| self.settings.chain_root.clone());
                match self.prepare_chain_worker_steps(
                    steps,
                    &initial_task,
                    agents,
                    skills,
                    request,
                    &chain_base,
                    &run_id,
                ) {
                    Ok((worker_steps, chain_dir)) => {
                        let names: Vec<String> =
                            steps.iter().map(|s| s.agent_token()).collect();
                        ("chain", worker_steps, chain_dir, names)
                    }
                    Err(details) => return *details,
                }
            }
            RequestKind::Parallel { .. } => {
                // Routed away before this point; keep the failure graceful.
                return Details::failure(
                    FailureKind::Validation,
                    "parallel requests cannot run in the background".to_string(),
                );
            }
        };

        let input_path = async_dir.join("input.json");
        let input = WorkerInput {
            id: run_id.clone(),
            mode: mode.to_string(),
            steps: worker_steps,
            result_path: self.settings.results_root.join(format!("{}.json", run_id)),
            cwd: request.cwd.clone(),
            placeholder: "{previous}".to_string(),
            runner: self.runner_path(),
            max_output: request.max_output,
            artifacts_dir: request
                .artifacts_enabled
                .then(|| self.settings.artifacts_root.join(&run_id)),
            capture_events: false,
            session_dir: request.session_dir.clone(),
            async_dir: async_dir.clone(),
            chain_dir,
            session_id: request.session_id.clone().or_else(|| self.session_id()),
        };

        let serialized = match serde_json::to_string_pretty(&input) {
            Ok(serialized) => serialized,
            Err(e) => {
                return Details::failure(
                    FailureKind::Validation,
                    format!("failed to serialize worker input: {}", e),
                )
            }
        };
        if let Err(e) = std::fs::write(&input_path, serialized) {
            return Details::failure(
                FailureKind::Validation,
                format!("failed to write {}: {}", input_path.display(), e),
            );
        }

        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(e) => {
                return Details::failure(
                    FailureKind::Validation,
                    format!("failed to locate engine executable: {}", e),
                )
            }
        };
        let mut command = std::process::Command::new(exe);
        command
            .arg("worker")
            .arg(&input_path)
            .current_dir(&request.cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let pid = match command.spawn() {
            Ok(child) => child.id(),
            Err(e) => {
                return Details::failure(
                    FailureKind::Validation,
                    format!("failed to spawn background worker: {}", e),
                )
            }
        };

        self.registry()
            .register(&run_id, async_dir.clone(), agent_names.clone(), pid);

        Details {
            mode: mode.to_string(),
            chain_agents: agent_names,
            async_id: Some(run_id),
            async_dir: Some(async_dir),
            note: Some("running in background".to_string()),
            ..Default::default()
        }
    }

    /// Resolve chain steps for the worker: `{task}`/`{chain_dir}` expand
    /// now, `{previous}` survives as the worker's placeholder.
    #[allow(clippy::too_many_arguments)]
    fn prepare_chain_worker_steps(
        &self,
        steps: &[ChainStep],
        initial_task: &str,
        agents: &HashMap<String, AgentSpec>,
        skills: &dyn SkillSource,
        request: &Request,
        chain_base: &std::path::Path,
        run_id: &str,
    ) -> Result<(Vec<WorkerStep>, Option<PathBuf>), Box<Details>> {
        let needs_dir = steps.iter().any(|step| match step {
            ChainStep::Sequential(s) => {
                s.task.as_deref().is_some_and(|t| t.contains(VAR_CHAIN_DIR))
                    || step_wants_progress(s, agents)
            }
            ChainStep::Parallel(group) => group.tasks.iter().any(|t| {
                t.task.as_deref().is_some_and(|x| x.contains(VAR_CHAIN_DIR))
                    || step_wants_progress(t, agents)
            }),
        });

        let chain_dir = if needs_dir {
            let dir = chain_base.join(run_id);
            if let Err(e) = std::fs::create_dir_all(&dir) {
                return Err(Box::new(Details::failure(
                    FailureKind::Validation,
                    format!("failed to create chain dir {}: {}", dir.display(), e),
                )));
            }
            Some(dir)
        } else {
            None
        };
        let chain_dir_text = chain_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_default();

        let resolve_one = |seq: &crate::domain::SequentialStep| {
            let raw = seq.task.clone().unwrap_or_else(|| "{previous}".to_string());
            let templated = resolve_template(
                &raw,
                &[(VAR_TASK, initial_task), (VAR_CHAIN_DIR, &chain_dir_text)],
            );
            let agent = &agents[&seq.agent];
            let mut resolved =
                resolve_step(agent, &templated, &seq.overrides, skills, &request.cwd);
            if resolved.progress {
                if let Some(dir) = &chain_dir {
                    let progress_path = dir.join(PROGRESS_FILE);
                    if !progress_path.exists() {
                        let _ = std::fs::write(&progress_path, "");
                    }
                    resolved.task = format!(
                        "[Progress file: {}]\n{}",
                        progress_path.display(),
                        resolved.task
                    );
                }
            }
            resolved
        };

        let mut worker_steps = Vec::with_capacity(steps.len());
        for step in steps {
            match step {
                ChainStep::Sequential(seq) => {
                    worker_steps.push(WorkerStep::Sequential(resolve_one(seq)));
                }
                ChainStep::Parallel(group) => {
                    worker_steps.push(WorkerStep::Parallel {
                        parallel: group.tasks.iter().map(&resolve_one).collect(),
                        concurrency: group.concurrency,
                        fail_fast: group.fail_fast,
                    });
                }
            }
        }
        Ok((worker_steps, chain_dir))
    }

    fn runner_path(&self) -> PathBuf {
        resolve_runner_binary(&self.settings.runner_binary)
    }

    fn artifact_config(&self, request: &Request, run_id: &str) -> ArtifactConfig {
        if request.artifacts_enabled {
            ArtifactConfig {
                enabled: true,
                dir: request
                    .session_dir
                    .as_ref()
                    .map(|d| d.join("artifacts"))
                    .unwrap_or_else(|| self.settings.artifacts_root.clone())
                    .join(run_id),
                capture_events: false,
            }
        } else {
            ArtifactConfig::disabled()
        }
    }
}

fn step_wants_progress(
    step: &crate::domain::SequentialStep,
    agents: &HashMap<String, AgentSpec>,
) -> bool {
    step.overrides.progress.unwrap_or_else(|| {
        agents
            .get(&step.agent)
            .map(|a| a.default_progress)
            .unwrap_or(false)
    })
}

fn artifact_summary(config: &ArtifactConfig, results: &[StepResult]) -> Option<ArtifactSummary> {
    if !config.enabled {
        return None;
    }
    Some(ArtifactSummary {
        dir: config.dir.clone(),
        files: results
            .iter()
            .flat_map(|r| r.artifact_paths.iter().cloned())
            .collect(),
    })
}

/// Request-shape validation. Everything here runs before any side effect.
fn validate(
    request: &Request,
    agents: &HashMap<String, AgentSpec>,
) -> Result<(), Box<Details>> {
    let fail = |message: String| Err(Box::new(Details::failure(FailureKind::Validation, message)));

    let referenced: Vec<&str> = match &request.kind {
        RequestKind::Single(task) => vec![task.agent.as_str()],
        RequestKind::Parallel { tasks } => {
            if tasks.is_empty() {
                return fail("parallel request has no tasks".to_string());
            }
            if tasks.len() > MAX_PARALLEL {
                return fail(format!(
                    "parallel request has {} tasks; the limit is {}",
                    tasks.len(),
                    MAX_PARALLEL
                ));
            }
            tasks.iter().map(|t| t.agent.as_str()).collect()
        }
        RequestKind::Chain { steps, .. } => {
            if steps.is_empty() {
                return fail("chain has no steps".to_string());
            }
            match &steps[0] {
                ChainStep::Sequential(first) => {
                    if first.task.as_deref().map_or(true, |t| t.trim().is_empty()) {
                        return fail(
                            "the first chain step needs an explicit task: there is no previous output to reference"
                                .to_string(),
                        );
                    }
                }
                ChainStep::Parallel(group) => {
                    if group.tasks.iter().any(|t| {
                        t.task.as_deref().map_or(true, |x| x.trim().is_empty())
                    }) {
                        return fail(
                            "every task of a first parallel step needs an explicit task: there is no previous output to reference"
                                .to_string(),
                        );
                    }
                }
            }
            steps
                .iter()
                .flat_map(|step| -> Vec<&str> {
                    match step {
                        ChainStep::Sequential(s) => vec![s.agent.as_str()],
                        ChainStep::Parallel(group) => {
                            group.tasks.iter().map(|t| t.agent.as_str()).collect()
                        }
                    }
                })
                .collect()
        }
    };

    for name in referenced {
        if !agents.contains_key(name) {
            let mut available: Vec<&str> = agents.keys().map(String::as_str).collect();
            available.sort_unstable();
            return fail(format!(
                "unknown agent '{}'. Available agents: {}",
                name,
                if available.is_empty() {
                    "(none)".to_string()
                } else {
                    available.join(", ")
                }
            ));
        }
    }

    Ok(())
}
