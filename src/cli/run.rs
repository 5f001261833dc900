//! Handlers for `run`, `parallel`, and `chain`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, watch};

use crate::config::Settings;
use crate::domain::{
    ChainStep, Details, OutputSpec, ParallelStep, Request, RequestKind, RunOverrides,
    SequentialStep, SkillSpec, TaskSpec,
};
use crate::engine::Engine;
use crate::store::FsStore;

pub struct RunArgs {
    pub agent: String,
    pub task: String,
    pub model: Option<String>,
    pub skills: Vec<String>,
    pub no_skills: bool,
    pub output: Option<String>,
    pub no_output: bool,
    pub background: bool,
    pub json: bool,
}

fn build_engine(cwd: &Path, settings: Settings) -> Engine {
    let store = Arc::new(FsStore::discover(cwd));
    let (engine, _events) = Engine::new(settings, store, cwd.to_path_buf(), None);
    engine
}

async fn execute_and_render(engine: &Engine, request: Request, json: bool) -> Result<()> {
    let (update_tx, mut update_rx) = mpsc::channel::<Details>(64);
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let printer = tokio::spawn(async move {
        while let Some(details) = update_rx.recv().await {
            for progress in &details.progress {
                if progress.done {
                    continue;
                }
                if let Some(event) = &progress.last_event {
                    eprintln!("[{}] {}", progress.agent, event);
                }
            }
        }
    });

    let details = engine.execute(request, Some(update_tx), cancel_rx).await;
    let _ = printer.await;
    render(&details, json)
}

fn render(details: &Details, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(details)?);
    } else {
        if let Some(id) = &details.async_id {
            println!("started background run {}", id);
            if let Some(dir) = &details.async_dir {
                println!("status: {}", dir.join("status.json").display());
            }
            return Ok(());
        }
        if let Some(note) = &details.note {
            eprintln!("note: {}", note);
        }
        if let Some(output) = &details.output {
            println!("{}", output);
        }
        for result in &details.results {
            for warning in &result.warnings {
                eprintln!("warning [{}]: {}", result.agent, warning);
            }
        }
    }
    if let Some(error) = &details.error {
        bail!("{}", error);
    }
    if details.results.iter().any(|r| !r.succeeded() && !r.was_skipped()) {
        bail!("one or more steps failed");
    }
    Ok(())
}

pub async fn run_command(cwd: &Path, settings: Settings, args: RunArgs) -> Result<()> {
    let overrides = RunOverrides {
        model: args.model,
        skills: if args.no_skills {
            SkillSpec::Disabled
        } else if args.skills.is_empty() {
            SkillSpec::Default
        } else {
            SkillSpec::Explicit(args.skills)
        },
        output: if args.no_output {
            OutputSpec::Disabled
        } else {
            match args.output {
                Some(path) => OutputSpec::Path(path),
                None => OutputSpec::Default,
            }
        },
        reads: None,
        progress: None,
    };

    let mut request = Request::single(args.agent, args.task, cwd);
    if let RequestKind::Single(task) = &mut request.kind {
        task.overrides = overrides;
    }
    request.background = args.background;

    let engine = build_engine(cwd, settings);
    engine.start();
    execute_and_render(&engine, request, args.json).await
}

/// Parse an `AGENT=TASK` pair.
fn parse_task_pair(raw: &str) -> Result<(String, String)> {
    let (agent, task) = raw
        .split_once('=')
        .with_context(|| format!("expected AGENT=TASK, got '{}'", raw))?;
    if agent.trim().is_empty() || task.trim().is_empty() {
        bail!("expected AGENT=TASK, got '{}'", raw);
    }
    Ok((agent.trim().to_string(), task.to_string()))
}

pub async fn parallel_command(
    cwd: &Path,
    settings: Settings,
    tasks: Vec<String>,
    json: bool,
) -> Result<()> {
    let mut specs = Vec::with_capacity(tasks.len());
    for raw in &tasks {
        let (agent, task) = parse_task_pair(raw)?;
        specs.push(TaskSpec {
            agent,
            task,
            overrides: RunOverrides::default(),
        });
    }

    let request = Request::parallel(specs, cwd);
    let engine = build_engine(cwd, settings);
    engine.start();
    execute_and_render(&engine, request, json).await
}

/// Parse a `--step` value: `AGENT`, `AGENT=TASK`, or `A+B+C[=TASK]` for a
/// parallel group.
fn parse_step(raw: &str) -> ChainStep {
    let (agents_part, task) = match raw.split_once('=') {
        Some((a, t)) => (a.trim(), Some(t.to_string())),
        None => (raw.trim(), None),
    };

    if agents_part.contains('+') {
        let tasks = agents_part
            .split('+')
            .map(|agent| SequentialStep {
                agent: agent.trim().to_string(),
                task: task.clone(),
                overrides: RunOverrides::default(),
            })
            .collect();
        ChainStep::Parallel(ParallelStep {
            tasks,
            concurrency: None,
            fail_fast: false,
        })
    } else {
        ChainStep::Sequential(SequentialStep {
            agent: agents_part.to_string(),
            task,
            overrides: RunOverrides::default(),
        })
    }
}

pub struct ChainArgs {
    pub steps: Vec<String>,
    pub task: Option<String>,
    pub chain_dir: Option<PathBuf>,
    pub background: bool,
    pub json: bool,
}

pub async fn chain_command(cwd: &Path, settings: Settings, args: ChainArgs) -> Result<()> {
    let steps: Vec<ChainStep> = args.steps.iter().map(|s| parse_step(s)).collect();

    let mut request = Request::chain(steps, cwd);
    if let RequestKind::Chain { task, .. } = &mut request.kind {
        *task = args.task;
    }
    request.chain_dir = args.chain_dir;
    request.background = args.background;

    let engine = build_engine(cwd, settings);
    engine.start();
    execute_and_render(&engine, request, args.json).await
}
