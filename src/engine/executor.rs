//! Single-step executor: spawn the runner, stream its events, collect the
//! result.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::domain::{
    LiveAgentProgress, LogEvent, MessageRecord, ProgressSummary, StepResult, Usage,
};
use crate::runner::{summarize_tool_call, ResolvedStep, RunnerBlock, RunnerCommand, RunnerEvent};

use super::artifacts::{
    event_stream_path, output_artifact_path, write_step_artifacts, ArtifactConfig, ArtifactMeta,
    EVENT_STREAM_CAP_BYTES,
};
use super::detect::detect_trailing_error;
use super::output::{truncate_display, OutputLimits};
use super::process_registry;

/// Grace between SIGTERM and SIGKILL on cancellation.
const KILL_GRACE: Duration = Duration::from_secs(3);

/// Minimum interval between throttled progress emissions.
const UPDATE_INTERVAL: Duration = Duration::from_millis(50);

/// Callback invoked with live progress snapshots for this run's slot.
pub type ProgressHook = Arc<dyn Fn(LiveAgentProgress) + Send + Sync>;

/// Everything a single run needs beyond the step itself.
#[derive(Clone)]
pub struct ExecContext {
    pub run_id: String,
    /// Slot index for parallel runs; None for a lone run.
    pub index: Option<usize>,
    pub cwd: PathBuf,
    pub runner: PathBuf,
    pub session_dir: Option<PathBuf>,
    pub limits: OutputLimits,
    pub artifacts: ArtifactConfig,
    pub cancel: watch::Receiver<bool>,
    pub events: Option<mpsc::Sender<LogEvent>>,
    pub progress_hook: Option<ProgressHook>,
    /// Raw stdout+stderr line log (background runs stream here).
    pub stream_log: Option<PathBuf>,
}

impl ExecContext {
    pub fn new(run_id: impl Into<String>, cwd: impl Into<PathBuf>, runner: impl Into<PathBuf>) -> Self {
        let (_tx, rx) = watch::channel(false);
        Self {
            run_id: run_id.into(),
            index: None,
            cwd: cwd.into(),
            runner: runner.into(),
            session_dir: None,
            limits: OutputLimits::default(),
            artifacts: ArtifactConfig::disabled(),
            cancel: rx,
            events: None,
            progress_hook: None,
            stream_log: None,
        }
    }

    fn registry_key(&self) -> String {
        match self.index {
            Some(i) => format!("{}:{}", self.run_id, i),
            None => self.run_id.clone(),
        }
    }
}

/// Shared append sink for the raw line log, with an optional byte cap.
/// Writes past the cap are silently dropped, never failed.
#[derive(Clone)]
struct LineSink {
    file: Option<Arc<Mutex<std::fs::File>>>,
    cap: Option<Arc<std::sync::atomic::AtomicU64>>,
}

impl LineSink {
    fn open(path: Option<&std::path::Path>) -> Self {
        Self::open_capped(path, None)
    }

    fn open_capped(path: Option<&std::path::Path>, cap: Option<u64>) -> Self {
        let file = path.and_then(|p| {
            if let Some(parent) = p.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .ok()
        });
        Self {
            file: file.map(|f| Arc::new(Mutex::new(f))),
            cap: cap.map(|limit| Arc::new(std::sync::atomic::AtomicU64::new(limit))),
        }
    }

    fn append(&self, line: &str) {
        let Some(file) = &self.file else {
            return;
        };
        if let Some(remaining) = &self.cap {
            let needed = line.len() as u64 + 1;
            if remaining
                .fetch_update(
                    std::sync::atomic::Ordering::SeqCst,
                    std::sync::atomic::Ordering::SeqCst,
                    |left| left.checked_sub(needed),
                )
                .is_err()
            {
                return;
            }
        }
        use std::io::Write;
        let mut guard = file.lock().unwrap_or_else(|e| e.into_inner());
        let _ = writeln!(guard, "{}", line);
    }
}

struct Throttle {
    last: Option<Instant>,
}

impl Throttle {
    fn new() -> Self {
        Self { last: None }
    }

    fn ready(&mut self, force: bool) -> bool {
        let now = Instant::now();
        let due = force
            || self
                .last
                .map_or(true, |last| now.duration_since(last) >= UPDATE_INTERVAL);
        if due {
            self.last = Some(now);
        }
        due
    }
}

#[derive(Default)]
struct StreamCollector {
    messages: Vec<MessageRecord>,
    output_text: String,
    usage: Usage,
    tool_calls: usize,
    last_event: Option<String>,
}

impl StreamCollector {
    /// Ingest one stdout line. Returns the log events to emit and whether
    /// the progress throttle should be bypassed.
    fn ingest(&mut self, line: &str) -> (Vec<LogEvent>, bool) {
        let Some(event) = RunnerEvent::parse(line) else {
            return (Vec::new(), false);
        };

        let mut log_events = Vec::new();
        let mut force_flush = false;

        match event {
            RunnerEvent::MessageEnd { message, usage } => {
                for block in message.content {
                    match block {
                        RunnerBlock::Text { text } => {
                            if !self.output_text.is_empty() {
                                self.output_text.push('\n');
                            }
                            self.output_text.push_str(&text);
                            log_events.push(LogEvent::text(first_line(&text)));
                            self.messages.push(MessageRecord::Assistant { text });
                        }
                        RunnerBlock::ToolCall { name, input, .. } => {
                            let summary = summarize_tool_call(&name, &input);
                            log_events.push(LogEvent::tool_call(name.clone(), summary.clone()));
                            self.messages.push(MessageRecord::ToolCall { name, summary });
                        }
                    }
                }
                if let Some(usage) = usage {
                    self.usage.add(&Usage {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        total_tokens: usage.input_tokens + usage.output_tokens,
                        cost_usd: usage.cost_usd,
                    });
                }
            }
            RunnerEvent::ToolExecutionStart { tool_name, input } => {
                self.tool_calls += 1;
                self.last_event = Some(summarize_tool_call(&tool_name, &input));
                force_flush = true;
            }
            RunnerEvent::ToolExecutionEnd { .. } => {
                force_flush = true;
            }
            RunnerEvent::ToolResultEnd {
                tool_name,
                content,
                is_error,
            } => {
                log_events.push(if is_error {
                    LogEvent::error(format!("{}: {}", tool_name, first_line(&content)))
                } else {
                    LogEvent::tool_output(tool_name.clone(), first_line(&content))
                });
                self.messages.push(MessageRecord::ToolResult {
                    tool: tool_name,
                    content,
                    is_error,
                });
            }
        }

        (log_events, force_flush)
    }

    fn snapshot(&self, agent: &str, done: bool) -> LiveAgentProgress {
        LiveAgentProgress {
            agent: agent.to_string(),
            tool_calls: self.tool_calls,
            tokens: self.usage.total_tokens,
            last_event: self.last_event.clone(),
            done,
        }
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or("").to_string()
}

/// Run one resolved step to completion.
///
/// Never returns `Err`: launch failures, runner failures, and cancellation
/// all land in the returned [`StepResult`].
pub async fn run_sync(step: &ResolvedStep, ctx: &ExecContext) -> StepResult {
    let started = Instant::now();
    let started_at = Utc::now();

    let mut result = StepResult::empty(&step.agent, &step.model, &step.task);
    result.skills = step.skills.clone();
    result.warnings = step.warnings.clone();
    result.output_file = step.output_file.clone();

    if *ctx.cancel.borrow() {
        result.exit_code = StepResult::EXIT_CANCELLED;
        result.error = Some("cancelled".to_string());
        return result;
    }

    let command = match RunnerCommand::build(step, &ctx.runner, ctx.session_dir.as_deref()) {
        Ok(command) => command,
        Err(e) => {
            result.exit_code = 1;
            result.error = Some(format!("Failed to prepare runner invocation: {:#}", e));
            return result;
        }
    };

    let mut child = match command.to_tokio_command(&ctx.cwd).spawn() {
        Ok(child) => child,
        Err(e) => {
            result.exit_code = 1;
            result.error = Some(format!(
                "Failed to spawn runner '{}': {}",
                command.program.display(),
                e
            ));
            return result;
        }
    };

    let key = ctx.registry_key();
    if let Some(pid) = child.id() {
        process_registry::register(&key, pid, &step.agent);
    }

    let sink = LineSink::open(ctx.stream_log.as_deref());
    // Opt-in raw event stream artifact, bounded so a chatty runner cannot
    // fill the disk.
    let event_sink = LineSink::open_capped(
        event_stream_path(&ctx.artifacts, &ctx.run_id, &step.agent, ctx.index).as_deref(),
        Some(EVENT_STREAM_CAP_BYTES),
    );

    // Stderr drains concurrently; lines feed the raw log and the last one
    // becomes the error message on a non-zero exit.
    let stderr_handle = child.stderr.take().map(|stderr| {
        let sink = sink.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut collected: Vec<String> = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                sink.append(&line);
                collected.push(line);
            }
            collected
        })
    });

    let mut collector = StreamCollector::default();
    let mut throttle = Throttle::new();
    let mut cancel = ctx.cancel.clone();
    let mut cancelled = false;
    // Once the sender side is gone, stop polling `changed()`: a closed
    // channel resolves immediately and would spin the select loop.
    let mut cancel_closed = false;
    let mut kill_deadline: Option<Instant> = None;

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let deadline = kill_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(24 * 60 * 60));
            tokio::select! {
                changed = cancel.changed(), if !cancelled && !cancel_closed => {
                    match changed {
                        Ok(()) if *cancel.borrow() => {
                            cancelled = true;
                            process_registry::terminate(&key);
                            kill_deadline = Some(Instant::now() + KILL_GRACE);
                        }
                        Ok(()) => {}
                        Err(_) => cancel_closed = true,
                    }
                }
                _ = tokio::time::sleep_until(deadline), if kill_deadline.is_some() => {
                    process_registry::kill(&key);
                    let _ = child.start_kill();
                    kill_deadline = None;
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            sink.append(&line);
                            event_sink.append(&line);
                            let (log_events, force) = collector.ingest(&line);
                            if let Some(tx) = &ctx.events {
                                for event in log_events {
                                    let _ = tx.send(event.for_run(&ctx.run_id)).await;
                                }
                            }
                            if let Some(hook) = &ctx.progress_hook {
                                if throttle.ready(force) {
                                    hook(collector.snapshot(&step.agent, false));
                                }
                            }
                        }
                        _ => break,
                    }
                }
            }
        }
    }

    let status = child.wait().await;
    process_registry::unregister(&key);

    let stderr_lines = match stderr_handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Vec::new(),
    };

    let exit_code = if cancelled {
        StepResult::EXIT_CANCELLED
    } else {
        match status {
            Ok(status) => status.code().unwrap_or(1),
            Err(_) => 1,
        }
    };
    result.exit_code = exit_code;

    if cancelled {
        result.error = Some("cancelled".to_string());
    } else if exit_code != 0 {
        let detail = stderr_lines
            .iter()
            .rev()
            .find(|l| !l.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| format!("runner exited with code {}", exit_code));
        result.error = Some(detail);
    } else {
        // Exit 0 can still hide an unrecovered trailing tool failure.
        let detection = detect_trailing_error(&collector.messages);
        if detection.has_error {
            result.exit_code = 1;
            result.error = detection.reason;
        }
    }

    let ended_at = Utc::now();
    let duration_ms = started.elapsed().as_millis() as u64;
    result.usage = collector.usage;
    result.progress = ProgressSummary {
        tool_calls: collector.tool_calls,
        tokens: collector.usage.total_tokens,
        duration_ms,
    };

    let full_output = std::mem::take(&mut collector.output_text);

    let meta = ArtifactMeta {
        agent: step.agent.clone(),
        model: step.model.clone(),
        exit_code: result.exit_code,
        started_at,
        ended_at,
        duration_ms,
        usage: result.usage,
        skills: result.skills.clone(),
    };
    match write_step_artifacts(
        &ctx.artifacts,
        &ctx.run_id,
        &step.agent,
        ctx.index,
        &step.task,
        &full_output,
        &meta,
    ) {
        Ok(paths) => result.artifact_paths = paths,
        Err(e) => result
            .warnings
            .push(format!("failed to write artifacts: {:#}", e)),
    }

    let saved_to = if result.artifact_paths.is_empty() {
        None
    } else {
        output_artifact_path(&ctx.artifacts, &ctx.run_id, &step.agent, ctx.index)
    };
    let (display, truncation) = truncate_display(&full_output, &ctx.limits, saved_to.as_deref());
    result.output = display;
    result.truncation = truncation;
    result.messages = collector.messages;

    if let Some(hook) = &ctx.progress_hook {
        let mut snapshot = LiveAgentProgress {
            agent: step.agent.clone(),
            tool_calls: result.progress.tool_calls,
            tokens: result.progress.tokens,
            last_event: None,
            done: true,
        };
        snapshot.last_event = result.error.clone();
        hook(snapshot);
    }

    result
}
