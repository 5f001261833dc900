//! The execution engine.
//!
//! [`Engine`] owns the process-global mutable state: the background job
//! registry, the run history, and the session identity. Session events
//! drive its reset; everything else flows through [`Engine::execute`].

pub mod artifacts;
pub mod chain;
pub mod depth;
pub mod detect;
mod dispatcher;
pub mod executor;
pub mod output;
pub mod parallel;
pub mod process_registry;
pub mod resolve;
pub mod template;

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::background::{BackgroundRegistry, SubagentEvent};
use crate::config::Settings;
use crate::store::AgentStore;

/// Chain-run directories older than this are swept at engine startup.
const CHAIN_DIR_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// One line of the bounded run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    /// First 80 chars of the resolved task.
    pub task_prefix: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

struct RunHistory {
    entries: VecDeque<HistoryEntry>,
    cap: usize,
    path: PathBuf,
}

impl RunHistory {
    fn record(&mut self, entry: HistoryEntry) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(line) = serde_json::to_string(&entry) {
            if let Ok(mut file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
            {
                let _ = writeln!(file, "{}", line);
            }
        }
        self.entries.push_back(entry);
        while self.entries.len() > self.cap {
            self.entries.pop_front();
        }
    }
}

struct SessionState {
    base_cwd: PathBuf,
    session_id: Option<String>,
}

/// The engine: dispatcher entry point plus lifetime-managed global state.
pub struct Engine {
    pub(crate) settings: Settings,
    pub(crate) store: Arc<dyn AgentStore>,
    registry: BackgroundRegistry,
    history: Mutex<RunHistory>,
    session: Mutex<SessionState>,
    run_counter: AtomicU64,
}

impl Engine {
    /// Build an engine. The returned receiver carries `subagent:started` /
    /// `subagent:complete` events for the widget layer.
    pub fn new(
        settings: Settings,
        store: Arc<dyn AgentStore>,
        base_cwd: PathBuf,
        session_id: Option<String>,
    ) -> (Self, mpsc::UnboundedReceiver<SubagentEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let registry = BackgroundRegistry::new(
            settings.results_root.clone(),
            base_cwd.clone(),
            session_id.clone(),
            event_tx,
        );
        let history_path = settings.artifacts_root.join("history.jsonl");
        let history_limit = settings.history_limit;

        let engine = Self {
            settings,
            store,
            registry,
            history: Mutex::new(RunHistory {
                entries: VecDeque::new(),
                cap: history_limit,
                path: history_path,
            }),
            session: Mutex::new(SessionState {
                base_cwd,
                session_id,
            }),
            run_counter: AtomicU64::new(1),
        };
        (engine, event_rx)
    }

    /// Start background machinery and sweep stale on-disk state. Requires a
    /// tokio runtime.
    pub fn start(&self) {
        artifacts::sweep_stale_dirs(&self.settings.chain_root, CHAIN_DIR_MAX_AGE);
        artifacts::sweep_stale_dirs(&self.settings.artifacts_root, artifacts::DEFAULT_MAX_AGE);
        self.registry.start();
    }

    pub fn registry(&self) -> &BackgroundRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Session start/switch/branch: reset in-memory state, rebind the
    /// session identity, and sweep stale artifact directories. On-disk
    /// state of in-flight background runs is never touched.
    pub fn session_reset(&self, base_cwd: PathBuf, session_id: Option<String>) {
        {
            let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
            session.base_cwd = base_cwd.clone();
            session.session_id = session_id.clone();
        }
        self.registry.session_reset(base_cwd, session_id);
        artifacts::sweep_stale_dirs(&self.settings.artifacts_root, artifacts::DEFAULT_MAX_AGE);
    }

    pub fn shutdown(&self) {
        self.registry.shutdown();
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        let guard = self.history.lock().unwrap_or_else(|e| e.into_inner());
        guard.entries.iter().cloned().collect()
    }

    pub(crate) fn session_id(&self) -> Option<String> {
        let guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
        guard.session_id.clone()
    }

    pub(crate) fn next_run_id(&self) -> String {
        let n = self.run_counter.fetch_add(1, Ordering::SeqCst);
        format!(
            "run-{}-{}-{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            std::process::id(),
            n
        )
    }

    pub(crate) fn record_history(&self, agent: &str, task: &str, exit_code: i32, duration_ms: u64) {
        let entry = HistoryEntry {
            timestamp: Utc::now(),
            agent: agent.to_string(),
            task_prefix: task.chars().take(80).collect(),
            exit_code,
            duration_ms,
        };
        let mut guard = self.history.lock().unwrap_or_else(|e| e.into_inner());
        guard.record(entry);
    }
}
