//! In-process tracker of background jobs.
//!
//! A 250 ms poller refreshes each non-terminal job from its `status.json`
//! (mtime-cached), and a debounced filesystem watcher on the results root
//! dispatches completion events exactly once per job. Both are idempotent
//! and survive session resets; watcher failures self-heal by recreating the
//! directory and re-arming after a short delay.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult};
use tokio::sync::mpsc;

use crate::domain::{BackgroundStatus, TerminalResult};

use super::status_file;

/// Poll interval for status.json refreshes.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Debounce window for result-file rename storms.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(50);

/// Delay before a failed watcher is rebuilt.
const WATCHER_RESTART_DELAY: Duration = Duration::from_secs(3);

/// Completed jobs linger this long for the UI before eviction.
const EVICT_AFTER: Duration = Duration::from_secs(10);

/// Window in which a duplicate completion for the same id is suppressed.
const DEDUP_TTL: Duration = Duration::from_secs(10 * 60);

/// Events published to the session's widget layer.
#[derive(Debug, Clone)]
pub enum SubagentEvent {
    Started {
        id: String,
        pid: u32,
        agents: Vec<String>,
        cwd: PathBuf,
        async_dir: PathBuf,
    },
    Complete {
        id: String,
        success: bool,
        result: TerminalResult,
    },
}

/// One tracked background job.
#[derive(Debug, Clone)]
pub struct TrackedJob {
    pub id: String,
    pub async_dir: PathBuf,
    pub agents: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub status: Option<BackgroundStatus>,
    last_mtime: Option<SystemTime>,
    terminal_at: Option<Instant>,
}

struct Inner {
    jobs: HashMap<String, TrackedJob>,
    /// Completion dedup: id → first dispatch time.
    dispatched: HashMap<String, Instant>,
    results_root: PathBuf,
    base_cwd: PathBuf,
    session_id: Option<String>,
    event_tx: mpsc::UnboundedSender<SubagentEvent>,
    watcher_failed: bool,
    watcher_restart_at: Option<Instant>,
}

type Debouncer = notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>;

pub struct BackgroundRegistry {
    inner: Arc<Mutex<Inner>>,
    watcher: Arc<Mutex<Option<Debouncer>>>,
    poller: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BackgroundRegistry {
    pub fn new(
        results_root: PathBuf,
        base_cwd: PathBuf,
        session_id: Option<String>,
        event_tx: mpsc::UnboundedSender<SubagentEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                jobs: HashMap::new(),
                dispatched: HashMap::new(),
                results_root,
                base_cwd,
                session_id,
                event_tx,
                watcher_failed: false,
                watcher_restart_at: None,
            })),
            watcher: Arc::new(Mutex::new(None)),
            poller: Mutex::new(None),
        }
    }

    /// Start the poller and the result watcher. Idempotent.
    pub fn start(&self) {
        arm_watcher(&self.inner, &self.watcher);
        scan_results_dir(&self.inner);

        let mut poller = self.poller.lock().unwrap_or_else(|e| e.into_inner());
        if poller.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let watcher = Arc::clone(&self.watcher);
        *poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                poll_tick(&inner);
                maybe_restart_watcher(&inner, &watcher);
            }
        }));
    }

    /// Track a newly spawned background job and announce it.
    pub fn register(&self, id: &str, async_dir: PathBuf, agents: Vec<String>, pid: u32) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let job = TrackedJob {
            id: id.to_string(),
            async_dir: async_dir.clone(),
            agents: agents.clone(),
            started_at: Utc::now(),
            status: None,
            last_mtime: None,
            terminal_at: None,
        };
        guard.jobs.insert(id.to_string(), job);
        let _ = guard.event_tx.send(SubagentEvent::Started {
            id: id.to_string(),
            pid,
            agents,
            cwd: guard.base_cwd.clone(),
            async_dir,
        });
    }

    /// Snapshot of tracked jobs for the widget layer.
    pub fn jobs(&self) -> Vec<TrackedJob> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut jobs: Vec<TrackedJob> = guard.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        jobs
    }

    /// Session start/switch/branch: drop in-memory state and rebind the
    /// session identity. On-disk state of in-flight runs is untouched.
    pub fn session_reset(&self, base_cwd: PathBuf, session_id: Option<String>) {
        {
            let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            guard.jobs.clear();
            guard.dispatched.clear();
            guard.base_cwd = base_cwd;
            guard.session_id = session_id;
            guard.watcher_failed = false;
            guard.watcher_restart_at = None;
        }
        arm_watcher(&self.inner, &self.watcher);
    }

    /// Stop the poller and watcher.
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .poller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// One-shot scan of the results root, catching files that landed while
    /// no watcher was armed.
    pub fn scan_results(&self) {
        scan_results_dir(&self.inner);
    }

    /// Drive one poll cycle synchronously. Exposed for tests and for
    /// embedders that run their own tick loop.
    pub fn tick(&self) {
        poll_tick(&self.inner);
        maybe_restart_watcher(&self.inner, &self.watcher);
    }
}

/// (Re)create the results watcher. Failure marks the self-heal flag so a
/// later tick re-arms it.
fn arm_watcher(inner: &Arc<Mutex<Inner>>, slot: &Arc<Mutex<Option<Debouncer>>>) {
    let results_root = {
        let guard = inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.results_root.clone()
    };

    if let Err(e) = std::fs::create_dir_all(&results_root) {
        tracing::warn!(
            "Failed to create results root {}: {}",
            results_root.display(),
            e
        );
    }

    let mark_failed = |inner: &Arc<Mutex<Inner>>| {
        let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.watcher_failed = true;
        guard.watcher_restart_at = Some(Instant::now() + WATCHER_RESTART_DELAY);
    };

    let callback_inner = Arc::clone(inner);
    let debouncer = new_debouncer(WATCH_DEBOUNCE, move |res: DebounceEventResult| match res {
        Ok(events) => {
            for event in events {
                handle_result_path(&callback_inner, &event.path);
            }
        }
        Err(e) => {
            tracing::warn!("Result watcher error: {}", e);
            let mut guard = callback_inner.lock().unwrap_or_else(|e| e.into_inner());
            guard.watcher_failed = true;
            guard.watcher_restart_at = Some(Instant::now() + WATCHER_RESTART_DELAY);
        }
    });

    let mut watcher_slot = slot.lock().unwrap_or_else(|e| e.into_inner());
    match debouncer {
        Ok(mut debouncer) => {
            match debouncer
                .watcher()
                .watch(&results_root, notify::RecursiveMode::NonRecursive)
            {
                Ok(()) => *watcher_slot = Some(debouncer),
                Err(e) => {
                    tracing::warn!("Failed to watch {}: {}", results_root.display(), e);
                    mark_failed(inner);
                }
            }
        }
        Err(e) => {
            tracing::warn!("Failed to create watcher: {}", e);
            mark_failed(inner);
        }
    }
}

fn scan_results_dir(inner: &Arc<Mutex<Inner>>) {
    let results_root = {
        let guard = inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.results_root.clone()
    };
    let Ok(entries) = std::fs::read_dir(&results_root) else {
        return;
    };
    for entry in entries.flatten() {
        handle_result_path(inner, &entry.path());
    }
}

/// Re-arm the watcher once the restart backoff has elapsed, then rescan to
/// cover the gap.
fn maybe_restart_watcher(inner: &Arc<Mutex<Inner>>, slot: &Arc<Mutex<Option<Debouncer>>>) {
    let due = {
        let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
        let due = guard.watcher_failed
            && guard
                .watcher_restart_at
                .is_some_and(|at| Instant::now() >= at);
        if due {
            guard.watcher_failed = false;
            guard.watcher_restart_at = None;
        }
        due
    };
    if due {
        arm_watcher(inner, slot);
        scan_results_dir(inner);
    }
}

/// Refresh non-terminal jobs from disk and evict expired terminal ones.
fn poll_tick(inner: &Arc<Mutex<Inner>>) {
    let now = Instant::now();
    let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());

    let mut to_remove = Vec::new();
    for job in guard.jobs.values_mut() {
        if let Some(at) = job.terminal_at {
            if now.duration_since(at) >= EVICT_AFTER {
                to_remove.push(job.id.clone());
            }
            continue;
        }

        let status_path = status_file::status_path(&job.async_dir);
        let mtime = std::fs::metadata(&status_path)
            .and_then(|m| m.modified())
            .ok();
        if mtime.is_some() && mtime == job.last_mtime {
            continue;
        }
        job.last_mtime = mtime;

        match status_file::read_status(&job.async_dir) {
            Ok(status) => {
                let terminal = status.is_terminal();
                job.status = Some(status);
                if terminal {
                    job.terminal_at = Some(now);
                }
            }
            Err(e) => tracing::debug!("Status read failed for {}: {:#}", job.id, e),
        }
    }
    for id in to_remove {
        guard.jobs.remove(&id);
    }

    guard
        .dispatched
        .retain(|_, at| now.duration_since(*at) < DEDUP_TTL);
}

/// Process one candidate result file: filter by session, dedup, dispatch,
/// delete.
fn handle_result_path(inner: &Arc<Mutex<Inner>>, path: &Path) {
    if path.extension().map_or(true, |ext| ext != "json") {
        return;
    }
    if !path.exists() {
        return;
    }

    let Ok(result) = status_file::read_result(path) else {
        return;
    };

    let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());

    // Results belong to this session: match by session id, falling back to
    // cwd when the result carries none.
    let ours = match (&result.session_id, &guard.session_id) {
        (Some(result_session), Some(current)) => result_session == current,
        (None, _) => result.cwd == guard.base_cwd,
        (Some(_), None) => false,
    };
    if !ours {
        return;
    }

    if guard.dispatched.contains_key(&result.id) {
        let _ = std::fs::remove_file(path);
        return;
    }
    guard.dispatched.insert(result.id.clone(), Instant::now());

    if let Some(job) = guard.jobs.get_mut(&result.id) {
        if job.terminal_at.is_none() {
            job.terminal_at = Some(Instant::now());
        }
    }

    let _ = guard.event_tx.send(SubagentEvent::Complete {
        id: result.id.clone(),
        success: result.success,
        result,
    });

    let _ = std::fs::remove_file(path);
}
