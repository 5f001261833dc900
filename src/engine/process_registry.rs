//! Process registry for running runner children.
//!
//! Cancellation needs a way to signal the underlying process for a run key
//! from outside the executor's await chain: terminate first, kill after the
//! grace period.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct RunningProcess {
    pub pid: u32,
    pub agent: String,
}

static RUNNING: Lazy<Mutex<HashMap<String, RunningProcess>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn register(key: impl Into<String>, pid: u32, agent: impl Into<String>) {
    let mut guard = RUNNING.lock().unwrap_or_else(|e| e.into_inner());
    guard.insert(
        key.into(),
        RunningProcess {
            pid,
            agent: agent.into(),
        },
    );
}

pub fn unregister(key: &str) {
    let mut guard = RUNNING.lock().unwrap_or_else(|e| e.into_inner());
    guard.remove(key);
}

pub fn get(key: &str) -> Option<RunningProcess> {
    let guard = RUNNING.lock().unwrap_or_else(|e| e.into_inner());
    guard.get(key).cloned()
}

/// Send SIGTERM to the registered process for the given run key.
pub fn terminate(key: &str) -> bool {
    signal(key, Sig::Term)
}

/// Send SIGKILL to the registered process for the given run key.
pub fn kill(key: &str) -> bool {
    signal(key, Sig::Kill)
}

enum Sig {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal(key: &str, sig: Sig) -> bool {
    let Some(proc) = get(key) else {
        return false;
    };
    let signum = match sig {
        Sig::Term => libc::SIGTERM,
        Sig::Kill => libc::SIGKILL,
    };
    unsafe { libc::kill(proc.pid as i32, signum) == 0 }
}

#[cfg(not(unix))]
fn signal(key: &str, _sig: Sig) -> bool {
    // Windows has no signal levels; the executor's kill_on_drop covers it.
    get(key).is_some()
}
