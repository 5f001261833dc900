//! Shared test utilities: stub runners that replay canned JSONL.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use convoy::config::Settings;
use convoy::domain::AgentSpec;
use convoy::store::MemoryStore;
use convoy::Engine;
use tempfile::TempDir;

/// Write an executable shell script into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("Failed to write stub runner");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("Failed to chmod stub runner");
    }
    path
}

/// A runner that emits one assistant text message and exits 0.
pub fn text_runner(dir: &Path, text: &str) -> PathBuf {
    write_script(
        dir,
        "runner.sh",
        &format!(
            "#!/bin/sh\nprintf '%s\\n' '{{\"type\":\"message_end\",\"message\":{{\"content\":[{{\"type\":\"text\",\"text\":\"{}\"}}]}},\"usage\":{{\"input_tokens\":10,\"output_tokens\":5}}}}'\nexit 0\n",
            text
        ),
    )
}

/// A runner that echoes its positional task back as assistant text.
pub fn echo_task_runner(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "echo-runner.sh",
        "#!/bin/sh\nfor last in \"$@\"; do :; done\nprintf '{\"type\":\"message_end\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"%s\"}]}}\\n' \"$last\"\nexit 0\n",
    )
}

/// Engine wired to a temp root, a stub runner, and an in-memory store.
pub fn engine_with(
    tmp: &TempDir,
    runner: &Path,
    agents: Vec<AgentSpec>,
) -> (Engine, Arc<MemoryStore>) {
    let mut settings = Settings::rooted_at(tmp.path());
    settings.runner_binary = runner.display().to_string();

    let store = Arc::new(MemoryStore::new());
    for agent in agents {
        store.add_agent(agent);
    }

    let (engine, _events) = Engine::new(
        settings,
        Arc::clone(&store) as Arc<dyn convoy::store::AgentStore>,
        tmp.path().to_path_buf(),
        None,
    );
    (engine, store)
}

pub fn cancel_rx() -> tokio::sync::watch::Receiver<bool> {
    let (tx, rx) = tokio::sync::watch::channel(false);
    // Keep the sender alive for the duration of the test process.
    std::mem::forget(tx);
    rx
}
