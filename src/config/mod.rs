//! Engine settings.
//!
//! Loaded from `~/.convoy/config.toml`, auto-created with defaults on first
//! use. Writes are atomic (tmp + rename) behind an exclusive lock file so a
//! CLI invocation and a long-lived session can't corrupt each other.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

fn default_runner() -> String {
    "pi".to_string()
}

fn default_history_limit() -> usize {
    100
}

fn data_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".convoy")
}

fn default_async_root() -> PathBuf {
    data_root().join("async")
}

fn default_results_root() -> PathBuf {
    data_root().join("results")
}

fn default_chain_root() -> PathBuf {
    data_root().join("chains-work")
}

fn default_artifacts_root() -> PathBuf {
    data_root().join("artifacts")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Runner executable name or path.
    #[serde(default = "default_runner")]
    pub runner_binary: String,

    #[serde(default = "default_async_root")]
    pub async_root: PathBuf,

    #[serde(default = "default_results_root")]
    pub results_root: PathBuf,

    #[serde(default = "default_chain_root")]
    pub chain_root: PathBuf,

    #[serde(default = "default_artifacts_root")]
    pub artifacts_root: PathBuf,

    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            runner_binary: default_runner(),
            async_root: default_async_root(),
            results_root: default_results_root(),
            chain_root: default_chain_root(),
            artifacts_root: default_artifacts_root(),
            history_limit: default_history_limit(),
        }
    }
}

impl Settings {
    pub fn config_path() -> PathBuf {
        data_root().join("config.toml")
    }

    /// Settings rooted entirely under `root`; used by tests and embeddings
    /// that must not touch the user's home directory.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            runner_binary: default_runner(),
            async_root: root.join("async"),
            results_root: root.join("results"),
            chain_root: root.join("chains-work"),
            artifacts_root: root.join("artifacts"),
            history_limit: default_history_limit(),
        }
    }

    /// Load from the given path (default location when `None`), creating
    /// the file with defaults on first use.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::config_path);
        if !path.exists() {
            let settings = Self::default();
            settings.save_to(&path)?;
            return Ok(settings);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Save with an exclusive lock and atomic replace.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize settings")?;

        let lock_path = path.with_extension("toml.lock");
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;
        lock_file
            .lock_exclusive()
            .context("Failed to acquire config lock")?;

        let temp_path = path.with_extension("toml.tmp");
        let mut temp_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
        temp_file
            .write_all(content.as_bytes())
            .context("Failed to write settings")?;
        temp_file.sync_all().context("Failed to sync settings")?;

        std::fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename config file: {}", path.display()))
        // Lock released when lock_file drops.
    }
}
