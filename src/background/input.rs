//! Worker input: the file-based contract between the engine and the
//! detached background worker process.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::runner::ResolvedStep;

fn default_placeholder() -> String {
    "{previous}".to_string()
}

/// One flattened-and-typed worker step. Sequential steps arrive fully
/// resolved except for the previous-output placeholder, which only the
/// worker can substitute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerStep {
    Parallel {
        parallel: Vec<ResolvedStep>,
        #[serde(default)]
        concurrency: Option<usize>,
        #[serde(default)]
        fail_fast: bool,
    },
    Sequential(ResolvedStep),
}

impl WorkerStep {
    pub fn flat_len(&self) -> usize {
        match self {
            WorkerStep::Sequential(_) => 1,
            WorkerStep::Parallel { parallel, .. } => parallel.len(),
        }
    }
}

/// The input JSON handed to the worker process via argv.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInput {
    pub id: String,
    /// "single" | "chain".
    pub mode: String,
    pub steps: Vec<WorkerStep>,
    pub result_path: PathBuf,
    pub cwd: PathBuf,
    /// Literal substring replaced with the previous step's output.
    #[serde(default = "default_placeholder")]
    pub placeholder: String,
    pub runner: PathBuf,
    #[serde(default)]
    pub max_output: Option<usize>,
    #[serde(default)]
    pub artifacts_dir: Option<PathBuf>,
    #[serde(default)]
    pub capture_events: bool,
    #[serde(default)]
    pub session_dir: Option<PathBuf>,
    pub async_dir: PathBuf,
    #[serde(default)]
    pub chain_dir: Option<PathBuf>,
    #[serde(default)]
    pub session_id: Option<String>,
}
