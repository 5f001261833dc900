//! Execution requests and dispatcher-boundary normalization.
//!
//! Callers hand the engine loosely-shaped values for `skill` and `output`
//! (booleans, strings, lists, or nothing at all). The dispatcher normalizes
//! them into the tagged unions here before anything executes; downstream
//! code never sees the loose shapes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error produced when a loose request field has an unusable shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeError {
    pub field: &'static str,
    pub found: String,
}

impl NormalizeError {
    fn new(field: &'static str, found: &Value) -> Self {
        Self {
            field,
            found: found.to_string(),
        }
    }
}

impl std::fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid shape for '{}': {}", self.field, self.found)
    }
}

impl std::error::Error for NormalizeError {}

/// Skill selection for a run.
///
/// On the wire this is the loose union callers actually send: `false`,
/// `true`, a name, a list of names, or nothing. [`SkillSpec::normalize`]
/// is the serde boundary; the engine only ever sees the tagged form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SkillSpec {
    /// `false`: no skills, not even the agent's defaults.
    Disabled,
    /// `true` or absent: inherit the agent's default skill list.
    #[default]
    Default,
    /// A name or list of names replacing the agent's defaults.
    Explicit(Vec<String>),
}

impl SkillSpec {
    /// Normalize the loose wire shape: `false` | `true` | absent | name | list.
    pub fn normalize(value: Option<&Value>) -> Result<Self, NormalizeError> {
        match value {
            None | Some(Value::Null) => Ok(SkillSpec::Default),
            Some(Value::Bool(false)) => Ok(SkillSpec::Disabled),
            Some(Value::Bool(true)) => Ok(SkillSpec::Default),
            Some(Value::String(name)) => Ok(SkillSpec::Explicit(vec![name.clone()])),
            Some(Value::Array(items)) => {
                let mut names = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(name) => names.push(name.clone()),
                        other => return Err(NormalizeError::new("skill", other)),
                    }
                }
                Ok(SkillSpec::Explicit(names))
            }
            Some(other) => Err(NormalizeError::new("skill", other)),
        }
    }
}

impl Serialize for SkillSpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SkillSpec::Disabled => serializer.serialize_bool(false),
            SkillSpec::Default => serializer.serialize_bool(true),
            SkillSpec::Explicit(names) => names.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for SkillSpec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Option::<Value>::deserialize(deserializer)?;
        SkillSpec::normalize(value.as_ref()).map_err(serde::de::Error::custom)
    }
}

/// Output target for a run. Same loose wire union as [`SkillSpec`]:
/// `false`, `true`, a path string, or nothing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputSpec {
    /// `false`: no artifact, no `[Write to]` instruction.
    Disabled,
    /// `true` or absent: the agent's default output filename.
    #[default]
    Default,
    /// Explicit path; relative paths resolve against the request cwd.
    Path(String),
}

impl OutputSpec {
    pub fn normalize(value: Option<&Value>) -> Result<Self, NormalizeError> {
        match value {
            None | Some(Value::Null) => Ok(OutputSpec::Default),
            Some(Value::Bool(false)) => Ok(OutputSpec::Disabled),
            Some(Value::Bool(true)) => Ok(OutputSpec::Default),
            Some(Value::String(path)) => Ok(OutputSpec::Path(path.clone())),
            Some(other) => Err(NormalizeError::new("output", other)),
        }
    }
}

impl Serialize for OutputSpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            OutputSpec::Disabled => serializer.serialize_bool(false),
            OutputSpec::Default => serializer.serialize_bool(true),
            OutputSpec::Path(path) => serializer.serialize_str(path),
        }
    }
}

impl<'de> Deserialize<'de> for OutputSpec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Option::<Value>::deserialize(deserializer)?;
        OutputSpec::normalize(value.as_ref()).map_err(serde::de::Error::custom)
    }
}

/// Per-run overrides layered on top of an agent's defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOverrides {
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub skills: SkillSpec,

    #[serde(default)]
    pub output: OutputSpec,

    /// Files the step should read before starting.
    #[serde(default)]
    pub reads: Option<Vec<String>>,

    /// Whether the step participates in the shared progress file.
    #[serde(default)]
    pub progress: Option<bool>,
}

/// One agent invocation with an explicit task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub agent: String,
    pub task: String,
    #[serde(default)]
    pub overrides: RunOverrides,
}

/// A sequential chain step. `task` defaults to `{previous}` when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequentialStep {
    pub agent: String,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub overrides: RunOverrides,
}

/// A parallel fan-out group inside a chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelStep {
    #[serde(rename = "parallel")]
    pub tasks: Vec<SequentialStep>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub fail_fast: bool,
}

/// A chain step: sequential, or a parallel group.
///
/// Untagged on the wire; an object carrying a `parallel` key is a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChainStep {
    Parallel(ParallelStep),
    Sequential(SequentialStep),
}

impl ChainStep {
    /// Number of flattened step rows this step expands to.
    pub fn flat_len(&self) -> usize {
        match self {
            ChainStep::Sequential(_) => 1,
            ChainStep::Parallel(group) => group.tasks.len(),
        }
    }

    /// The token used for this step in `Details::chain_agents`.
    pub fn agent_token(&self) -> String {
        match self {
            ChainStep::Sequential(step) => step.agent.clone(),
            ChainStep::Parallel(group) => {
                let names: Vec<&str> = group.tasks.iter().map(|t| t.agent.as_str()).collect();
                format!("[{}]", names.join("+"))
            }
        }
    }
}

/// Which agent store scopes to resolve names against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentScope {
    User,
    Project,
    /// Project shadows user on name collision.
    #[default]
    Both,
}

/// The execution shape of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Single(TaskSpec),
    Parallel {
        tasks: Vec<TaskSpec>,
    },
    Chain {
        steps: Vec<ChainStep>,
        /// Original request task, referenced by the `{task}` variable.
        #[serde(default)]
        task: Option<String>,
    },
}

fn default_true() -> bool {
    true
}

/// A fully-formed engine request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub kind: RequestKind,

    pub cwd: PathBuf,

    /// Whether the upstream surface ran its clarification dialog. The engine
    /// only observes the final boolean: a clarifying request cannot detach.
    #[serde(default)]
    pub clarify: bool,

    #[serde(default)]
    pub background: bool,

    /// Display-output byte cap override; line cap stays at the default.
    #[serde(default)]
    pub max_output: Option<usize>,

    #[serde(default = "default_true")]
    pub artifacts_enabled: bool,

    /// Explicit persistent chain directory. Exempt from the startup sweep.
    #[serde(default)]
    pub chain_dir: Option<PathBuf>,

    #[serde(default)]
    pub session_dir: Option<PathBuf>,

    #[serde(default)]
    pub agent_scope: AgentScope,

    #[serde(default)]
    pub session_id: Option<String>,

    /// Management short-circuit; set programmatically, never on the wire.
    #[serde(skip)]
    pub action: Option<crate::store::ManageAction>,
}

impl Request {
    pub fn single(agent: impl Into<String>, task: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            kind: RequestKind::Single(TaskSpec {
                agent: agent.into(),
                task: task.into(),
                overrides: RunOverrides::default(),
            }),
            cwd: cwd.into(),
            clarify: false,
            background: false,
            max_output: None,
            artifacts_enabled: true,
            chain_dir: None,
            session_dir: None,
            agent_scope: AgentScope::Both,
            session_id: None,
            action: None,
        }
    }

    pub fn chain(steps: Vec<ChainStep>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            kind: RequestKind::Chain { steps, task: None },
            cwd: cwd.into(),
            clarify: false,
            background: false,
            max_output: None,
            artifacts_enabled: true,
            chain_dir: None,
            session_dir: None,
            agent_scope: AgentScope::Both,
            session_id: None,
            action: None,
        }
    }

    pub fn parallel(tasks: Vec<TaskSpec>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            kind: RequestKind::Parallel { tasks },
            cwd: cwd.into(),
            clarify: false,
            background: false,
            max_output: None,
            artifacts_enabled: true,
            chain_dir: None,
            session_dir: None,
            agent_scope: AgentScope::Both,
            session_id: None,
            action: None,
        }
    }
}
