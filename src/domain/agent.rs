//! Agent definitions consumed by the engine.
//!
//! An [`AgentSpec`] is immutable at execution time: the engine reads it to
//! resolve models, skills, tools, and output targets, but never writes back.
//! Discovery and persistence live behind the store (see [`crate::store`]).

use serde::{Deserialize, Serialize};

/// Thinking effort level, appended to the model id as a `:<level>` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ThinkingLevel {
    /// All suffixes recognized on a model id. A model that already carries
    /// one of these keeps it, regardless of the agent's configured level.
    pub const KNOWN_SUFFIXES: [&'static str; 6] =
        ["off", "minimal", "low", "medium", "high", "xhigh"];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThinkingLevel::Off => "off",
            ThinkingLevel::Minimal => "minimal",
            ThinkingLevel::Low => "low",
            ThinkingLevel::Medium => "medium",
            ThinkingLevel::High => "high",
            ThinkingLevel::Xhigh => "xhigh",
        }
    }
}

impl std::fmt::Display for ThinkingLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where an agent definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentSource {
    Builtin,
    #[default]
    User,
    Project,
}

/// Extension sandbox policy.
///
/// Three-state: absent means the runner inherits its full extension set,
/// an empty list disables extensions entirely (`--no-extensions`), and a
/// non-empty list is passed through as an allowlist.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<Vec<String>>", into = "Option<Vec<String>>")]
pub enum ExtensionPolicy {
    #[default]
    Inherit,
    Disabled,
    Allow(Vec<String>),
}

impl From<Option<Vec<String>>> for ExtensionPolicy {
    fn from(value: Option<Vec<String>>) -> Self {
        match value {
            None => ExtensionPolicy::Inherit,
            Some(list) if list.is_empty() => ExtensionPolicy::Disabled,
            Some(list) => ExtensionPolicy::Allow(list),
        }
    }
}

impl From<ExtensionPolicy> for Option<Vec<String>> {
    fn from(value: ExtensionPolicy) -> Self {
        match value {
            ExtensionPolicy::Inherit => None,
            ExtensionPolicy::Disabled => Some(Vec::new()),
            ExtensionPolicy::Allow(list) => Some(list),
        }
    }
}

impl ExtensionPolicy {
    pub fn is_inherit(&self) -> bool {
        matches!(self, ExtensionPolicy::Inherit)
    }
}

/// A named agent configuration.
///
/// `mcp_direct_tools` distinguishes "not configured" (`None`, the runner
/// inherits) from "explicitly none" (`Some(vec![])`, sent to the runner as
/// the `__none__` sentinel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,

    #[serde(default)]
    pub system_prompt: String,

    /// Provider-qualified model id (e.g. `anthropic/claude-opus-4`).
    pub model: String,

    #[serde(default)]
    pub thinking: ThinkingLevel,

    #[serde(default)]
    pub tools: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_direct_tools: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "ExtensionPolicy::is_inherit")]
    pub extensions: ExtensionPolicy,

    /// Skill names injected into the system prompt by default.
    #[serde(default)]
    pub skills: Vec<String>,

    /// Default artifact filename for this agent's output, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    #[serde(default)]
    pub default_reads: Vec<String>,

    #[serde(default)]
    pub default_progress: bool,

    #[serde(default)]
    pub source: AgentSource,
}

impl AgentSpec {
    /// Minimal spec used by tests and the management `create` path.
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: String::new(),
            model: model.into(),
            thinking: ThinkingLevel::Off,
            tools: Vec::new(),
            mcp_direct_tools: None,
            extensions: ExtensionPolicy::Inherit,
            skills: Vec::new(),
            output: None,
            default_reads: Vec::new(),
            default_progress: false,
            source: AgentSource::User,
        }
    }
}
