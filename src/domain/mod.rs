//! Core domain types shared across the engine, background worker, and CLI.

mod agent;
mod log_event;
mod request;
mod result;
mod status;

pub use agent::{AgentSource, AgentSpec, ExtensionPolicy, ThinkingLevel};
pub use log_event::{LogEvent, LogEventKind};
pub use request::{
    AgentScope, ChainStep, NormalizeError, OutputSpec, ParallelStep, Request, RequestKind,
    RunOverrides, SequentialStep, SkillSpec, TaskSpec,
};
pub use result::{
    ArtifactSummary, Details, FailureKind, LiveAgentProgress, MessageRecord, ProgressSummary,
    StepResult, Truncation, Usage,
};
pub use status::{
    BackgroundStatus, JobState, ResultEntry, StepEntry, StepState, TerminalResult,
};
