//! Convoy - subagent orchestration engine.
//!
//! Convoy dispatches named agent configurations to an external coding-agent
//! CLI (the runner), streams their output back, and composes runs into
//! larger workflows: single runs, bounded parallel fan-outs, and sequential
//! chains with `{previous}` context threading. Runs execute in the
//! foreground with live progress, or detach into a background worker whose
//! durable status is polled from disk.

pub mod background;
pub mod cli;
pub mod commands;
pub mod config;
pub mod domain;
pub mod engine;
pub mod runner;
pub mod store;

pub use domain::*;
pub use engine::Engine;
