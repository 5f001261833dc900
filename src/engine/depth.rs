//! Nesting depth guard.
//!
//! Every engine call propagates an incremented `SUBAGENT_DEPTH` into the
//! runner's environment; the guard refuses to dispatch once the configured
//! cap is reached, which breaks cyclic agent-calls-agent recursion without
//! any reference tracking.

/// Set by the engine when spawning a runner; never by the user.
pub const DEPTH_ENV: &str = "SUBAGENT_DEPTH";

/// User-settable cap. Default 2; 0 disables nesting entirely.
pub const MAX_DEPTH_ENV: &str = "SUBAGENT_MAX_DEPTH";

pub const DEFAULT_MAX_DEPTH: u32 = 2;

/// Depth of the current process, 0 when not nested.
pub fn current_depth() -> u32 {
    read_env(DEPTH_ENV).unwrap_or(0)
}

pub fn max_depth() -> u32 {
    read_env(MAX_DEPTH_ENV).unwrap_or(DEFAULT_MAX_DEPTH)
}

/// Depth value to place in a spawned runner's environment.
pub fn child_depth() -> u32 {
    current_depth() + 1
}

/// Check whether another nesting level is allowed. Returns the
/// instructional error message when blocked.
pub fn check() -> Result<(), String> {
    let depth = current_depth();
    let cap = max_depth();
    if depth >= cap {
        return Err(format!(
            "Nested subagent call blocked: depth {} has reached the limit of {}. \
             Raise {} to allow deeper nesting.",
            depth, cap, MAX_DEPTH_ENV
        ));
    }
    Ok(())
}

fn read_env(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
