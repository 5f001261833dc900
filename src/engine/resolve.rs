//! Step resolution: agent defaults + per-run overrides → a [`ResolvedStep`].
//!
//! Everything the runner will see is decided here: the effective model with
//! its thinking suffix, the system prompt with skill blocks injected, the
//! output target with its `[Write to]` instruction, and the sandbox lists.

use std::path::{Path, PathBuf};

use crate::domain::{AgentSpec, OutputSpec, RunOverrides, SkillSpec};
use crate::runner::ResolvedStep;
use crate::store::SkillSource;

use super::template::apply_thinking_suffix;

/// Resolve one step against its agent's defaults.
pub fn resolve_step(
    agent: &AgentSpec,
    task: &str,
    overrides: &RunOverrides,
    skills: &dyn SkillSource,
    cwd: &Path,
) -> ResolvedStep {
    let mut warnings = Vec::new();

    let model = overrides
        .model
        .clone()
        .unwrap_or_else(|| agent.model.clone());
    let model = apply_thinking_suffix(&model, agent.thinking);

    let skill_names = effective_skills(agent, &overrides.skills);
    let (system_prompt, resolved_skills) =
        inject_skills(&agent.system_prompt, &skill_names, skills, &mut warnings);

    let output_file = resolve_output(agent, &overrides.output, cwd);

    let reads: Vec<PathBuf> = overrides
        .reads
        .clone()
        .unwrap_or_else(|| agent.default_reads.clone())
        .into_iter()
        .map(|p| absolutize(Path::new(&p), cwd))
        .collect();

    let mut task = task.to_string();
    if let Some(path) = &output_file {
        task = format!("[Write to: {}]\n{}", path.display(), task);
    }
    if !reads.is_empty() {
        let joined: Vec<String> = reads.iter().map(|p| p.display().to_string()).collect();
        task = format!("[Read from: {}]\n{}", joined.join(", "), task);
    }

    ResolvedStep {
        agent: agent.name.clone(),
        model,
        task,
        system_prompt,
        skills: resolved_skills,
        tools: agent.tools.clone(),
        mcp_direct_tools: agent.mcp_direct_tools.clone(),
        extensions: agent.extensions.clone(),
        output_file,
        progress: overrides.progress.unwrap_or(agent.default_progress),
        warnings,
    }
}

/// Override > agent default > none, deduplicated by first occurrence.
fn effective_skills(agent: &AgentSpec, spec: &SkillSpec) -> Vec<String> {
    let names = match spec {
        SkillSpec::Disabled => return Vec::new(),
        SkillSpec::Default => agent.skills.clone(),
        SkillSpec::Explicit(names) => names.clone(),
    };
    let mut seen = std::collections::HashSet::new();
    names
        .into_iter()
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Append `<skill name="...">` blocks to the system prompt. Missing skills
/// produce a warning, not a failure.
fn inject_skills(
    system_prompt: &str,
    names: &[String],
    skills: &dyn SkillSource,
    warnings: &mut Vec<String>,
) -> (String, Vec<String>) {
    let mut prompt = system_prompt.to_string();
    let mut resolved = Vec::new();

    for name in names {
        match skills.load_skill(name) {
            Some(content) => {
                prompt.push_str(&format!("\n\n<skill name=\"{}\">\n{}\n</skill>", name, content));
                resolved.push(name.clone());
            }
            None => warnings.push(format!("skill '{}' not found", name)),
        }
    }
    (prompt, resolved)
}

fn resolve_output(agent: &AgentSpec, spec: &OutputSpec, cwd: &Path) -> Option<PathBuf> {
    let raw = match spec {
        OutputSpec::Disabled => return None,
        OutputSpec::Path(path) => path.clone(),
        OutputSpec::Default => agent.output.clone()?,
    };
    Some(absolutize(Path::new(&raw), cwd))
}

fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}
