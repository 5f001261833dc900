//! Management interface: thin, pure handlers over the agent/chain store.
//!
//! All validation runs before any mutation. Warnings (dangling chain
//! references, unknown models) never block the operation.

use anyhow::{bail, Result};

use crate::domain::{AgentSpec, ExtensionPolicy, ThinkingLevel};

use super::{AgentStore, ChainSpec, StoreScope};

/// Partial update for an agent. `None` keeps the current value; for string
/// fields an explicit empty string clears them.
#[derive(Debug, Clone, Default)]
pub struct AgentPatch {
    /// Rename target (sanitized before use).
    pub name: Option<String>,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub thinking: Option<ThinkingLevel>,
    pub tools: Option<Vec<String>>,
    pub mcp_direct_tools: Option<Option<Vec<String>>>,
    pub extensions: Option<ExtensionPolicy>,
    pub skills: Option<Vec<String>>,
    /// `Some("")` clears the default output.
    pub output: Option<String>,
    pub default_reads: Option<Vec<String>>,
    pub default_progress: Option<bool>,
}

#[derive(Debug, Clone)]
pub enum ManageAction {
    List {
        scope: StoreScope,
    },
    Get {
        name: String,
        scope: StoreScope,
    },
    Create {
        agent: AgentSpec,
        scope: StoreScope,
    },
    Update {
        name: String,
        scope: StoreScope,
        patch: AgentPatch,
    },
    Delete {
        name: String,
        scope: StoreScope,
    },
}

#[derive(Debug, Default)]
pub struct ManageOutcome {
    pub message: String,
    pub warnings: Vec<String>,
    pub agents: Vec<AgentSpec>,
    pub chains: Vec<ChainSpec>,
}

/// Sanitize a user-supplied name: lowercase, keep `[a-z0-9-]`, collapse
/// hyphen runs, trim edge hyphens. An empty result is an error.
pub fn sanitize_name(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut last_hyphen = false;
    for c in raw.to_lowercase().chars() {
        let c = match c {
            'a'..='z' | '0'..='9' => c,
            '-' | '_' | ' ' => '-',
            _ => continue,
        };
        if c == '-' {
            if last_hyphen {
                continue;
            }
            last_hyphen = true;
        } else {
            last_hyphen = false;
        }
        out.push(c);
    }
    let out = out.trim_matches('-').to_string();
    if out.is_empty() {
        bail!("name '{}' sanitizes to nothing", raw);
    }
    Ok(out)
}

/// Chains in `scope` that reference `agent_name`.
fn chains_referencing(
    store: &dyn AgentStore,
    scope: StoreScope,
    agent_name: &str,
) -> Result<Vec<String>> {
    Ok(store
        .list_chains(scope)?
        .into_iter()
        .filter(|chain| chain.steps.iter().any(|s| s.agent == agent_name))
        .map(|chain| chain.name)
        .collect())
}

fn name_taken(store: &dyn AgentStore, scope: StoreScope, name: &str) -> Result<bool> {
    if store.load_agent(name, scope)?.is_some() {
        return Ok(true);
    }
    Ok(store.list_chains(scope)?.iter().any(|c| c.name == name))
}

fn apply_patch(agent: &mut AgentSpec, patch: &AgentPatch) {
    if let Some(prompt) = &patch.system_prompt {
        agent.system_prompt = prompt.clone();
    }
    if let Some(model) = &patch.model {
        agent.model = model.clone();
    }
    if let Some(thinking) = patch.thinking {
        agent.thinking = thinking;
    }
    if let Some(tools) = &patch.tools {
        agent.tools = tools.clone();
    }
    if let Some(mcp) = &patch.mcp_direct_tools {
        agent.mcp_direct_tools = mcp.clone();
    }
    if let Some(extensions) = &patch.extensions {
        agent.extensions = extensions.clone();
    }
    if let Some(skills) = &patch.skills {
        agent.skills = skills.clone();
    }
    if let Some(output) = &patch.output {
        agent.output = if output.is_empty() {
            None
        } else {
            Some(output.clone())
        };
    }
    if let Some(reads) = &patch.default_reads {
        agent.default_reads = reads.clone();
    }
    if let Some(progress) = patch.default_progress {
        agent.default_progress = progress;
    }
}

/// Execute one management action. `known_models` gates the unknown-model
/// warning; an empty registry disables the check.
pub fn manage(
    store: &dyn AgentStore,
    action: ManageAction,
    known_models: &[String],
) -> Result<ManageOutcome> {
    let mut outcome = ManageOutcome::default();

    match action {
        ManageAction::List { scope } => {
            outcome.agents = store.list_agents(scope)?;
            outcome.chains = store.list_chains(scope)?;
            outcome.message = format!(
                "{} agents, {} chains",
                outcome.agents.len(),
                outcome.chains.len()
            );
        }

        ManageAction::Get { name, scope } => {
            let name = sanitize_name(&name)?;
            match store.load_agent(&name, scope)? {
                Some(agent) => {
                    outcome.message = format!("agent '{}'", agent.name);
                    outcome.agents.push(agent);
                }
                None => bail!("agent '{}' not found", name),
            }
        }

        ManageAction::Create { mut agent, scope } => {
            agent.name = sanitize_name(&agent.name)?;
            if agent.model.trim().is_empty() {
                bail!("agent '{}' has no model", agent.name);
            }
            if name_taken(store, scope, &agent.name)? {
                bail!("name '{}' is already used in this scope", agent.name);
            }
            warn_unknown_model(&agent.model, known_models, &mut outcome.warnings);

            store.write_agent(&agent, scope)?;
            outcome.message = format!("created agent '{}'", agent.name);
            outcome.agents.push(agent);
        }

        ManageAction::Update { name, scope, patch } => {
            let name = sanitize_name(&name)?;
            let Some(mut agent) = store.load_agent(&name, scope)? else {
                bail!("agent '{}' not found", name);
            };

            let rename = match &patch.name {
                Some(new_name) => {
                    let new_name = sanitize_name(new_name)?;
                    if new_name != name && name_taken(store, scope, &new_name)? {
                        bail!("name '{}' is already used in this scope", new_name);
                    }
                    (new_name != name).then_some(new_name)
                }
                None => None,
            };

            apply_patch(&mut agent, &patch);
            if agent.model.trim().is_empty() {
                bail!("update would leave agent '{}' without a model", name);
            }
            if let Some(model) = &patch.model {
                warn_unknown_model(model, known_models, &mut outcome.warnings);
            }

            if let Some(new_name) = rename {
                for chain in chains_referencing(store, scope, &name)? {
                    outcome.warnings.push(format!(
                        "chain '{}' still references the old name '{}'",
                        chain, name
                    ));
                }
                agent.name = new_name.clone();
                store.write_agent(&agent, scope)?;
                store.delete_agent(&name, scope)?;
                outcome.message = format!("updated agent '{}' (renamed from '{}')", new_name, name);
            } else {
                store.write_agent(&agent, scope)?;
                outcome.message = format!("updated agent '{}'", name);
            }
            outcome.agents.push(agent);
        }

        ManageAction::Delete { name, scope } => {
            let name = sanitize_name(&name)?;
            if store.load_agent(&name, scope)?.is_none() {
                bail!("agent '{}' not found", name);
            }
            for chain in chains_referencing(store, scope, &name)? {
                outcome
                    .warnings
                    .push(format!("chain '{}' references deleted agent '{}'", chain, name));
            }
            store.delete_agent(&name, scope)?;
            outcome.message = format!("deleted agent '{}'", name);
        }
    }

    Ok(outcome)
}

fn warn_unknown_model(model: &str, known_models: &[String], warnings: &mut Vec<String>) {
    if !known_models.is_empty() && !known_models.iter().any(|m| m == model) {
        warnings.push(format!("model '{}' is not in the model registry", model));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChainStepSpec, MemoryStore};

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("My Agent").unwrap(), "my-agent");
        assert_eq!(sanitize_name("code--review!!").unwrap(), "code-review");
        assert_eq!(sanitize_name("-edge-").unwrap(), "edge");
        assert!(sanitize_name("!!!").is_err());
        assert!(sanitize_name("").is_err());
    }

    #[test]
    fn test_create_and_get() {
        let store = MemoryStore::new();
        let outcome = manage(
            &store,
            ManageAction::Create {
                agent: AgentSpec::new("Scout One", "anthropic/claude-opus-4"),
                scope: StoreScope::User,
            },
            &[],
        )
        .unwrap();
        assert_eq!(outcome.agents[0].name, "scout-one");

        let got = manage(
            &store,
            ManageAction::Get {
                name: "scout-one".to_string(),
                scope: StoreScope::User,
            },
            &[],
        )
        .unwrap();
        assert_eq!(got.agents.len(), 1);
    }

    #[test]
    fn test_create_duplicate_rejected() {
        let store = MemoryStore::new();
        store.add_agent(AgentSpec::new("scout", "m"));
        let err = manage(
            &store,
            ManageAction::Create {
                agent: AgentSpec::new("scout", "m"),
                scope: StoreScope::User,
            },
            &[],
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_uniqueness_spans_chains() {
        let store = MemoryStore::new();
        store
            .write_chain(
                &ChainSpec {
                    name: "review".to_string(),
                    steps: vec![],
                },
                StoreScope::User,
            )
            .unwrap();
        assert!(manage(
            &store,
            ManageAction::Create {
                agent: AgentSpec::new("review", "m"),
                scope: StoreScope::User,
            },
            &[],
        )
        .is_err());
    }

    #[test]
    fn test_update_merges_and_clears() {
        let store = MemoryStore::new();
        let mut agent = AgentSpec::new("scout", "old/model");
        agent.output = Some("notes.md".to_string());
        agent.tools = vec!["Read".to_string()];
        store.add_agent(agent);

        let outcome = manage(
            &store,
            ManageAction::Update {
                name: "scout".to_string(),
                scope: StoreScope::User,
                patch: AgentPatch {
                    model: Some("new/model".to_string()),
                    output: Some(String::new()),
                    ..Default::default()
                },
            },
            &[],
        )
        .unwrap();

        let updated = &outcome.agents[0];
        assert_eq!(updated.model, "new/model");
        assert!(updated.output.is_none());
        // Untouched fields survive the merge.
        assert_eq!(updated.tools, vec!["Read"]);
    }

    #[test]
    fn test_rename_warns_on_chain_references() {
        let store = MemoryStore::new();
        store.add_agent(AgentSpec::new("scout", "m"));
        store
            .write_chain(
                &ChainSpec {
                    name: "pipeline".to_string(),
                    steps: vec![ChainStepSpec {
                        agent: "scout".to_string(),
                        task: None,
                    }],
                },
                StoreScope::User,
            )
            .unwrap();

        let outcome = manage(
            &store,
            ManageAction::Update {
                name: "scout".to_string(),
                scope: StoreScope::User,
                patch: AgentPatch {
                    name: Some("pathfinder".to_string()),
                    ..Default::default()
                },
            },
            &[],
        )
        .unwrap();

        assert!(outcome.warnings.iter().any(|w| w.contains("pipeline")));
        assert!(store.load_agent("scout", StoreScope::User).unwrap().is_none());
        assert!(store
            .load_agent("pathfinder", StoreScope::User)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_delete_warns_on_chain_references() {
        let store = MemoryStore::new();
        store.add_agent(AgentSpec::new("scout", "m"));
        store
            .write_chain(
                &ChainSpec {
                    name: "pipeline".to_string(),
                    steps: vec![ChainStepSpec {
                        agent: "scout".to_string(),
                        task: None,
                    }],
                },
                StoreScope::User,
            )
            .unwrap();

        let outcome = manage(
            &store,
            ManageAction::Delete {
                name: "scout".to_string(),
                scope: StoreScope::User,
            },
            &[],
        )
        .unwrap();
        assert!(outcome.warnings.iter().any(|w| w.contains("pipeline")));
    }

    #[test]
    fn test_unknown_model_is_warning_not_error() {
        let store = MemoryStore::new();
        let outcome = manage(
            &store,
            ManageAction::Create {
                agent: AgentSpec::new("scout", "exotic/model"),
                scope: StoreScope::User,
            },
            &["anthropic/claude-opus-4".to_string()],
        )
        .unwrap();
        assert_eq!(outcome.warnings.len(), 1);
        assert!(store.load_agent("scout", StoreScope::User).unwrap().is_some());
    }

    #[test]
    fn test_validation_precedes_mutation() {
        let store = MemoryStore::new();
        store.add_agent(AgentSpec::new("scout", "m"));
        store.add_agent(AgentSpec::new("taken", "m"));

        // Rename to a taken name fails without touching either agent.
        assert!(manage(
            &store,
            ManageAction::Update {
                name: "scout".to_string(),
                scope: StoreScope::User,
                patch: AgentPatch {
                    name: Some("taken".to_string()),
                    model: Some("changed/model".to_string()),
                    ..Default::default()
                },
            },
            &[],
        )
        .is_err());
        let untouched = store.load_agent("scout", StoreScope::User).unwrap().unwrap();
        assert_eq!(untouched.model, "m");
    }
}
