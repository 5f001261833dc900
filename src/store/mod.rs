//! Agent/chain store contract.
//!
//! The engine consumes agents and chains through this trait; the management
//! interface mutates through it. Two implementations ship here: an
//! in-memory store for tests and embedding, and a filesystem store that
//! persists agents as markdown files with TOML frontmatter.

mod fs_store;
mod manage;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use crate::domain::{AgentScope, AgentSpec};

pub use fs_store::FsStore;
pub use manage::{manage, sanitize_name, AgentPatch, ManageAction, ManageOutcome};

/// A store-side scope: user-level or project-level. (`AgentScope::Both` is
/// a resolution policy, not a storage location.)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreScope {
    User,
    Project,
}

/// A named chain definition persisted alongside agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSpec {
    pub name: String,
    pub steps: Vec<ChainStepSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStepSpec {
    pub agent: String,
    #[serde(default)]
    pub task: Option<String>,
}

/// Source of skill content injected into system prompts.
pub trait SkillSource: Send + Sync {
    fn load_skill(&self, name: &str) -> Option<String>;
}

/// Persistence contract consumed by the engine and the management layer.
pub trait AgentStore: SkillSource {
    fn list_agents(&self, scope: StoreScope) -> Result<Vec<AgentSpec>>;
    fn list_chains(&self, scope: StoreScope) -> Result<Vec<ChainSpec>>;
    fn load_agent(&self, name: &str, scope: StoreScope) -> Result<Option<AgentSpec>>;
    fn write_agent(&self, agent: &AgentSpec, scope: StoreScope) -> Result<()>;
    fn write_chain(&self, chain: &ChainSpec, scope: StoreScope) -> Result<()>;
    fn delete_agent(&self, name: &str, scope: StoreScope) -> Result<()>;
    fn delete_chain(&self, name: &str, scope: StoreScope) -> Result<()>;
}

/// Resolve the agents visible under a request scope. With `Both`, project
/// definitions shadow user definitions on name collision.
pub fn resolve_scope(
    store: &dyn AgentStore,
    scope: AgentScope,
) -> Result<HashMap<String, AgentSpec>> {
    let mut agents = HashMap::new();
    match scope {
        AgentScope::User => {
            for agent in store.list_agents(StoreScope::User)? {
                agents.insert(agent.name.clone(), agent);
            }
        }
        AgentScope::Project => {
            for agent in store.list_agents(StoreScope::Project)? {
                agents.insert(agent.name.clone(), agent);
            }
        }
        AgentScope::Both => {
            for agent in store.list_agents(StoreScope::User)? {
                agents.insert(agent.name.clone(), agent);
            }
            for agent in store.list_agents(StoreScope::Project)? {
                agents.insert(agent.name.clone(), agent);
            }
        }
    }
    Ok(agents)
}

/// In-memory store used by tests and short-lived embeddings.
#[derive(Default)]
pub struct MemoryStore {
    agents: RwLock<HashMap<(StoreScope, String), AgentSpec>>,
    chains: RwLock<HashMap<(StoreScope, String), ChainSpec>>,
    skills: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_agent(&self, agent: AgentSpec) {
        self.add_agent_scoped(agent, StoreScope::User);
    }

    pub fn add_agent_scoped(&self, agent: AgentSpec, scope: StoreScope) {
        let mut guard = self.agents.write().unwrap_or_else(|e| e.into_inner());
        guard.insert((scope, agent.name.clone()), agent);
    }

    pub fn add_skill(&self, name: impl Into<String>, content: impl Into<String>) {
        let mut guard = self.skills.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(name.into(), content.into());
    }
}

impl SkillSource for MemoryStore {
    fn load_skill(&self, name: &str) -> Option<String> {
        let guard = self.skills.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(name).cloned()
    }
}

impl AgentStore for MemoryStore {
    fn list_agents(&self, scope: StoreScope) -> Result<Vec<AgentSpec>> {
        let guard = self.agents.read().unwrap_or_else(|e| e.into_inner());
        let mut agents: Vec<AgentSpec> = guard
            .iter()
            .filter(|((s, _), _)| *s == scope)
            .map(|(_, a)| a.clone())
            .collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }

    fn list_chains(&self, scope: StoreScope) -> Result<Vec<ChainSpec>> {
        let guard = self.chains.read().unwrap_or_else(|e| e.into_inner());
        let mut chains: Vec<ChainSpec> = guard
            .iter()
            .filter(|((s, _), _)| *s == scope)
            .map(|(_, c)| c.clone())
            .collect();
        chains.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(chains)
    }

    fn load_agent(&self, name: &str, scope: StoreScope) -> Result<Option<AgentSpec>> {
        let guard = self.agents.read().unwrap_or_else(|e| e.into_inner());
        Ok(guard.get(&(scope, name.to_string())).cloned())
    }

    fn write_agent(&self, agent: &AgentSpec, scope: StoreScope) -> Result<()> {
        let mut guard = self.agents.write().unwrap_or_else(|e| e.into_inner());
        guard.insert((scope, agent.name.clone()), agent.clone());
        Ok(())
    }

    fn write_chain(&self, chain: &ChainSpec, scope: StoreScope) -> Result<()> {
        let mut guard = self.chains.write().unwrap_or_else(|e| e.into_inner());
        guard.insert((scope, chain.name.clone()), chain.clone());
        Ok(())
    }

    fn delete_agent(&self, name: &str, scope: StoreScope) -> Result<()> {
        let mut guard = self.agents.write().unwrap_or_else(|e| e.into_inner());
        guard.remove(&(scope, name.to_string()));
        Ok(())
    }

    fn delete_chain(&self, name: &str, scope: StoreScope) -> Result<()> {
        let mut guard = self.chains.write().unwrap_or_else(|e| e.into_inner());
        guard.remove(&(scope, name.to_string()));
        Ok(())
    }
}
