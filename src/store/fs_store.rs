//! Filesystem-backed agent/chain store.
//!
//! Agents and chains are markdown files with TOML frontmatter fenced by
//! `+++` lines; the body is the agent's system prompt. Layout:
//!
//! ```text
//! <root>/
//!   agents/<name>.md
//!   chains/<name>.md
//!   skills/<name>.md
//! ```
//!
//! The user root is `~/.convoy`; the project root is the nearest `.convoy`
//! directory walking up from the working directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::AgentSpec;

use super::{AgentStore, ChainSpec, SkillSource, StoreScope};

const FRONTMATTER_FENCE: &str = "+++";

pub struct FsStore {
    user_root: PathBuf,
    project_root: Option<PathBuf>,
}

impl FsStore {
    pub fn new(user_root: PathBuf, project_root: Option<PathBuf>) -> Self {
        Self {
            user_root,
            project_root,
        }
    }

    /// Standard store for a working directory: `~/.convoy` plus the nearest
    /// project `.convoy` directory.
    pub fn discover(cwd: &Path) -> Self {
        let user_root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".convoy");
        Self::new(user_root, find_project_root(cwd))
    }

    fn root(&self, scope: StoreScope) -> Option<&Path> {
        match scope {
            StoreScope::User => Some(&self.user_root),
            StoreScope::Project => self.project_root.as_deref(),
        }
    }

    fn scope_dir(&self, scope: StoreScope, kind: &str) -> Option<PathBuf> {
        self.root(scope).map(|r| r.join(kind))
    }

    pub fn agent_path(&self, name: &str, scope: StoreScope) -> Option<PathBuf> {
        self.scope_dir(scope, "agents").map(|d| d.join(format!("{}.md", name)))
    }
}

/// Walk up from `cwd` looking for a `.convoy` directory.
pub fn find_project_root(cwd: &Path) -> Option<PathBuf> {
    let mut current = Some(cwd);
    while let Some(dir) = current {
        let candidate = dir.join(".convoy");
        if candidate.is_dir() {
            return Some(candidate);
        }
        current = dir.parent();
    }
    None
}

fn split_frontmatter(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix(FRONTMATTER_FENCE)?;
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let end = rest.find(&format!("\n{}", FRONTMATTER_FENCE))?;
    let frontmatter = &rest[..end];
    let body = rest[end + 1 + FRONTMATTER_FENCE.len()..].trim_start_matches('\n');
    Some((frontmatter, body))
}

fn parse_agent_file(content: &str, path: &Path) -> Result<AgentSpec> {
    let (frontmatter, body) = split_frontmatter(content)
        .with_context(|| format!("Missing frontmatter in {}", path.display()))?;
    let mut spec: AgentSpec = toml::from_str(frontmatter)
        .with_context(|| format!("Failed to parse frontmatter in {}", path.display()))?;
    spec.system_prompt = body.trim_end().to_string();
    Ok(spec)
}

fn render_agent_file(agent: &AgentSpec) -> Result<String> {
    // The system prompt is the markdown body, not a frontmatter field.
    let mut spec = agent.clone();
    let body = std::mem::take(&mut spec.system_prompt);
    let frontmatter = toml::to_string_pretty(&spec).context("Failed to serialize agent")?;
    Ok(format!(
        "{}\n{}{}\n\n{}\n",
        FRONTMATTER_FENCE, frontmatter, FRONTMATTER_FENCE, body
    ))
}

fn parse_chain_file(content: &str, path: &Path) -> Result<ChainSpec> {
    let (frontmatter, _) = split_frontmatter(content)
        .with_context(|| format!("Missing frontmatter in {}", path.display()))?;
    toml::from_str(frontmatter)
        .with_context(|| format!("Failed to parse chain in {}", path.display()))
}

fn render_chain_file(chain: &ChainSpec) -> Result<String> {
    let frontmatter = toml::to_string_pretty(chain).context("Failed to serialize chain")?;
    Ok(format!(
        "{}\n{}{}\n",
        FRONTMATTER_FENCE, frontmatter, FRONTMATTER_FENCE
    ))
}

fn list_md_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
        .collect();
    files.sort();
    files
}

impl SkillSource for FsStore {
    fn load_skill(&self, name: &str) -> Option<String> {
        // Project skills shadow user skills.
        for root in [self.project_root.as_deref(), Some(self.user_root.as_path())]
            .into_iter()
            .flatten()
        {
            let path = root.join("skills").join(format!("{}.md", name));
            if let Ok(content) = std::fs::read_to_string(&path) {
                return Some(content);
            }
        }
        None
    }
}

impl AgentStore for FsStore {
    fn list_agents(&self, scope: StoreScope) -> Result<Vec<AgentSpec>> {
        let Some(dir) = self.scope_dir(scope, "agents") else {
            return Ok(Vec::new());
        };
        let mut agents = Vec::new();
        for path in list_md_files(&dir) {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            match parse_agent_file(&content, &path) {
                Ok(agent) => agents.push(agent),
                Err(e) => tracing::warn!("Skipping unparseable agent file: {:#}", e),
            }
        }
        Ok(agents)
    }

    fn list_chains(&self, scope: StoreScope) -> Result<Vec<ChainSpec>> {
        let Some(dir) = self.scope_dir(scope, "chains") else {
            return Ok(Vec::new());
        };
        let mut chains = Vec::new();
        for path in list_md_files(&dir) {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            match parse_chain_file(&content, &path) {
                Ok(chain) => chains.push(chain),
                Err(e) => tracing::warn!("Skipping unparseable chain file: {:#}", e),
            }
        }
        Ok(chains)
    }

    fn load_agent(&self, name: &str, scope: StoreScope) -> Result<Option<AgentSpec>> {
        let Some(path) = self.agent_path(name, scope) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        parse_agent_file(&content, &path).map(Some)
    }

    fn write_agent(&self, agent: &AgentSpec, scope: StoreScope) -> Result<()> {
        let dir = self
            .scope_dir(scope, "agents")
            .context("No project directory available for project scope")?;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(format!("{}.md", agent.name));
        std::fs::write(&path, render_agent_file(agent)?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn write_chain(&self, chain: &ChainSpec, scope: StoreScope) -> Result<()> {
        let dir = self
            .scope_dir(scope, "chains")
            .context("No project directory available for project scope")?;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(format!("{}.md", chain.name));
        std::fs::write(&path, render_chain_file(chain)?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn delete_agent(&self, name: &str, scope: StoreScope) -> Result<()> {
        if let Some(path) = self.agent_path(name, scope) {
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to delete {}", path.display()))?;
            }
        }
        Ok(())
    }

    fn delete_chain(&self, name: &str, scope: StoreScope) -> Result<()> {
        if let Some(dir) = self.scope_dir(scope, "chains") {
            let path = dir.join(format!("{}.md", name));
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to delete {}", path.display()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> FsStore {
        FsStore::new(tmp.path().to_path_buf(), None)
    }

    #[test]
    fn test_agent_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let fs = store(&tmp);

        let mut agent = AgentSpec::new("scout", "anthropic/claude-opus-4");
        agent.system_prompt = "You scout codebases.\n\nBe fast.".to_string();
        agent.tools = vec!["Read".to_string()];
        fs.write_agent(&agent, StoreScope::User).unwrap();

        let loaded = fs.load_agent("scout", StoreScope::User).unwrap().unwrap();
        assert_eq!(loaded.name, "scout");
        assert_eq!(loaded.model, "anthropic/claude-opus-4");
        assert_eq!(loaded.system_prompt, "You scout codebases.\n\nBe fast.");
        assert_eq!(loaded.tools, vec!["Read"]);
    }

    #[test]
    fn test_list_agents_sorted() {
        let tmp = TempDir::new().unwrap();
        let fs = store(&tmp);
        fs.write_agent(&AgentSpec::new("zeta", "m"), StoreScope::User).unwrap();
        fs.write_agent(&AgentSpec::new("alpha", "m"), StoreScope::User).unwrap();

        let names: Vec<String> = fs
            .list_agents(StoreScope::User)
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_missing_agent_is_none() {
        let tmp = TempDir::new().unwrap();
        assert!(store(&tmp).load_agent("ghost", StoreScope::User).unwrap().is_none());
    }

    #[test]
    fn test_project_scope_without_root_is_empty() {
        let tmp = TempDir::new().unwrap();
        let fs = store(&tmp);
        assert!(fs.list_agents(StoreScope::Project).unwrap().is_empty());
        assert!(fs.write_agent(&AgentSpec::new("a", "m"), StoreScope::Project).is_err());
    }

    #[test]
    fn test_skill_lookup_prefers_project() {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("proj/.convoy");
        std::fs::create_dir_all(project.join("skills")).unwrap();
        std::fs::create_dir_all(tmp.path().join("skills")).unwrap();
        std::fs::write(tmp.path().join("skills/review.md"), "user review").unwrap();
        std::fs::write(project.join("skills/review.md"), "project review").unwrap();

        let fs = FsStore::new(tmp.path().to_path_buf(), Some(project));
        assert_eq!(fs.load_skill("review").unwrap(), "project review");
        assert!(fs.load_skill("ghost").is_none());
    }

    #[test]
    fn test_find_project_root_walks_up() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join(".convoy");
        std::fs::create_dir_all(&root).unwrap();
        let nested = tmp.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_project_root(&nested).unwrap(), root);
    }

    #[test]
    fn test_chain_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let fs = store(&tmp);
        let chain = ChainSpec {
            name: "review-fix".to_string(),
            steps: vec![
                super::super::ChainStepSpec {
                    agent: "reviewer".to_string(),
                    task: Some("review {task}".to_string()),
                },
                super::super::ChainStepSpec {
                    agent: "fixer".to_string(),
                    task: None,
                },
            ],
        };
        fs.write_chain(&chain, StoreScope::User).unwrap();
        let chains = fs.list_chains(StoreScope::User).unwrap();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].steps.len(), 2);
        assert_eq!(chains[0].steps[1].agent, "fixer");
    }
}
