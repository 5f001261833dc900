//! Handlers for `agent` management commands.

use std::path::Path;

use anyhow::{bail, Result};

use crate::commands::AgentCommands;
use crate::domain::AgentSpec;
use crate::store::{manage, AgentPatch, FsStore, ManageAction, StoreScope};

fn parse_scope(raw: &str) -> Result<StoreScope> {
    match raw {
        "user" => Ok(StoreScope::User),
        "project" => Ok(StoreScope::Project),
        other => bail!("unknown scope '{}', expected 'user' or 'project'", other),
    }
}

pub fn agent_command(cwd: &Path, command: AgentCommands) -> Result<()> {
    let store = FsStore::discover(cwd);

    let action = match command {
        AgentCommands::List { scope } => ManageAction::List {
            scope: parse_scope(&scope)?,
        },
        AgentCommands::Get { name, scope } => ManageAction::Get {
            name,
            scope: parse_scope(&scope)?,
        },
        AgentCommands::Create {
            name,
            model,
            system_prompt,
            tools,
            skills,
            output,
            scope,
        } => {
            let mut agent = AgentSpec::new(name, model);
            agent.system_prompt = system_prompt;
            agent.tools = tools;
            agent.skills = skills;
            agent.output = output;
            ManageAction::Create {
                agent,
                scope: parse_scope(&scope)?,
            }
        }
        AgentCommands::Update {
            name,
            rename,
            model,
            system_prompt,
            output,
            scope,
        } => ManageAction::Update {
            name,
            scope: parse_scope(&scope)?,
            patch: AgentPatch {
                name: rename,
                model,
                system_prompt,
                output,
                ..Default::default()
            },
        },
        AgentCommands::Delete { name, scope } => ManageAction::Delete {
            name,
            scope: parse_scope(&scope)?,
        },
    };

    let outcome = manage(&store, action, &[])?;
    println!("{}", outcome.message);
    for warning in &outcome.warnings {
        eprintln!("warning: {}", warning);
    }
    for agent in &outcome.agents {
        println!("- {} ({})", agent.name, agent.model);
    }
    for chain in &outcome.chains {
        let agents: Vec<&str> = chain.steps.iter().map(|s| s.agent.as_str()).collect();
        println!("- {} [chain: {}]", chain.name, agents.join(" → "));
    }
    Ok(())
}
