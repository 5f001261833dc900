//! CLI command definitions.

use std::path::PathBuf;

use clap::Subcommand;

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a single agent on a task
    Run {
        /// Agent name
        agent: String,
        /// The task to perform
        task: String,
        /// Model override (provider/id)
        #[arg(long)]
        model: Option<String>,
        /// Skill names to inject (replaces the agent's defaults)
        #[arg(long = "skill")]
        skills: Vec<String>,
        /// Disable skill injection entirely
        #[arg(long, conflicts_with = "skills")]
        no_skills: bool,
        /// Output file path (relative to the working directory)
        #[arg(long)]
        output: Option<String>,
        /// Disable the output artifact
        #[arg(long, conflicts_with = "output")]
        no_output: bool,
        /// Detach and report progress via `convoy status`
        #[arg(long)]
        background: bool,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Fan a set of tasks out across agents in parallel
    Parallel {
        /// Tasks as AGENT=TASK pairs, in order
        #[arg(long = "task", value_name = "AGENT=TASK", required = true)]
        tasks: Vec<String>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run agents as a sequential chain with {previous} threading
    Chain {
        /// Steps as AGENT or AGENT=TASK; a bare agent consumes {previous}.
        /// Group parallel steps as AGENT1+AGENT2=TASK.
        #[arg(long = "step", value_name = "AGENT[=TASK]", required = true)]
        steps: Vec<String>,
        /// Original task, referenced by {task} in step templates
        #[arg(long)]
        task: Option<String>,
        /// Persistent chain directory (defaults to a managed temp dir)
        #[arg(long)]
        chain_dir: Option<PathBuf>,
        /// Detach and report progress via `convoy status`
        #[arg(long)]
        background: bool,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show background run status
    Status {
        /// Run id; lists known runs when omitted
        id: Option<String>,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage agent definitions
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },

    /// Internal: background worker entry point
    #[command(hide = true)]
    Worker {
        /// Path to the worker input JSON
        input: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
pub enum AgentCommands {
    /// List agents and chains
    List {
        /// Store scope: user or project
        #[arg(long, default_value = "user")]
        scope: String,
    },
    /// Show one agent
    Get {
        name: String,
        #[arg(long, default_value = "user")]
        scope: String,
    },
    /// Create an agent
    Create {
        name: String,
        /// Provider-qualified model id
        #[arg(long)]
        model: String,
        /// System prompt text
        #[arg(long, default_value = "")]
        system_prompt: String,
        /// Allowed tools
        #[arg(long = "tool")]
        tools: Vec<String>,
        /// Default skills
        #[arg(long = "skill")]
        skills: Vec<String>,
        /// Default output filename
        #[arg(long)]
        output: Option<String>,
        #[arg(long, default_value = "user")]
        scope: String,
    },
    /// Update an agent (unspecified fields are kept)
    Update {
        name: String,
        /// New name
        #[arg(long)]
        rename: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        system_prompt: Option<String>,
        /// Default output filename; empty string clears it
        #[arg(long)]
        output: Option<String>,
        #[arg(long, default_value = "user")]
        scope: String,
    },
    /// Delete an agent
    Delete {
        name: String,
        #[arg(long, default_value = "user")]
        scope: String,
    },
}
