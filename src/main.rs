use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use convoy::cli;
use convoy::commands::Commands;
use convoy::config::Settings;

#[derive(Parser)]
#[command(name = "convoy")]
#[command(about = "Subagent orchestration - dispatch, chain, and fan out coding-agent runs")]
#[command(version)]
struct Cli {
    /// Working directory for agent runs (defaults to the current directory)
    #[arg(short, long, global = true)]
    path: Option<PathBuf>,

    /// Path to the config file (defaults to ~/.convoy/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let work_dir = cli
        .path
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            agent,
            task,
            model,
            skills,
            no_skills,
            output,
            no_output,
            background,
            json,
        } => {
            cli::run::run_command(
                &work_dir,
                settings,
                cli::run::RunArgs {
                    agent,
                    task,
                    model,
                    skills,
                    no_skills,
                    output,
                    no_output,
                    background,
                    json,
                },
            )
            .await?;
        }
        Commands::Parallel { tasks, json } => {
            cli::run::parallel_command(&work_dir, settings, tasks, json).await?;
        }
        Commands::Chain {
            steps,
            task,
            chain_dir,
            background,
            json,
        } => {
            cli::run::chain_command(
                &work_dir,
                settings,
                cli::run::ChainArgs {
                    steps,
                    task,
                    chain_dir,
                    background,
                    json,
                },
            )
            .await?;
        }
        Commands::Status { id, json } => {
            cli::status::status_command(&settings, id, json)?;
        }
        Commands::Agent { command } => {
            cli::agent::agent_command(&work_dir, command)?;
        }
        Commands::Worker { input } => {
            convoy::background::run_worker(&input).await?;
        }
    }

    Ok(())
}
