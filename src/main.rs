use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use forge_steps::config::EngineConfig;
use forge_steps::engine::Engine;
use forge_steps::logging::init_logging;

mod cmd;

#[derive(Parser)]
#[command(name = "forge-steps")]
#[command(
    version,
    about = "Durable workflow steps: git reconciliation, port allocation and preview containers"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Project the runs and previews belong to
    #[arg(long, global = true, default_value_t = 1, env = "FORGE_PROJECT_ID")]
    pub project_id: i64,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a workflow from .forge/workflows/<name>.yaml
    Run {
        workflow: String,
        /// JSON arguments stored with the run
        #[arg(long)]
        args: Option<String>,
    },
    /// Continue a failed or interrupted run
    Resume { run_id: i64 },
    /// Cancel a run; it halts before its next step
    Cancel { run_id: i64 },
    /// List recent runs
    Runs,
    /// Show the step results of a run
    Steps { run_id: i64 },
    /// Git operations on the project working tree
    Git {
        #[command(subcommand)]
        command: GitCommands,
    },
    /// Preview containers
    Preview {
        #[command(subcommand)]
        command: PreviewCommands,
    },
    /// Show the port range and the ports held by running previews
    Ports,
}

#[derive(Subcommand, Clone)]
pub enum GitCommands {
    /// Switch to a branch, creating it when missing
    Switch {
        branch: String,
        /// Base branch for a new branch
        #[arg(long)]
        from: Option<String>,
    },
    /// Commit working tree changes
    Commit {
        #[arg(short, long)]
        message: String,
        /// Only stage these paths
        files: Vec<String>,
    },
    /// Push the current branch and open a pull request
    Pr {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        body: String,
        #[arg(long, default_value = "main")]
        base: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum PreviewCommands {
    /// Build and run the project's container configuration
    Start {
        /// Compose file or Dockerfile, relative to the project
        #[arg(long)]
        config: Option<PathBuf>,
        /// Port slot as NAME or NAME=PORT; repeatable
        #[arg(long = "slot", value_parser = cmd::parse_slot)]
        slots: Vec<(String, Option<u16>)>,
    },
    /// Stop a preview and release its ports
    Stop { id: i64 },
    /// Tail the logs of a preview's containers
    Logs { id: i64 },
    /// List previews
    List {
        /// Include stopped previews
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let config = EngineConfig::load(&project_dir)?;
    let _logging = init_logging(&config.logging, cli.verbose)?;
    let engine = Engine::open_with(&project_dir, config)?;

    match &cli.command {
        Commands::Run { workflow, args } => {
            cmd::cmd_run(&engine, &cli, workflow, args.as_deref()).await?
        }
        Commands::Resume { run_id } => cmd::cmd_resume(&engine, &cli, *run_id).await?,
        Commands::Cancel { run_id } => cmd::cmd_cancel(&engine, &cli, *run_id).await?,
        Commands::Runs => cmd::cmd_runs(&engine, &cli).await?,
        Commands::Steps { run_id } => cmd::cmd_steps(&engine, &cli, *run_id).await?,
        Commands::Git { command } => cmd::cmd_git(&engine, &cli, command).await?,
        Commands::Preview { command } => cmd::cmd_preview(&engine, &cli, command).await?,
        Commands::Ports => cmd::cmd_ports(&engine, &cli).await?,
    }

    Ok(())
}
