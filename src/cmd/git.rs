//! Git commands: `forge-steps git switch|commit|pr`.

use anyhow::Result;
use console::style;

use forge_steps::engine::Engine;
use forge_steps::models::GitOperationOutcome;

use super::super::{Cli, GitCommands};
use super::print_json;

pub async fn cmd_git(engine: &Engine, cli: &Cli, command: &GitCommands) -> Result<()> {
    let path = engine.project_dir.as_path();
    let outcome = match command {
        GitCommands::Switch { branch, from } => {
            engine
                .git
                .create_and_switch_branch(path, branch, from.as_deref())
                .await?
        }
        GitCommands::Commit { message, files } => {
            let files = (!files.is_empty()).then_some(files.as_slice());
            engine.git.commit(path, message, files).await?
        }
        GitCommands::Pr { title, body, base } => {
            engine
                .git
                .create_pull_request(path, title, body, base)
                .await?
        }
    };

    if cli.json {
        return print_json(&outcome);
    }
    render(&outcome);
    Ok(())
}

fn render(outcome: &GitOperationOutcome) {
    if outcome.commands.is_empty() {
        println!("{} nothing to do", style("✓").green());
    }
    for command in &outcome.commands {
        println!("  {} {}", style("$").dim(), command);
    }
    if let Some(branch) = &outcome.branch {
        println!("Branch: {}", style(branch).bold());
    }
    if let Some(sha) = &outcome.commit_sha {
        println!("Commit: {}", sha);
    }
    if let Some(url) = &outcome.pr_url {
        println!("Pull request: {}", style(url).underlined());
    }
}
