//! Workflow run commands: `run`, `resume`, `cancel`, `runs`, `steps`.

use anyhow::{Context, Result};
use console::style;

use forge_steps::driver::{WorkflowDefinition, WorkflowStartRequest};
use forge_steps::engine::Engine;
use forge_steps::models::{RunStatus, WorkflowRun};
use forge_steps::tasks::spawn_logged;

use super::super::Cli;
use super::print_json;

pub async fn cmd_run(engine: &Engine, cli: &Cli, workflow: &str, args: Option<&str>) -> Result<()> {
    let definition = WorkflowDefinition::resolve(&engine.project_dir, workflow)?;
    let args = match args {
        Some(raw) => serde_json::from_str(raw).context("--args must be valid JSON")?,
        None => serde_json::Value::Null,
    };
    let request = WorkflowStartRequest {
        workflow: workflow.to_string(),
        args,
    };

    let run = engine.driver.prepare(cli.project_id, &request).await?;
    if !cli.json {
        println!(
            "{} run #{} of '{}' ({} steps)",
            style("Starting").bold().cyan(),
            run.id,
            definition.name,
            definition.step_count()
        );
    }
    let finished = drive(engine, run.id, &definition).await?;
    report(cli, &finished)
}

pub async fn cmd_resume(engine: &Engine, cli: &Cli, run_id: i64) -> Result<()> {
    let run = load_run(engine, run_id).await?;
    let definition = WorkflowDefinition::resolve(&engine.project_dir, &run.workflow)?;
    if !cli.json {
        println!(
            "{} run #{} of '{}'",
            style("Resuming").bold().cyan(),
            run.id,
            run.workflow
        );
    }
    let finished = drive(engine, run_id, &definition).await?;
    report(cli, &finished)
}

pub async fn cmd_cancel(engine: &Engine, cli: &Cli, run_id: i64) -> Result<()> {
    let run = engine.driver.cancel(run_id).await?;
    if cli.json {
        return print_json(&run);
    }
    if run.status == RunStatus::Cancelled {
        println!("{} run #{}", style("Cancelled").yellow(), run.id);
    } else if !run.status.is_terminal() {
        println!(
            "{} for run #{}; it stops after step {}",
            style("Cancellation requested").yellow(),
            run.id,
            run.current_step.as_deref().unwrap_or("-")
        );
    } else {
        println!(
            "Run #{} already {}; nothing to cancel",
            run.id,
            status_label(run.status)
        );
    }
    Ok(())
}

pub async fn cmd_runs(engine: &Engine, cli: &Cli) -> Result<()> {
    let project_id = cli.project_id;
    let runs = engine
        .db
        .call(move |db| db.list_runs(Some(project_id)))
        .await?;
    if cli.json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("No runs yet.");
        return Ok(());
    }
    println!("{:<6} {:<20} {:<11} {:<20} Current", "Run", "Workflow", "Status", "Started");
    for run in &runs {
        println!(
            "{:<6} {:<20} {:<20} {:<20} {}",
            run.id,
            run.workflow,
            status_label(run.status),
            run.created_at,
            run.current_step.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

pub async fn cmd_steps(engine: &Engine, cli: &Cli, run_id: i64) -> Result<()> {
    load_run(engine, run_id).await?;
    let results = engine
        .db
        .call(move |db| db.list_step_results(run_id))
        .await?;
    if cli.json {
        return print_json(&results);
    }
    if results.is_empty() {
        println!("Run #{} has no step results.", run_id);
        return Ok(());
    }
    for result in &results {
        let mark = if result.success {
            style("ok").green()
        } else {
            style("FAILED").red()
        };
        println!(
            "{:<32} {:<6} {:>8}ms  {}",
            result.step_id,
            mark,
            result.duration_ms,
            result.error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn load_run(engine: &Engine, run_id: i64) -> Result<WorkflowRun> {
    engine
        .db
        .call(move |db| db.get_run(run_id))
        .await?
        .with_context(|| format!("Workflow run {} not found", run_id))
}

/// Drive the run to a terminal status; Ctrl-C cancels it.
async fn drive(engine: &Engine, run_id: i64, definition: &WorkflowDefinition) -> Result<WorkflowRun> {
    let driver = engine.driver.clone();
    let interrupt = spawn_logged("ctrl-c-cancel", async move {
        tokio::signal::ctrl_c().await?;
        driver.cancel(run_id).await?;
        Ok(())
    });
    let result = engine
        .driver
        .resume(run_id, &engine.project_dir, definition)
        .await;
    interrupt.abort();
    result
}

fn report(cli: &Cli, run: &WorkflowRun) -> Result<()> {
    if cli.json {
        print_json(run)?;
    } else {
        println!("Run #{} {}", run.id, status_label(run.status));
        if let Some(error) = &run.error {
            println!("  {}", style(error).red());
        }
    }
    if run.status == RunStatus::Failed {
        anyhow::bail!("Run #{} failed", run.id);
    }
    Ok(())
}

fn status_label(status: RunStatus) -> String {
    let styled = match status {
        RunStatus::Completed => style(status.as_str()).green(),
        RunStatus::Failed => style(status.as_str()).red(),
        RunStatus::Cancelled => style(status.as_str()).yellow(),
        RunStatus::Running => style(status.as_str()).cyan(),
        RunStatus::Pending | RunStatus::Paused => style(status.as_str()).dim(),
    };
    styled.to_string()
}
