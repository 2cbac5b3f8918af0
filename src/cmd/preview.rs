//! Preview container and port commands.

use std::time::Duration;

use anyhow::Result;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use forge_steps::engine::Engine;
use forge_steps::models::{ContainerRecord, SlotRequest};

use super::super::{Cli, PreviewCommands};
use super::print_json;

/// `NAME` or `NAME=PORT`.
pub fn parse_slot(raw: &str) -> Result<(String, Option<u16>), String> {
    let (name, port) = match raw.split_once('=') {
        Some((name, port)) => {
            let port = port
                .trim()
                .parse::<u16>()
                .map_err(|_| format!("invalid port in '{}'", raw))?;
            (name.trim(), Some(port))
        }
        None => (raw.trim(), None),
    };
    if name.is_empty() {
        return Err(format!("missing slot name in '{}'", raw));
    }
    Ok((name.to_string(), port))
}

fn spinner(message: &str, hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg} {elapsed:.dim}") {
        bar.set_style(style);
    }
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

pub async fn cmd_preview(engine: &Engine, cli: &Cli, command: &PreviewCommands) -> Result<()> {
    match command {
        PreviewCommands::Start { config, slots } => {
            let mut request: SlotRequest = slots.iter().cloned().collect();
            if request.is_empty() {
                request.insert("app".to_string(), None);
            }
            let bar = spinner("Building preview", cli.json);
            let started = engine
                .previews
                .start(
                    cli.project_id,
                    &engine.project_dir,
                    config.as_deref(),
                    request,
                )
                .await;
            bar.finish_and_clear();
            let record = started?;
            if cli.json {
                return print_json(&record);
            }
            println!("{} preview #{}", style("Started").green().bold(), record.id);
            render_record(&record);
        }
        PreviewCommands::Stop { id } => {
            let record = engine.previews.stop(*id).await?;
            if cli.json {
                return print_json(&record);
            }
            println!("{} preview #{}", style("Stopped").yellow(), record.id);
        }
        PreviewCommands::Logs { id } => {
            let logs = engine.previews.logs(*id).await?;
            if cli.json {
                return print_json(&serde_json::json!({ "id": id, "logs": logs }));
            }
            print!("{}", logs);
        }
        PreviewCommands::List { all } => {
            let records = engine.previews.list(Some(cli.project_id), !*all).await?;
            if cli.json {
                return print_json(&records);
            }
            if records.is_empty() {
                println!("No previews.");
            }
            for record in &records {
                render_record(record);
            }
        }
    }
    Ok(())
}

pub async fn cmd_ports(engine: &Engine, cli: &Cli) -> Result<()> {
    let range = engine.ports.range();
    let mut in_use: Vec<u16> = engine.ports.in_use().await?.into_iter().collect();
    in_use.sort_unstable();
    if cli.json {
        return print_json(&serde_json::json!({
            "range_start": range.start(),
            "range_end": range.end(),
            "in_use": in_use,
        }));
    }
    println!(
        "Range {}-{}: {} of {} ports in use",
        range.start(),
        range.end(),
        in_use.len(),
        range.len()
    );
    for port in in_use {
        println!("  {}", port);
    }
    Ok(())
}

fn render_record(record: &ContainerRecord) {
    println!(
        "#{:<5} {:<8} {}",
        record.id,
        record.status.as_str(),
        record.work_dir
    );
    for (slot, port) in &record.ports {
        println!("    {:<12} http://localhost:{}", slot, port);
    }
}
