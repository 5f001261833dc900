//! Handler for `status`: read durable background state from disk.

use anyhow::{bail, Result};

use crate::background;
use crate::config::Settings;
use crate::domain::StepState;

pub fn status_command(settings: &Settings, id: Option<String>, json: bool) -> Result<()> {
    match id {
        Some(id) => show_one(settings, &id, json),
        None => list_all(settings, json),
    }
}

fn show_one(settings: &Settings, id: &str, json: bool) -> Result<()> {
    let async_dir = settings.async_root.join(id);
    if !async_dir.exists() {
        bail!("no background run '{}' under {}", id, settings.async_root.display());
    }
    let status = background::read_status(&async_dir)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("{} [{}] {:?}", status.run_id, status.mode, status.state);
    println!(
        "  started {}, last update {}",
        status.started_at, status.last_update
    );
    for (i, step) in status.steps.iter().enumerate() {
        let marker = match step.status {
            StepState::Pending => " ",
            StepState::Running => ">",
            StepState::Complete => "+",
            StepState::Failed => "x",
        };
        let mut line = format!("  {} {}. {}", marker, i + 1, step.agent);
        if let Some(ms) = step.duration_ms {
            line.push_str(&format!(" ({} ms)", ms));
        }
        if let Some(code) = step.exit_code {
            if code != 0 {
                line.push_str(&format!(" exit {}", code));
            }
        }
        println!("{}", line);
    }
    if let Some(error) = &status.error {
        println!("  error: {}", error);
    }
    Ok(())
}

fn list_all(settings: &Settings, json: bool) -> Result<()> {
    let Ok(entries) = std::fs::read_dir(&settings.async_root) else {
        println!("no background runs");
        return Ok(());
    };

    let mut statuses = Vec::new();
    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        if let Ok(status) = background::read_status(&entry.path()) {
            statuses.push(status);
        }
    }
    statuses.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    if statuses.is_empty() {
        println!("no background runs");
        return Ok(());
    }
    for status in statuses {
        println!(
            "{} [{}] {:?} ({}/{} steps)",
            status.run_id,
            status.mode,
            status.state,
            status
                .steps
                .iter()
                .filter(|s| s.status == StepState::Complete)
                .count(),
            status.steps.len()
        );
    }
    Ok(())
}
