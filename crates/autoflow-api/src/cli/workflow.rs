//! Workflow definition subcommands: validate, register, list, remove and
//! generate.

use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::json;

use autoflow_core::workflow::definition::{WorkflowError, load_workflow_file};
use autoflow_core::workflow::graph::validate_definition;
use autoflow_types::workflow::WorkflowDefinition;

use crate::state::AppState;

fn load(file: &Path) -> Result<WorkflowDefinition> {
    load_workflow_file(file).map_err(|e| match e {
        WorkflowError::Parse(msg) => anyhow::anyhow!("Failed to parse {}: {msg}", file.display()),
        WorkflowError::Io(err) => anyhow::anyhow!("Failed to read {}: {err}", file.display()),
        other => anyhow::anyhow!("Workflow validation failed: {other}"),
    })
}

fn print_unreachable(unreachable: &[String]) {
    if !unreachable.is_empty() {
        println!(
            "  {} Unreachable from start: {}",
            style("!").yellow().bold(),
            unreachable.join(", ")
        );
    }
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// Parse and validate without touching the database.
pub fn validate(file: &Path, json: bool) -> Result<()> {
    let def = load(file)?;
    let report = validate_definition(&def)?;

    if json {
        return crate::cli::print_json(&json!({
            "valid": true,
            "id": def.id,
            "steps": def.steps.len(),
            "unreachable_steps": report.unreachable,
        }));
    }

    println!();
    println!(
        "  {} '{}' is valid ({} steps)",
        style("*").green().bold(),
        style(&def.id).cyan(),
        def.steps.len()
    );
    print_unreachable(&report.unreachable);
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Register
// ---------------------------------------------------------------------------

pub async fn register(state: &AppState, file: &Path, json: bool) -> Result<()> {
    let def = load(file)?;
    let summary = json!({
        "id": def.id,
        "name": def.name,
        "steps": def.steps.len(),
        "triggers": def.triggers,
    });
    let report = state
        .register_definition(def)
        .await
        .context("Failed to register workflow")?;

    if json {
        return crate::cli::print_json(&summary);
    }

    println!();
    println!(
        "  {} Registered workflow '{}'",
        style("*").green().bold(),
        style(summary["id"].as_str().unwrap_or_default()).cyan()
    );
    println!("  Steps: {}", summary["steps"]);
    print_unreachable(&report.unreachable);
    println!();
    println!(
        "  Run it with: {}",
        style(format!(
            "autoflow run {}",
            summary["id"].as_str().unwrap_or_default()
        ))
        .dim()
    );
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn list(state: &AppState, json: bool) -> Result<()> {
    let mut defs = state.engine.store().list().await;
    defs.sort_by(|a, b| a.id.cmp(&b.id));

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                json!({
                    "id": d.id,
                    "name": d.name,
                    "version": d.version,
                    "steps": d.steps.len(),
                    "triggers": d.triggers,
                })
            })
            .collect();
        return crate::cli::print_json(&out);
    }

    if defs.is_empty() {
        println!();
        println!("  No workflows registered.");
        println!(
            "  Register one with: {}",
            style("autoflow register <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Version"),
            Cell::new("Steps"),
            Cell::new("Triggers"),
        ]);

    for d in &defs {
        let triggers = if d.triggers.is_empty() {
            "-".to_string()
        } else {
            d.triggers.join(", ")
        };
        table.add_row(vec![
            Cell::new(&d.id),
            Cell::new(&d.name),
            Cell::new(&d.version),
            Cell::new(d.steps.len()),
            Cell::new(triggers),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Remove
// ---------------------------------------------------------------------------

pub async fn remove(state: &AppState, workflow_id: &str, json: bool) -> Result<()> {
    let removed = state
        .remove_definition(workflow_id)
        .await
        .context("Failed to remove workflow")?;
    if !removed {
        anyhow::bail!("Workflow '{workflow_id}' not found");
    }

    if json {
        return crate::cli::print_json(&json!({ "removed": workflow_id }));
    }
    println!();
    println!(
        "  {} Removed workflow '{}'",
        style("*").green().bold(),
        style(workflow_id).cyan()
    );
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Generate
// ---------------------------------------------------------------------------

pub async fn generate(
    state: &AppState,
    query: &str,
    provider: Option<&str>,
    json: bool,
) -> Result<()> {
    let def = state
        .generate_definition(query, provider)
        .await
        .context("Failed to generate workflow (is [planner] endpoint set in config.toml?)")?;

    if json {
        return crate::cli::print_json(&def);
    }

    println!();
    println!(
        "  {} Generated workflow '{}'",
        style("*").green().bold(),
        style(&def.id).cyan()
    );
    println!("  Name: {}", def.name);
    for (i, step) in def.steps.iter().enumerate() {
        println!(
            "  {}. {} {}",
            i + 1,
            style(&step.step_id).bold(),
            style(format!("({})", step.step_type)).dim()
        );
    }
    if !def.triggers.is_empty() {
        println!("  Triggers: {}", def.triggers.join(", "));
    }
    println!();
    Ok(())
}
