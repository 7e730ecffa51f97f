//! Execution subcommands: run, resume, trigger, status, pending and cancel.

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::json;
use uuid::Uuid;

use autoflow_types::execution::{ExecutionContext, StepStatus};

use crate::cli::{parse_json_arg, print_json, styled_status};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn run(
    state: &AppState,
    workflow_id: &str,
    input: Option<&str>,
    user: Option<&str>,
    json: bool,
) -> Result<()> {
    let input = parse_json_arg(input, "--input")?;
    let context = user.map(|u| ExecutionContext::new(workflow_id, serde_json::Value::Null).with_user(u));

    let ctx = state
        .engine
        .execute_workflow(workflow_id, input, context)
        .await
        .with_context(|| format!("Failed to execute workflow '{workflow_id}'"))?;

    if json {
        return print_json(&ctx);
    }
    print_execution(&ctx);
    Ok(())
}

// ---------------------------------------------------------------------------
// Resume
// ---------------------------------------------------------------------------

pub async fn resume(
    state: &AppState,
    execution_id: Uuid,
    step_id: Option<String>,
    json: bool,
) -> Result<()> {
    let step_id = match step_id {
        Some(step_id) => step_id,
        None => {
            let ctx = state
                .engine
                .get_execution(execution_id)
                .await?
                .with_context(|| format!("Execution {execution_id} not found"))?;
            ctx.pending_approvals()
                .into_iter()
                .next()
                .with_context(|| format!("Execution {execution_id} has no step awaiting approval"))?
        }
    };

    let ctx = state
        .engine
        .resume_workflow(execution_id, &step_id)
        .await
        .context("Failed to resume execution")?;

    if json {
        return print_json(&ctx);
    }
    print_execution(&ctx);
    Ok(())
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// Start every workflow listening for `event_type`, then wait for them.
pub async fn trigger(
    state: &AppState,
    event_type: &str,
    data: Option<&str>,
    json: bool,
) -> Result<()> {
    let data = parse_json_arg(data, "--data")?;
    let started = state.engine.trigger_event(event_type, data).await;
    state.engine.shutdown().await;

    if json {
        return print_json(&json!({ "event_type": event_type, "started": started }));
    }

    println!();
    if started == 0 {
        println!("  No workflows listen for '{}'.", style(event_type).cyan());
    } else {
        println!(
            "  {} '{}' started {} workflow(s)",
            style("*").green().bold(),
            style(event_type).cyan(),
            started
        );
        println!(
            "  Review results with: {}",
            style("autoflow pending").dim()
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn status(state: &AppState, execution_id: Uuid, json: bool) -> Result<()> {
    let ctx = state
        .engine
        .get_execution(execution_id)
        .await?
        .with_context(|| format!("Execution {execution_id} not found"))?;

    if json {
        return print_json(&ctx);
    }
    print_execution(&ctx);
    Ok(())
}

// ---------------------------------------------------------------------------
// Pending
// ---------------------------------------------------------------------------

pub async fn pending(state: &AppState, limit: u32, json: bool) -> Result<()> {
    let waiting = state
        .engine
        .list_waiting_approvals(limit)
        .await
        .context("Failed to list executions")?;

    if json {
        let out: Vec<_> = waiting
            .iter()
            .map(|ctx| {
                json!({
                    "execution_id": ctx.execution_id,
                    "workflow_id": ctx.workflow_id,
                    "steps": ctx.pending_approvals(),
                    "started_at": ctx.started_at.to_rfc3339(),
                })
            })
            .collect();
        return print_json(&out);
    }

    if waiting.is_empty() {
        println!();
        println!("  Nothing is waiting for approval.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Execution").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Awaiting"),
            Cell::new("Started"),
        ]);
    for ctx in &waiting {
        table.add_row(vec![
            Cell::new(ctx.execution_id),
            Cell::new(&ctx.workflow_id),
            Cell::new(ctx.pending_approvals().join(", ")),
            Cell::new(ctx.started_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!(
        "  Approve with: {}",
        style("autoflow resume <execution> [step]").dim()
    );
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

pub async fn cancel(state: &AppState, execution_id: Uuid, json: bool) -> Result<()> {
    let ctx = state
        .engine
        .cancel_execution(execution_id)
        .await
        .context("Failed to cancel execution")?;

    if json {
        return print_json(&ctx);
    }
    println!();
    println!(
        "  Execution {} is {}",
        style(execution_id).cyan(),
        styled_status(ctx.status)
    );
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

fn print_execution(ctx: &ExecutionContext) {
    println!();
    println!(
        "  {} {}",
        style("Execution").bold(),
        style(ctx.execution_id).cyan()
    );
    println!("  Workflow: {}", style(&ctx.workflow_id).cyan());
    println!("  Status: {}", styled_status(ctx.status));
    println!("  Started: {}", ctx.started_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(completed) = ctx.completed_at {
        println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(ref err) = ctx.error_message {
        println!("  Error: {}", style(err).red());
    }

    if !ctx.history.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Step").fg(Color::Cyan),
                Cell::new("Type"),
                Cell::new("Status"),
                Cell::new("Attempts"),
                Cell::new("Duration"),
                Cell::new("Error"),
            ]);
        for record in &ctx.history {
            let step_status = match record.status {
                StepStatus::Completed if record.recovered_by_fallback => {
                    Cell::new("completed (fallback)").fg(Color::Green)
                }
                StepStatus::Completed => Cell::new("completed").fg(Color::Green),
                StepStatus::Failed => Cell::new("failed").fg(Color::Red),
                StepStatus::WaitingApproval => Cell::new("waiting_approval").fg(Color::Yellow),
            };
            table.add_row(vec![
                Cell::new(&record.step_id),
                Cell::new(record.step_type.as_str()),
                step_status,
                Cell::new(record.attempts),
                Cell::new(format!("{}ms", record.duration_ms)),
                Cell::new(record.error.as_deref().unwrap_or("-")),
            ]);
        }
        println!();
        println!("{table}");
    }

    let awaiting = ctx.pending_approvals();
    if !awaiting.is_empty() {
        println!();
        for step_id in &awaiting {
            println!(
                "  {} '{}' awaits approval: {}",
                style("?").yellow().bold(),
                step_id,
                style(format!("autoflow resume {} {step_id}", ctx.execution_id)).dim()
            );
        }
    }
    println!();
}
