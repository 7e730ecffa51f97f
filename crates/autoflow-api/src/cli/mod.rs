//! CLI command definitions for the `autoflow` binary.
//!
//! Uses clap derive macros for argument parsing. Commands that touch the
//! engine run it in-process against the SQLite database in the data
//! directory, so an execution paused by `run` can be resumed by a later
//! `resume` invocation.

pub mod execution;
pub mod workflow;

use std::path::PathBuf;

use autoflow_observe::LogFormat;
use autoflow_types::execution::WorkflowStatus;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use serde::Serialize;
use uuid::Uuid;

/// Run and manage automation workflows.
#[derive(Parser)]
#[command(name = "autoflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory holding autoflow.db and config.toml.
    #[arg(long, global = true, env = "AUTOFLOW_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log line format (pretty or json).
    #[arg(long, global = true, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Also export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check a workflow file without registering it.
    Validate {
        /// Path to a YAML or JSON workflow file.
        file: PathBuf,
    },

    /// Register (or replace) a workflow from a file.
    Register {
        /// Path to a YAML or JSON workflow file.
        file: PathBuf,
    },

    /// List registered workflows.
    #[command(alias = "ls")]
    List,

    /// Remove a registered workflow.
    #[command(alias = "rm")]
    Remove {
        workflow_id: String,
    },

    /// Generate a workflow from a natural-language request via the planner.
    Generate {
        /// What the workflow should do.
        query: String,

        /// Preferred integration or model provider passed to the planner.
        #[arg(long)]
        provider: Option<String>,
    },

    /// Execute a workflow and wait until it finishes or pauses.
    Run {
        workflow_id: String,

        /// JSON input; object keys become variables.
        #[arg(long)]
        input: Option<String>,

        /// User the execution runs on behalf of.
        #[arg(long)]
        user: Option<String>,
    },

    /// Approve a paused step and continue the execution.
    Resume {
        execution_id: Uuid,

        /// Step to approve (defaults to the first one awaiting approval).
        step_id: Option<String>,
    },

    /// Fire an event and run every workflow it triggers.
    Trigger {
        event_type: String,

        /// JSON payload passed as each execution's input.
        #[arg(long)]
        data: Option<String>,
    },

    /// Show an execution with its step history.
    Status {
        execution_id: Uuid,
    },

    /// List executions waiting for approval.
    Pending {
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Cancel a running or paused execution.
    Cancel {
        execution_id: Uuid,
    },

    /// Start the REST API server.
    Serve {
        /// Port to listen on (defaults to server.port in config.toml).
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (defaults to server.host in config.toml).
        #[arg(long)]
        host: Option<String>,
    },

    /// Generate shell completions.
    Completions {
        shell: Shell,
    },
}

// ---------------------------------------------------------------------------
// Shared output helpers
// ---------------------------------------------------------------------------

pub(crate) fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn parse_json_arg(raw: Option<&str>, what: &str) -> anyhow::Result<serde_json::Value> {
    match raw {
        None => Ok(serde_json::Value::Null),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| anyhow::anyhow!("Invalid JSON for {what}: {e}")),
    }
}

pub(crate) fn styled_status(status: WorkflowStatus) -> String {
    let text = status.as_str();
    match status {
        WorkflowStatus::Completed => style(text).green().to_string(),
        WorkflowStatus::Failed => style(text).red().to_string(),
        WorkflowStatus::WaitingApproval => style(text).yellow().to_string(),
        WorkflowStatus::Cancelled => style(text).dim().to_string(),
        WorkflowStatus::Pending | WorkflowStatus::Running => style(text).cyan().to_string(),
    }
}
