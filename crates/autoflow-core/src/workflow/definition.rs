//! Workflow definition parsing and filesystem discovery.
//!
//! Converts YAML or JSON files into `WorkflowDefinition`s and validates them
//! with the graph checks in [`super::graph`] before handing them back.

use std::path::{Path, PathBuf};

use autoflow_types::error::RepositoryError;
use autoflow_types::workflow::WorkflowDefinition;
use thiserror::Error;
use uuid::Uuid;

use super::graph::validate_definition;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced by the graph store and orchestrator.
///
/// Step-level failures never appear here: they are recorded on the
/// execution context instead.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow not found: {0}")]
    NotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// The execution is still traversing and cannot be resumed yet.
    #[error("execution {0} is still running")]
    ExecutionBusy(Uuid),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("step '{step}' references unknown step '{reference}'")]
    UnknownStep { step: String, reference: String },

    #[error("cycle detected at step '{0}'")]
    CycleDetected(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistence error: {0}")]
    Persistence(#[from] RepositoryError),

    #[error("planner error: {0}")]
    Planner(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse and validate a YAML workflow.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse and validate a JSON workflow.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow file. `.json` files are parsed as JSON, anything else as YAML.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_workflow_json(&content),
        _ => parse_workflow_yaml(&content),
    }
}

/// Discover all workflow files (`.yaml`, `.yml`, `.json`) under `base_dir`.
///
/// Files that fail to parse or validate are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_workflow = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml" | "json")
        );
        if !is_workflow {
            continue;
        }
        match load_workflow_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => tracing::warn!(?path, error = %e, "skipping invalid workflow file"),
        }
    }
    Ok(())
}
