//! Execution state types.
//!
//! An `ExecutionContext` is the mutable per-run state for one invocation of a
//! workflow. It is owned by the orchestrator, snapshotted by the persister,
//! and returned to callers once the run finishes or pauses.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::StepType;

// ---------------------------------------------------------------------------
// WorkflowStatus
// ---------------------------------------------------------------------------

/// Lifecycle of one execution.
///
/// `Pending -> Running -> {Completed | Failed | Cancelled}`, with
/// `Running <-> WaitingApproval` as the only resumable detour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Completed, failed and cancelled executions never run again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::WaitingApproval => "waiting_approval",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowStatus::Pending),
            "running" => Ok(WorkflowStatus::Running),
            "waiting_approval" => Ok(WorkflowStatus::WaitingApproval),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            other => Err(format!("invalid workflow status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

/// Outcome status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    WaitingApproval,
}

/// What a handler returns for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,

    /// Arbitrary handler payload. `{{step_id.key}}` templates read from here.
    #[serde(default)]
    pub output: Value,

    /// Dynamic branch selection. Takes precedence over the step's static
    /// `next_steps` when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_steps: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    #[serde(default)]
    pub duration_ms: u64,

    /// Values merged into the execution's variables when the result is stored.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn completed(output: Value) -> Self {
        Self {
            status: StepStatus::Completed,
            output,
            next_steps: None,
            confidence: None,
            duration_ms: 0,
            variables: HashMap::new(),
            error: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_next_steps(mut self, next_steps: Vec<String>) -> Self {
        self.next_steps = Some(next_steps);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    /// Reported confidence, defaulting to 1.0 when the handler set none.
    pub fn confidence(&self) -> f64 {
        self.confidence.unwrap_or(1.0)
    }
}

// ---------------------------------------------------------------------------
// StepExecutionRecord
// ---------------------------------------------------------------------------

/// Append-only audit entry for one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    pub step_id: String,
    pub step_type: StepType,
    pub status: StepStatus,
    /// Handler invocations made, including the first.
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The result came from the self-healing fallback, not the handler.
    #[serde(default)]
    pub recovered_by_fallback: bool,
}

// ---------------------------------------------------------------------------
// Held joins
// ---------------------------------------------------------------------------

/// Something a fan-out join is still waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum JoinBlocker {
    /// A step paused for approval.
    Step(String),
    /// A nested join that is itself held.
    Join(Uuid),
}

/// Shared `next_steps` of a fan-out, held back because some of its parallel
/// branches paused for approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeldJoin {
    pub join_id: Uuid,
    /// Step whose `parallel_steps` fanned out.
    pub fork_step: String,
    pub waiting_on: Vec<JoinBlocker>,
    /// Run in order once `waiting_on` is empty.
    pub next_steps: Vec<String>,
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable state for one run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub workflow_id: String,
    #[serde(default)]
    pub input_data: Value,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub results: HashMap<String, StepResult>,
    #[serde(default)]
    pub history: Vec<StepExecutionRecord>,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub held_joins: Vec<HeldJoin>,
}

impl ExecutionContext {
    /// Fresh pending context. Top-level keys of an object `input_data` seed
    /// the variables map.
    pub fn new(workflow_id: impl Into<String>, input_data: Value) -> Self {
        let mut ctx = Self {
            execution_id: Uuid::now_v7(),
            workflow_id: workflow_id.into(),
            input_data: Value::Null,
            variables: HashMap::new(),
            results: HashMap::new(),
            history: Vec::new(),
            status: WorkflowStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            current_step: None,
            error_message: None,
            user_id: None,
            held_joins: Vec::new(),
        };
        ctx.seed_input(input_data);
        ctx
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach input data, copying object keys into variables without
    /// overwriting ones already set.
    pub fn seed_input(&mut self, input_data: Value) {
        if let Value::Object(map) = &input_data {
            for (k, v) in map {
                self.variables.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        self.input_data = input_data;
    }

    /// Whether any stored result is still awaiting approval.
    pub fn has_pending_approval(&self) -> bool {
        self.results
            .values()
            .any(|r| r.status == StepStatus::WaitingApproval)
    }

    /// Step ids awaiting approval, sorted for stable output.
    pub fn pending_approvals(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .results
            .iter()
            .filter(|(_, r)| r.status == StepStatus::WaitingApproval)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Position of a step's first history entry.
    pub fn history_index(&self, step_id: &str) -> Option<usize> {
        self.history.iter().position(|r| r.step_id == step_id)
    }
}
