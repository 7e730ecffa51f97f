//! Execution lifecycle events published on the engine's event bus.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::WorkflowStatus;

/// Observable transitions of an execution.
///
/// Serialized with a `type` tag so API consumers can switch on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    RunStarted {
        execution_id: Uuid,
        workflow_id: String,
    },
    StepStarted {
        execution_id: Uuid,
        step_id: String,
        step_type: String,
    },
    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },
    StepFailed {
        execution_id: Uuid,
        step_id: String,
        error: String,
        will_retry: bool,
    },
    StepRetrying {
        execution_id: Uuid,
        step_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    FallbackInvoked {
        execution_id: Uuid,
        step_id: String,
        service: String,
        recovered: bool,
    },
    RunPaused {
        execution_id: Uuid,
        step_id: String,
        confidence: f64,
        threshold: f64,
    },
    RunResumed {
        execution_id: Uuid,
        step_id: String,
    },
    RunCompleted {
        execution_id: Uuid,
        duration_ms: u64,
    },
    RunFailed {
        execution_id: Uuid,
        error: String,
    },
    RunCancelled {
        execution_id: Uuid,
    },
}

impl ExecutionEvent {
    /// Execution this event belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            ExecutionEvent::RunStarted { execution_id, .. }
            | ExecutionEvent::StepStarted { execution_id, .. }
            | ExecutionEvent::StepCompleted { execution_id, .. }
            | ExecutionEvent::StepFailed { execution_id, .. }
            | ExecutionEvent::StepRetrying { execution_id, .. }
            | ExecutionEvent::FallbackInvoked { execution_id, .. }
            | ExecutionEvent::RunPaused { execution_id, .. }
            | ExecutionEvent::RunResumed { execution_id, .. }
            | ExecutionEvent::RunCompleted { execution_id, .. }
            | ExecutionEvent::RunFailed { execution_id, .. }
            | ExecutionEvent::RunCancelled { execution_id } => *execution_id,
        }
    }

    /// Status implied by a run-level event, if any.
    pub fn implied_status(&self) -> Option<WorkflowStatus> {
        match self {
            ExecutionEvent::RunStarted { .. } | ExecutionEvent::RunResumed { .. } => {
                Some(WorkflowStatus::Running)
            }
            ExecutionEvent::RunPaused { .. } => Some(WorkflowStatus::WaitingApproval),
            ExecutionEvent::RunCompleted { .. } => Some(WorkflowStatus::Completed),
            ExecutionEvent::RunFailed { .. } => Some(WorkflowStatus::Failed),
            ExecutionEvent::RunCancelled { .. } => Some(WorkflowStatus::Cancelled),
            _ => None,
        }
    }
}
