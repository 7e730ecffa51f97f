//! Approval gate: pauses a branch when a result is not confident enough.
//!
//! The gate itself is pure. The orchestrator applies its decision: marking
//! the result, flipping the execution to `WaitingApproval` and persisting
//! before the branch returns.

use autoflow_types::execution::{ExecutionContext, StepResult, StepStatus};
use autoflow_types::workflow::WorkflowStep;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ApprovalDecision {
    Proceed,
    Pause { confidence: f64, threshold: f64 },
}

pub struct ApprovalGate;

impl ApprovalGate {
    /// Compare the result's confidence with the step's threshold. A
    /// non-finite confidence always pauses.
    pub fn check(step: &WorkflowStep, result: &StepResult) -> ApprovalDecision {
        let confidence = result.confidence();
        let threshold = step.confidence_threshold;
        if !confidence.is_finite() || confidence < threshold {
            ApprovalDecision::Pause {
                confidence,
                threshold,
            }
        } else {
            ApprovalDecision::Proceed
        }
    }

    /// Whether `step_id` of this execution is currently awaiting approval.
    pub fn is_awaiting(ctx: &ExecutionContext, step_id: &str) -> bool {
        !ctx.status.is_terminal()
            && ctx
                .results
                .get(step_id)
                .is_some_and(|r| r.status == StepStatus::WaitingApproval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoflow_types::execution::WorkflowStatus;
    use autoflow_types::workflow::StepType;
    use serde_json::json;

    fn step(threshold: f64) -> WorkflowStep {
        let mut s = WorkflowStep::new("review", StepType::AiAnalysis);
        s.confidence_threshold = threshold;
        s
    }

    #[test]
    fn default_threshold_never_pauses_unscored_results() {
        let result = StepResult::completed(json!({}));
        assert_eq!(ApprovalGate::check(&step(1.0), &result), ApprovalDecision::Proceed);
    }

    #[test]
    fn low_confidence_pauses() {
        let result = StepResult::completed(json!({})).with_confidence(0.5);
        assert_eq!(
            ApprovalGate::check(&step(0.9), &result),
            ApprovalDecision::Pause {
                confidence: 0.5,
                threshold: 0.9
            }
        );
        assert_eq!(
            ApprovalGate::check(&step(0.5), &result),
            ApprovalDecision::Proceed
        );
    }

    #[test]
    fn nan_confidence_pauses() {
        let result = StepResult::completed(json!({})).with_confidence(f64::NAN);
        assert!(matches!(
            ApprovalGate::check(&step(0.1), &result),
            ApprovalDecision::Pause { .. }
        ));
    }

    #[test]
    fn awaiting_requires_waiting_result_and_live_status() {
        let mut ctx = ExecutionContext::new("wf", json!(null));
        ctx.status = WorkflowStatus::WaitingApproval;
        let mut waiting = StepResult::completed(json!(null));
        waiting.status = StepStatus::WaitingApproval;
        ctx.results.insert("review".into(), waiting);
        ctx.results
            .insert("done".into(), StepResult::completed(json!(null)));

        assert!(ApprovalGate::is_awaiting(&ctx, "review"));
        assert!(!ApprovalGate::is_awaiting(&ctx, "done"));
        assert!(!ApprovalGate::is_awaiting(&ctx, "ghost"));

        ctx.status = WorkflowStatus::Cancelled;
        assert!(!ApprovalGate::is_awaiting(&ctx, "review"));
    }
}
