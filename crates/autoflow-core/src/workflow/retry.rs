//! Retry controller: explicit per-attempt loop with exponential backoff.
//!
//! Each attempt yields either a `StepResult` or a classified `StepFailure`.
//! Transient failures are retried while `RetryPolicy::should_retry` allows;
//! permanent failures and exhausted budgets are handed back to the caller,
//! which escalates them to the fallback coordinator.
//!
//! Every attempt is raced against the step timeout. Expiry produces a
//! transient failure whose message contains "timeout".

use std::future::Future;
use std::time::Duration;

use autoflow_types::event::ExecutionEvent;
use autoflow_types::execution::StepResult;
use autoflow_types::workflow::{RetryPolicy, WorkflowStep};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::EventBus;

// ---------------------------------------------------------------------------
// StepFailure
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Matches a retryable substring of the step's policy.
    Transient,
    /// Skips the retry budget and goes straight to fallback.
    Permanent,
}

/// A failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StepFailure {
    /// Classify by the policy's retryable substrings.
    pub fn classify(message: impl Into<String>, policy: &RetryPolicy) -> Self {
        let message = message.into();
        let kind = if policy.is_retryable(&message) {
            FailureKind::Transient
        } else {
            FailureKind::Permanent
        };
        Self { kind, message }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    pub fn timeout(step_id: &str, limit: Duration) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: format!(
                "timeout: step '{step_id}' did not finish within {:.1}s",
                limit.as_secs_f64()
            ),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

// ---------------------------------------------------------------------------
// RetryController
// ---------------------------------------------------------------------------

/// Result of running a step through the retry loop.
#[derive(Debug)]
pub struct RetryOutcome {
    pub result: Result<StepResult, StepFailure>,
    /// Handler invocations made, including the first.
    pub attempts: u32,
}

/// Drives attempts of a single step.
#[derive(Debug, Clone)]
pub struct RetryController {
    event_bus: EventBus,
}

impl RetryController {
    pub fn new(event_bus: EventBus) -> Self {
        Self { event_bus }
    }

    /// Run `attempt_fn` until it succeeds, fails permanently, or the retry
    /// budget is spent. Backoff sleeps suspend only the calling task and end
    /// early when `cancel` fires.
    pub async fn run<F, Fut>(
        &self,
        execution_id: Uuid,
        step: &WorkflowStep,
        timeout: Duration,
        cancel: &CancellationToken,
        mut attempt_fn: F,
    ) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<StepResult, StepFailure>>,
    {
        let policy = &step.retry_policy;
        let mut attempt: u32 = 0;

        loop {
            let outcome = match tokio::time::timeout(timeout, attempt_fn(attempt)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StepFailure::timeout(&step.step_id, timeout)),
            };

            let failure = match outcome {
                Ok(result) => {
                    return RetryOutcome {
                        result: Ok(result),
                        attempts: attempt + 1,
                    };
                }
                Err(failure) => failure,
            };

            let will_retry =
                failure.is_transient() && policy.should_retry(&failure.message, attempt);
            tracing::warn!(
                execution_id = %execution_id,
                step_id = %step.step_id,
                attempt,
                will_retry,
                error = %failure.message,
                "step attempt failed"
            );
            self.event_bus.publish(ExecutionEvent::StepFailed {
                execution_id,
                step_id: step.step_id.clone(),
                error: failure.message.clone(),
                will_retry,
            });

            if !will_retry {
                return RetryOutcome {
                    result: Err(failure),
                    attempts: attempt + 1,
                };
            }

            let delay = policy.delay(attempt);
            self.event_bus.publish(ExecutionEvent::StepRetrying {
                execution_id,
                step_id: step.step_id.clone(),
                attempt: attempt + 1,
                delay_ms: delay.as_millis() as u64,
            });

            tokio::select! {
                _ = cancel.cancelled() => {
                    return RetryOutcome {
                        result: Err(StepFailure::permanent("execution cancelled")),
                        attempts: attempt + 1,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
