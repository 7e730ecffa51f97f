//! Handler registry and step dispatch.
//!
//! One handler per `StepType`. Dispatching an unregistered tag is not an
//! error: the step completes as a pass-through so experimental step types do
//! not halt a workflow. Handler panics are contained here and surface as
//! permanent failures.

use std::any::Any;
use std::sync::Arc;

use autoflow_types::execution::{StepResult, StepStatus};
use autoflow_types::workflow::StepType;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::json;

use super::builtin::{ConditionalLogicHandler, DataTransformHandler};
use super::handler::{BoxStepHandler, HandlerError, StepHandler, StepInvocation};
use super::retry::StepFailure;

/// Registry mapping step-type tags to handlers.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: DashMap<StepType, Arc<BoxStepHandler>>,
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the engine's built-in handlers
    /// (`conditional_logic`, `data_transform`).
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_handler(StepType::ConditionalLogic, ConditionalLogicHandler);
        registry.register_handler(StepType::DataTransform, DataTransformHandler);
        registry
    }

    /// Register `handler` for `step_type`, replacing any previous handler.
    pub fn register_handler<H: StepHandler + 'static>(&self, step_type: StepType, handler: H) {
        self.register_boxed(step_type, BoxStepHandler::new(handler));
    }

    pub fn register_boxed(&self, step_type: StepType, handler: BoxStepHandler) {
        let replaced = self
            .handlers
            .insert(step_type.clone(), Arc::new(handler))
            .is_some();
        tracing::debug!(step_type = %step_type, replaced, "registered step handler");
    }

    pub fn contains(&self, step_type: &StepType) -> bool {
        self.handlers.contains_key(step_type)
    }

    /// Registered tags, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .handlers
            .iter()
            .map(|e| e.key().to_string())
            .collect();
        tags.sort();
        tags
    }

    /// Run one attempt of a step through its handler.
    ///
    /// Handler errors and `status: failed` results become `StepFailure`s
    /// classified by the step's retry policy.
    pub async fn dispatch(&self, invocation: StepInvocation<'_>) -> Result<StepResult, StepFailure> {
        let step = invocation.step;
        let handler = self
            .handlers
            .get(&step.step_type)
            .map(|entry| Arc::clone(entry.value()));

        let Some(handler) = handler else {
            tracing::debug!(
                step_id = %step.step_id,
                step_type = %step.step_type,
                "no handler registered, passing step through"
            );
            return Ok(StepResult::completed(json!({
                "skipped": true,
                "reason": format!("no handler registered for '{}'", step.step_type),
            })));
        };

        let policy = &step.retry_policy;
        match std::panic::AssertUnwindSafe(handler.execute(invocation))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) if result.status == StepStatus::Failed => {
                let message = result
                    .error
                    .unwrap_or_else(|| format!("step '{}' reported failure", step.step_id));
                Err(StepFailure::classify(message, policy))
            }
            Ok(Ok(result)) => Ok(result),
            Ok(Err(HandlerError::Failed(message))) => Err(StepFailure::classify(message, policy)),
            Ok(Err(HandlerError::Permanent(message))) => Err(StepFailure::permanent(message)),
            Err(panic) => {
                let message = format!("handler panicked: {}", panic_message(panic.as_ref()));
                tracing::error!(step_id = %step.step_id, %message, "step handler panicked");
                Err(StepFailure::permanent(message))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
