//! Step handler capability and its object-safe wrapper.
//!
//! Concrete integrations (Slack, Gmail, Notion, HTTP, ...) implement
//! [`StepHandler`] outside the engine. The registry stores them type-erased:
//! 1. `StepHandlerDyn` is an object-safe mirror with boxed futures
//! 2. a blanket impl covers every `T: StepHandler`
//! 3. `BoxStepHandler` wraps `Box<dyn StepHandlerDyn>` and delegates

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use autoflow_types::execution::{ExecutionContext, StepResult};
use autoflow_types::workflow::WorkflowStep;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Everything a handler sees for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct StepInvocation<'a> {
    pub execution_id: Uuid,
    /// The step as defined. Read-only.
    pub step: &'a WorkflowStep,
    /// Parameters after template resolution, fresh for this invocation.
    pub parameters: &'a HashMap<String, Value>,
    /// Snapshot of the execution taken before the step started.
    pub context: &'a ExecutionContext,
    /// Zero-based attempt number.
    pub attempt: u32,
}

impl StepInvocation<'_> {
    /// String parameter lookup.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

/// Errors a handler may return.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// Classified against the step's retryable substrings.
    #[error("{0}")]
    Failed(String),

    /// Never retried, regardless of message.
    #[error("{0}")]
    Permanent(String),
}

/// A step implementation registered under one `StepType` tag.
///
/// Uses RPITIT for the async method, consistent with the repository traits.
pub trait StepHandler: Send + Sync {
    fn execute(
        &self,
        invocation: StepInvocation<'_>,
    ) -> impl Future<Output = Result<StepResult, HandlerError>> + Send;
}

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        invocation: StepInvocation<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<StepResult, HandlerError>> + Send + 'a>>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        invocation: StepInvocation<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<StepResult, HandlerError>> + Send + 'a>> {
        Box::pin(self.execute(invocation))
    }
}

/// Type-erased step handler.
pub struct BoxStepHandler {
    inner: Box<dyn StepHandlerDyn>,
}

impl BoxStepHandler {
    pub fn new<T: StepHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepResult, HandlerError> {
        self.inner.execute_boxed(invocation).await
    }
}

impl std::fmt::Debug for BoxStepHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepHandler").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// FnStepHandler
// ---------------------------------------------------------------------------

/// Adapter turning a synchronous closure into a handler. Handy for small
/// in-process transforms and for tests.
pub struct FnStepHandler<F> {
    func: F,
}

impl<F> FnStepHandler<F>
where
    F: Fn(StepInvocation<'_>) -> Result<StepResult, HandlerError> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> StepHandler for FnStepHandler<F>
where
    F: Fn(StepInvocation<'_>) -> Result<StepResult, HandlerError> + Send + Sync,
{
    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepResult, HandlerError> {
        (self.func)(invocation)
    }
}
