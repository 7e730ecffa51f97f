//! Self-healing fallback after retries are exhausted.
//!
//! The coordinator picks an agent (the step's explicit `fallback_agent`, else
//! the default), asks whether the error is worth a fallback, and if so hands
//! the agent a service key, the step description as goal, and the resolved
//! parameters. A recovered outcome replaces the step result; anything else
//! surfaces the step's ORIGINAL failure so the execution records the root
//! cause rather than the fallback's own error.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use autoflow_types::event::ExecutionEvent;
use autoflow_types::execution::StepResult;
use autoflow_types::fallback::FallbackOutcome;
use autoflow_types::workflow::WorkflowStep;
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use super::retry::StepFailure;
use crate::event::EventBus;

/// Output marker of a step recovered through self-healing.
pub const SELF_HEALED_STATUS: &str = "completed via self-healing";

// ---------------------------------------------------------------------------
// Agent trait
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("fallback agent unavailable: {0}")]
    Unavailable(String),

    #[error("fallback request failed: {0}")]
    Request(String),
}

/// External automation agent able to complete a step another way
/// (for example by driving the integration's web UI).
pub trait FallbackAgent: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this error is one the agent can plausibly work around.
    fn should_fallback(&self, error: &str) -> bool;

    fn execute_fallback(
        &self,
        service_key: &str,
        goal: &str,
        parameters: &HashMap<String, Value>,
    ) -> impl Future<Output = Result<FallbackOutcome, FallbackError>> + Send;
}

/// Object-safe version of [`FallbackAgent`].
pub trait FallbackAgentDyn: Send + Sync {
    fn name(&self) -> &str;

    fn should_fallback(&self, error: &str) -> bool;

    fn execute_fallback_boxed<'a>(
        &'a self,
        service_key: &'a str,
        goal: &'a str,
        parameters: &'a HashMap<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<FallbackOutcome, FallbackError>> + Send + 'a>>;
}

impl<T: FallbackAgent> FallbackAgentDyn for T {
    fn name(&self) -> &str {
        FallbackAgent::name(self)
    }

    fn should_fallback(&self, error: &str) -> bool {
        FallbackAgent::should_fallback(self, error)
    }

    fn execute_fallback_boxed<'a>(
        &'a self,
        service_key: &'a str,
        goal: &'a str,
        parameters: &'a HashMap<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<FallbackOutcome, FallbackError>> + Send + 'a>> {
        Box::pin(self.execute_fallback(service_key, goal, parameters))
    }
}

/// Type-erased fallback agent.
pub struct BoxFallbackAgent {
    inner: Box<dyn FallbackAgentDyn>,
}

impl BoxFallbackAgent {
    pub fn new<T: FallbackAgent + 'static>(agent: T) -> Self {
        Self {
            inner: Box::new(agent),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn should_fallback(&self, error: &str) -> bool {
        self.inner.should_fallback(error)
    }

    pub async fn execute_fallback(
        &self,
        service_key: &str,
        goal: &str,
        parameters: &HashMap<String, Value>,
    ) -> Result<FallbackOutcome, FallbackError> {
        self.inner
            .execute_fallback_boxed(service_key, goal, parameters)
            .await
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Both automated retry and self-healing failed. Carries the original error.
#[derive(Debug, Error)]
#[error("fallback exhausted: {original}")]
pub struct FallbackExhausted {
    pub original: StepFailure,
}

/// Routes exhausted step failures to fallback agents.
#[derive(Default)]
pub struct FallbackCoordinator {
    agents: HashMap<String, Arc<BoxFallbackAgent>>,
    default_agent: Option<String>,
    event_bus: Option<EventBus>,
}

impl FallbackCoordinator {
    /// Coordinator without agents: every failure is final.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an agent under its own name. The first agent added becomes the
    /// default.
    pub fn with_agent<T: FallbackAgent + 'static>(self, agent: T) -> Self {
        self.with_boxed_agent(BoxFallbackAgent::new(agent))
    }

    pub fn with_boxed_agent(mut self, agent: BoxFallbackAgent) -> Self {
        let name = agent.name().to_string();
        if self.default_agent.is_none() {
            self.default_agent = Some(name.clone());
        }
        self.agents.insert(name, Arc::new(agent));
        self
    }

    /// Choose which registered agent handles steps without an explicit one.
    pub fn with_default_agent(mut self, name: impl Into<String>) -> Self {
        self.default_agent = Some(name.into());
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn has_agents(&self) -> bool {
        !self.agents.is_empty()
    }

    /// Integration key for a step: the resolved `service` parameter, else the
    /// type tag.
    pub fn service_key(step: &WorkflowStep, parameters: &HashMap<String, Value>) -> String {
        parameters
            .get("service")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| step.step_type.to_string())
    }

    fn agent_for(&self, step: &WorkflowStep) -> Option<Arc<BoxFallbackAgent>> {
        if let Some(name) = &step.fallback_agent {
            match self.agents.get(name) {
                Some(agent) => return Some(Arc::clone(agent)),
                None => tracing::warn!(
                    step_id = %step.step_id,
                    agent = %name,
                    "fallback agent not registered, using default"
                ),
            }
        }
        self.default_agent
            .as_ref()
            .and_then(|name| self.agents.get(name))
            .cloned()
    }

    /// Try to recover a failed step.
    pub async fn recover(
        &self,
        execution_id: Uuid,
        step: &WorkflowStep,
        parameters: &HashMap<String, Value>,
        failure: StepFailure,
    ) -> Result<StepResult, FallbackExhausted> {
        let Some(agent) = self.agent_for(step) else {
            return Err(FallbackExhausted { original: failure });
        };
        if !agent.should_fallback(&failure.message) {
            tracing::debug!(
                step_id = %step.step_id,
                agent = agent.name(),
                "agent declined fallback"
            );
            return Err(FallbackExhausted { original: failure });
        }

        let service = Self::service_key(step, parameters);
        let goal = if step.description.is_empty() {
            format!("complete the '{}' step using {}", step.step_id, service)
        } else {
            step.description.clone()
        };

        tracing::info!(
            execution_id = %execution_id,
            step_id = %step.step_id,
            agent = agent.name(),
            service = %service,
            "attempting self-healing fallback"
        );

        let outcome = agent.execute_fallback(&service, &goal, parameters).await;
        let recovered = matches!(&outcome, Ok(o) if o.is_success());
        if let Some(bus) = &self.event_bus {
            bus.publish(ExecutionEvent::FallbackInvoked {
                execution_id,
                step_id: step.step_id.clone(),
                service: service.clone(),
                recovered,
            });
        }

        match outcome {
            Ok(outcome) if outcome.is_success() => {
                let agent_name = outcome.agent.unwrap_or_else(|| agent.name().to_string());
                Ok(StepResult::completed(json!({
                    "status": SELF_HEALED_STATUS,
                    "agent": agent_name,
                    "service": service,
                    "data": outcome.data.unwrap_or(Value::Null),
                })))
            }
            Ok(outcome) => {
                tracing::warn!(
                    step_id = %step.step_id,
                    fallback_error = outcome.error.as_deref().unwrap_or("unknown"),
                    "self-healing fallback failed"
                );
                Err(FallbackExhausted { original: failure })
            }
            Err(e) => {
                tracing::warn!(step_id = %step.step_id, error = %e, "fallback agent errored");
                Err(FallbackExhausted { original: failure })
            }
        }
    }
}

impl std::fmt::Debug for FallbackCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.agents.keys().collect();
        names.sort();
        f.debug_struct("FallbackCoordinator")
            .field("agents", &names)
            .field("default_agent", &self.default_agent)
            .finish()
    }
}
