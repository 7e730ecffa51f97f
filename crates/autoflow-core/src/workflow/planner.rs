//! AI planner collaborator and conversion of its plans into definitions.
//!
//! The engine does not care how a natural-language request is decomposed;
//! it only turns the resulting `PlannedWorkflow` into a new, immutable
//! `WorkflowDefinition`.

use std::future::Future;
use std::pin::Pin;

use autoflow_types::planner::PlannedWorkflow;
use autoflow_types::workflow::{WorkflowDefinition, WorkflowStep};
use thiserror::Error;
use uuid::Uuid;

use super::definition::WorkflowError;
use super::graph::validate_definition;

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("planner unavailable: {0}")]
    Unavailable(String),

    #[error("planner returned an unusable plan: {0}")]
    InvalidPlan(String),
}

/// Decomposes a request into a step graph.
pub trait Planner: Send + Sync {
    fn decompose(
        &self,
        query: &str,
        provider_hint: Option<&str>,
    ) -> impl Future<Output = Result<PlannedWorkflow, PlannerError>> + Send;
}

/// Object-safe version of [`Planner`].
pub trait PlannerDyn: Send + Sync {
    fn decompose_boxed<'a>(
        &'a self,
        query: &'a str,
        provider_hint: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<PlannedWorkflow, PlannerError>> + Send + 'a>>;
}

impl<T: Planner> PlannerDyn for T {
    fn decompose_boxed<'a>(
        &'a self,
        query: &'a str,
        provider_hint: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<PlannedWorkflow, PlannerError>> + Send + 'a>> {
        Box::pin(self.decompose(query, provider_hint))
    }
}

/// Type-erased planner.
pub struct BoxPlanner {
    inner: Box<dyn PlannerDyn>,
}

impl BoxPlanner {
    pub fn new<T: Planner + 'static>(planner: T) -> Self {
        Self {
            inner: Box::new(planner),
        }
    }

    pub async fn decompose(
        &self,
        query: &str,
        provider_hint: Option<&str>,
    ) -> Result<PlannedWorkflow, PlannerError> {
        self.inner.decompose_boxed(query, provider_hint).await
    }
}

/// Longest generated name taken from the query text.
const MAX_GENERATED_NAME_CHARS: usize = 60;

/// Build a validated definition from a plan.
///
/// Steps without ids get `step_{n}`. When the planner supplied no edges at
/// all, steps are chained in the order given.
pub fn build_definition(
    plan: PlannedWorkflow,
    query: &str,
) -> Result<WorkflowDefinition, WorkflowError> {
    if plan.steps.is_empty() {
        return Err(WorkflowError::Planner("plan contains no steps".to_string()));
    }

    let has_edges = plan
        .steps
        .iter()
        .any(|s| !s.next_steps.is_empty() || !s.parallel_steps.is_empty());

    let mut steps: Vec<WorkflowStep> = plan
        .steps
        .into_iter()
        .enumerate()
        .map(|(i, planned)| {
            let id = planned
                .step_id
                .unwrap_or_else(|| format!("step_{}", i + 1));
            let mut step = WorkflowStep::new(id, planned.step_type);
            step.description = planned.description;
            step.parameters = planned.parameters;
            step.next_steps = planned.next_steps;
            step.parallel_steps = planned.parallel_steps;
            if let Some(threshold) = planned.confidence_threshold {
                step.confidence_threshold = threshold;
            }
            step
        })
        .collect();

    if !has_edges {
        let ids: Vec<String> = steps.iter().map(|s| s.step_id.clone()).collect();
        for (step, next) in steps.iter_mut().zip(ids.iter().skip(1)) {
            step.next_steps = vec![next.clone()];
        }
    }

    let name = plan.name.unwrap_or_else(|| {
        let trimmed: String = query.trim().chars().take(MAX_GENERATED_NAME_CHARS).collect();
        if trimmed.is_empty() {
            "Generated workflow".to_string()
        } else {
            trimmed
        }
    });

    let def = WorkflowDefinition {
        id: format!("generated-{}", Uuid::now_v7()),
        name,
        description: plan.description.or_else(|| Some(query.to_string())),
        version: "1.0.0".to_string(),
        start_step: steps[0].step_id.clone(),
        steps,
        triggers: plan.trigger.into_iter().collect(),
    };

    validate_definition(&def)?;
    Ok(def)
}
