//! Handlers the engine ships with.
//!
//! - `conditional_logic`: evaluates `parameters.condition` and selects
//!   `true_steps` or `false_steps` as the dynamic `next_steps`.
//! - `data_transform`: writes the `parameters.set` object into the
//!   execution's variables.

use serde_json::{Value, json};

use autoflow_types::execution::StepResult;

use super::condition;
use super::graph::{FALSE_STEPS_PARAM, TRUE_STEPS_PARAM, step_list_param};
use super::handler::{HandlerError, StepHandler, StepInvocation};

/// Branch selection through the condition evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionalLogicHandler;

impl StepHandler for ConditionalLogicHandler {
    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepResult, HandlerError> {
        let expression = invocation
            .param_str("condition")
            .or(invocation.step.condition.as_deref())
            .ok_or_else(|| {
                HandlerError::Permanent(format!(
                    "conditional_logic step '{}' has no condition",
                    invocation.step.step_id
                ))
            })?;

        let matched = condition::evaluate(expression, invocation.context);
        let key = if matched {
            TRUE_STEPS_PARAM
        } else {
            FALSE_STEPS_PARAM
        };
        let branch = step_list_param(invocation.parameters, key);

        tracing::debug!(
            step_id = %invocation.step.step_id,
            condition = expression,
            matched,
            ?branch,
            "conditional branch selected"
        );

        Ok(StepResult::completed(json!({
            "condition": expression,
            "result": matched,
            "branch": branch,
        }))
        .with_next_steps(branch))
    }
}

/// Copies `parameters.set` into execution variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataTransformHandler;

impl StepHandler for DataTransformHandler {
    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepResult, HandlerError> {
        let set = match invocation.parameters.get("set") {
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(HandlerError::Permanent(format!(
                    "data_transform step '{}': 'set' must be an object",
                    invocation.step.step_id
                )));
            }
            None => Default::default(),
        };

        let mut result = StepResult::completed(Value::Object(set.clone()));
        result.variables.extend(set);
        Ok(result)
    }
}
