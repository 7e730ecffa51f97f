//! Workflow definition handlers: register, inspect, delete, execute and
//! generate.

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::{Value, json};

use autoflow_types::execution::ExecutionContext;
use autoflow_types::workflow::WorkflowDefinition;

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteRequest {
    /// Becomes `input_data`; object keys also seed the variables.
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub query: String,
    #[serde(default)]
    pub provider_hint: Option<String>,
}

fn summary(def: &WorkflowDefinition) -> Value {
    json!({
        "id": def.id,
        "name": def.name,
        "version": def.version,
        "start_step": def.start_step,
        "steps": def.steps.len(),
        "triggers": def.triggers,
    })
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/workflows
pub async fn create_workflow(
    State(state): State<AppState>,
    Json(def): Json<WorkflowDefinition>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();
    let mut body = summary(&def);
    let id = def.id.clone();

    let report = state.register_definition(def).await?;
    body["unreachable_steps"] = json!(report.unreachable);

    Ok(Json(
        timer
            .finish(body)
            .with_link("self", &format!("/api/v1/workflows/{id}"))
            .with_link("execute", &format!("/api/v1/workflows/{id}/execute")),
    ))
}

/// GET /api/v1/workflows
pub async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<Value>>>, AppError> {
    let timer = RequestTimer::start();
    let mut defs = state.engine.store().list().await;
    defs.sort_by(|a, b| a.id.cmp(&b.id));
    let body = defs.iter().map(|d| summary(d)).collect();
    Ok(Json(timer.finish(body).with_link("self", "/api/v1/workflows")))
}

/// GET /api/v1/workflows/{id}
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let timer = RequestTimer::start();
    let def = state.engine.store().get(&id).await?;
    Ok(Json(
        timer
            .finish(def.as_ref().clone())
            .with_link("self", &format!("/api/v1/workflows/{id}")),
    ))
}

/// DELETE /api/v1/workflows/{id}
pub async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();
    if !state.remove_definition(&id).await? {
        return Err(AppError::NotFound(format!("workflow '{id}' not found")));
    }
    Ok(Json(timer.finish(json!({ "deleted": id }))))
}

/// POST /api/v1/workflows/{id}/execute
///
/// Runs until the execution completes, fails or pauses for approval.
pub async fn execute_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<ApiResponse<ExecutionContext>>, AppError> {
    let timer = RequestTimer::start();
    let context = req
        .user_id
        .map(|user| ExecutionContext::new(id.clone(), Value::Null).with_user(user));

    let ctx = state.engine.execute_workflow(&id, req.input, context).await?;
    let href = format!("/api/v1/executions/{}", ctx.execution_id);
    Ok(Json(timer.finish(ctx).with_link("self", &href)))
}

/// POST /api/v1/workflows/generate
pub async fn generate_workflow(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let timer = RequestTimer::start();
    if req.query.trim().is_empty() {
        return Err(AppError::Validation("query must not be empty".to_string()));
    }
    let def = state
        .generate_definition(&req.query, req.provider_hint.as_deref())
        .await?;
    let href = format!("/api/v1/workflows/{}", def.id);
    Ok(Json(timer.finish(def).with_link("self", &href)))
}
