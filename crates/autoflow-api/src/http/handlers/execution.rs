//! Execution handlers: inspect, list, resume, cancel and stream events.

use std::convert::Infallible;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::Stream;
use uuid::Uuid;

use autoflow_core::repository::execution::ExecutionPersister;
use autoflow_types::execution::{ExecutionContext, WorkflowStatus};

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListExecutionsQuery {
    /// Defaults to `waiting_approval`.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    20
}

#[derive(Debug, Default, Deserialize)]
pub struct ResumeRequest {
    /// Step to approve. Omitted means the first step awaiting approval.
    #[serde(default)]
    pub step_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventStreamQuery {
    #[serde(default)]
    pub execution_id: Option<Uuid>,
}

/// GET /api/v1/executions/{id}
pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<ExecutionContext>>, AppError> {
    let timer = RequestTimer::start();
    let ctx = state
        .engine
        .get_execution(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("execution {id} not found")))?;
    let workflow = format!("/api/v1/workflows/{}", ctx.workflow_id);
    Ok(Json(
        timer
            .finish(ctx)
            .with_link("self", &format!("/api/v1/executions/{id}"))
            .with_link("workflow", &workflow),
    ))
}

/// GET /api/v1/executions?status=waiting_approval&limit=20
pub async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<Json<ApiResponse<Vec<ExecutionContext>>>, AppError> {
    let timer = RequestTimer::start();
    let status = match query.status.as_deref() {
        None => WorkflowStatus::WaitingApproval,
        Some(raw) => raw.parse::<WorkflowStatus>().map_err(AppError::Validation)?,
    };

    let executions = state
        .engine
        .persister()
        .list_by_status(status, query.limit)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(timer.finish(executions)))
}

/// POST /api/v1/executions/{id}/resume
pub async fn resume_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ResumeRequest>,
) -> Result<Json<ApiResponse<ExecutionContext>>, AppError> {
    let timer = RequestTimer::start();
    let step_id = match req.step_id {
        Some(step_id) => step_id,
        None => {
            let ctx = state
                .engine
                .get_execution(id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("execution {id} not found")))?;
            match ctx.pending_approvals().into_iter().next() {
                Some(step_id) => step_id,
                None => return Ok(Json(timer.finish(ctx))),
            }
        }
    };

    let ctx = state.engine.resume_workflow(id, &step_id).await?;
    Ok(Json(timer.finish(ctx)))
}

/// POST /api/v1/executions/{id}/cancel
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<ExecutionContext>>, AppError> {
    let timer = RequestTimer::start();
    let ctx = state.engine.cancel_execution(id).await?;
    Ok(Json(timer.finish(ctx)))
}

/// GET /api/v1/executions/events
///
/// Server-sent stream of execution events.
///
/// Each SSE event is named after the event's `type` tag. A `lagged` event
/// reports how many events a slow client missed.
pub async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<EventStreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.engine.event_bus().subscribe();
    let filter = query.execution_id;

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if filter.is_some_and(|id| id != event.execution_id()) {
                        continue;
                    }
                    let payload = serde_json::to_value(&event).unwrap_or_default();
                    let kind = payload
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("event")
                        .to_string();
                    yield Ok(Event::default().event(kind).data(payload.to_string()));
                }
                Err(RecvError::Lagged(skipped)) => {
                    let data = serde_json::json!({ "skipped": skipped });
                    yield Ok(Event::default().event("lagged").data(data.to_string()));
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
