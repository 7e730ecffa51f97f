use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use serde_json::{Value, json};

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// POST /api/v1/events/{event_type}
///
/// Starts every workflow triggered by `event_type` in the background. The
/// optional JSON body becomes each execution's input.
pub async fn trigger_event(
    State(state): State<AppState>,
    Path(event_type): Path<String>,
    body: Bytes,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();
    let data = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::Validation(format!("event body is not valid JSON: {e}")))?
    };

    let started = state.engine.trigger_event(&event_type, data).await;
    Ok(Json(timer.finish(json!({
        "event_type": event_type,
        "started": started,
    }))))
}
