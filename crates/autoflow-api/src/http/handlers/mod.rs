//! REST API request handlers, one module per resource.

pub mod event;
pub mod execution;
pub mod workflow;

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// GET /api/v1/health
pub async fn health(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    let timer = RequestTimer::start();
    Json(timer.finish(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "workflows": state.engine.store().len().await,
        "active_executions": state.engine.active_executions().len(),
        "handlers": state.engine.registry().registered_types(),
    })))
}
