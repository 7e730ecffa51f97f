//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`. Middleware: CORS and request tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(handlers::health))
        // Workflow definitions
        .route(
            "/workflows",
            post(handlers::workflow::create_workflow).get(handlers::workflow::list_workflows),
        )
        .route(
            "/workflows/generate",
            post(handlers::workflow::generate_workflow),
        )
        .route(
            "/workflows/{id}",
            get(handlers::workflow::get_workflow).delete(handlers::workflow::delete_workflow),
        )
        .route(
            "/workflows/{id}/execute",
            post(handlers::workflow::execute_workflow),
        )
        // Executions
        .route("/executions", get(handlers::execution::list_executions))
        .route("/executions/events", get(handlers::execution::stream_events))
        .route("/executions/{id}", get(handlers::execution::get_execution))
        .route(
            "/executions/{id}/resume",
            post(handlers::execution::resume_execution),
        )
        .route(
            "/executions/{id}/cancel",
            post(handlers::execution::cancel_execution),
        )
        // Event triggers
        .route("/events/{event_type}", post(handlers::event::trigger_event));

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
