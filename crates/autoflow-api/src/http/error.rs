//! Application error type mapping engine errors to HTTP status codes and the
//! envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use autoflow_core::workflow::definition::WorkflowError;

use crate::http::response::ApiResponse;

#[derive(Debug)]
pub enum AppError {
    Workflow(WorkflowError),
    NotFound(String),
    Validation(String),
    Internal(String),
}

impl From<WorkflowError> for AppError {
    fn from(e: WorkflowError) -> Self {
        AppError::Workflow(e)
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Workflow(e) => {
                let (status, code) = match e {
                    WorkflowError::NotFound(_) => (StatusCode::NOT_FOUND, "WORKFLOW_NOT_FOUND"),
                    WorkflowError::ExecutionNotFound(_) => {
                        (StatusCode::NOT_FOUND, "EXECUTION_NOT_FOUND")
                    }
                    WorkflowError::ExecutionBusy(_) => (StatusCode::CONFLICT, "EXECUTION_BUSY"),
                    WorkflowError::Validation(_)
                    | WorkflowError::UnknownStep { .. }
                    | WorkflowError::Parse(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
                    WorkflowError::CycleDetected(_) => (StatusCode::BAD_REQUEST, "CYCLE_DETECTED"),
                    WorkflowError::Planner(_) => (StatusCode::BAD_GATEWAY, "PLANNER_ERROR"),
                    WorkflowError::Persistence(_) | WorkflowError::Io(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
                    }
                };
                (status, code, e.to_string())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(code, %message, "request failed");
        }

        let body = serde_json::to_string(&ApiResponse::error(code, &message)).unwrap_or_else(|_| {
            r#"{"errors":[{"code":"SERIALIZATION_ERROR","message":"Failed to serialize response"}]}"#
                .to_string()
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn engine_errors_map_to_statuses() {
        let cases = [
            (WorkflowError::NotFound("wf".into()), StatusCode::NOT_FOUND),
            (
                WorkflowError::ExecutionNotFound(Uuid::now_v7()),
                StatusCode::NOT_FOUND,
            ),
            (
                WorkflowError::ExecutionBusy(Uuid::now_v7()),
                StatusCode::CONFLICT,
            ),
            (
                WorkflowError::CycleDetected("a".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                WorkflowError::Planner("down".into()),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(AppError::from(err).into_response().status(), expected);
        }
    }
}
