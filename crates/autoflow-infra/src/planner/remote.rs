//! HTTP client for an external planning service.
//!
//! Sends `POST {endpoint}` with `{ "query": ..., "provider_hint": ... }` and
//! expects a `PlannedWorkflow` back.

use std::time::Duration;

use autoflow_core::workflow::planner::{Planner, PlannerError};
use autoflow_types::config::PlannerConfig;
use autoflow_types::planner::PlannedWorkflow;
use serde_json::json;

#[derive(Debug, Clone)]
pub struct RemotePlanner {
    endpoint: String,
    client: reqwest::Client,
}

impl RemotePlanner {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, PlannerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PlannerError::Unavailable(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    /// Planner for the configured endpoint, if one is set.
    pub fn from_config(config: &PlannerConfig) -> Result<Option<Self>, PlannerError> {
        match config.endpoint.as_deref() {
            Some(endpoint) => {
                Self::new(endpoint, Duration::from_secs(config.timeout_secs)).map(Some)
            }
            None => Ok(None),
        }
    }
}

impl Planner for RemotePlanner {
    async fn decompose(
        &self,
        query: &str,
        provider_hint: Option<&str>,
    ) -> Result<PlannedWorkflow, PlannerError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "query": query, "provider_hint": provider_hint }))
            .send()
            .await
            .map_err(|e| PlannerError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PlannerError::Unavailable(format!(
                "planner returned {}",
                status.as_u16()
            )));
        }

        let plan: PlannedWorkflow = response
            .json()
            .await
            .map_err(|e| PlannerError::InvalidPlan(e.to_string()))?;
        tracing::debug!(steps = plan.steps.len(), "planner decomposed request");
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoflow_types::workflow::StepType;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/plan")
    }

    #[tokio::test]
    async fn decodes_plan_and_forwards_hint() {
        let app = Router::new().route(
            "/plan",
            post(|Json(req): Json<Value>| async move {
                Json(json!({
                    "name": req["provider_hint"],
                    "steps": [
                        {"type": "http_request", "description": req["query"], "parameters": {"url": "http://x"}},
                        {"type": "notification"}
                    ],
                    "trigger": "daily"
                }))
            }),
        );
        let planner = RemotePlanner::new(spawn(app).await, Duration::from_secs(5)).unwrap();
        let plan = planner
            .decompose("fetch the report and notify me", Some("gmail"))
            .await
            .unwrap();

        assert_eq!(plan.name.as_deref(), Some("gmail"));
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].step_type, StepType::HttpRequest);
        assert_eq!(plan.steps[0].description, "fetch the report and notify me");
        assert_eq!(plan.trigger.as_deref(), Some("daily"));
    }

    #[tokio::test]
    async fn malformed_plan_is_invalid() {
        let app = Router::new().route("/plan", post(|| async { Json(json!({"oops": true})) }));
        let planner = RemotePlanner::new(spawn(app).await, Duration::from_secs(5)).unwrap();
        let err = planner.decompose("anything", None).await.unwrap_err();
        assert!(matches!(err, PlannerError::InvalidPlan(_)));
    }

    #[tokio::test]
    async fn server_error_is_unavailable() {
        let app = Router::new().route(
            "/plan",
            post(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        );
        let planner = RemotePlanner::new(spawn(app).await, Duration::from_secs(5)).unwrap();
        let err = planner.decompose("anything", None).await.unwrap_err();
        assert!(matches!(err, PlannerError::Unavailable(ref m) if m.contains("503")));
    }
}
