//! HTTP client for an external self-healing agent.
//!
//! The agent receives `POST {endpoint}` with
//! `{ "service": ..., "goal": ..., "parameters": {...} }` and answers with a
//! `FallbackOutcome` (`{ status, agent?, data?, error? }`).

use std::collections::HashMap;
use std::time::Duration;

use autoflow_core::workflow::fallback::{FallbackAgent, FallbackError};
use autoflow_types::config::FallbackConfig;
use autoflow_types::fallback::FallbackOutcome;
use serde_json::{Value, json};

/// Errors the remote agent is never asked to work around.
const DECLINED_ERRORS: &[&str] = &["execution cancelled", "handler panicked"];

/// Fallback agent reached over HTTP.
#[derive(Debug, Clone)]
pub struct RemoteFallbackAgent {
    name: String,
    endpoint: String,
    client: reqwest::Client,
}

impl RemoteFallbackAgent {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, FallbackError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FallbackError::Unavailable(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            endpoint: endpoint.into(),
            client,
        })
    }

    /// Agent for the configured endpoint, if one is set.
    pub fn from_config(config: &FallbackConfig) -> Result<Option<Self>, FallbackError> {
        let Some(endpoint) = config.endpoint.as_deref() else {
            return Ok(None);
        };
        Self::new(
            "remote",
            endpoint,
            Duration::from_secs(config.timeout_secs),
        )
        .map(Some)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl FallbackAgent for RemoteFallbackAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn should_fallback(&self, error: &str) -> bool {
        let lower = error.to_lowercase();
        !DECLINED_ERRORS.iter().any(|d| lower.contains(d))
    }

    async fn execute_fallback(
        &self,
        service_key: &str,
        goal: &str,
        parameters: &HashMap<String, Value>,
    ) -> Result<FallbackOutcome, FallbackError> {
        tracing::debug!(endpoint = %self.endpoint, service = service_key, "calling fallback agent");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({
                "service": service_key,
                "goal": goal,
                "parameters": parameters,
            }))
            .send()
            .await
            .map_err(|e| FallbackError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FallbackError::Request(format!(
                "agent returned {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            )));
        }

        response
            .json::<FallbackOutcome>()
            .await
            .map_err(|e| FallbackError::Request(format!("invalid agent response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};

    async fn spawn_agent(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/fallback")
    }

    #[tokio::test]
    async fn posts_request_and_parses_outcome() {
        let app = Router::new().route(
            "/fallback",
            post(|Json(req): Json<Value>| async move {
                Json(json!({
                    "status": "success",
                    "agent": "browser",
                    "data": {"service": req["service"], "goal": req["goal"], "channel": req["parameters"]["channel"]},
                }))
            }),
        );
        let endpoint = spawn_agent(app).await;
        let agent = RemoteFallbackAgent::new("remote", endpoint, Duration::from_secs(5)).unwrap();

        let mut params = HashMap::new();
        params.insert("channel".to_string(), json!("#ops"));
        let outcome = agent
            .execute_fallback("slack", "Post the daily summary", &params)
            .await
            .unwrap();

        assert!(outcome.is_success());
        let data = outcome.data.unwrap();
        assert_eq!(data["service"], json!("slack"));
        assert_eq!(data["goal"], json!("Post the daily summary"));
        assert_eq!(data["channel"], json!("#ops"));
    }

    #[tokio::test]
    async fn failed_outcome_is_not_success() {
        let app = Router::new().route(
            "/fallback",
            post(|| async { Json(json!({"status": "failed", "error": "captcha"})) }),
        );
        let agent = RemoteFallbackAgent::new("remote", spawn_agent(app).await, Duration::from_secs(5))
            .unwrap();
        let outcome = agent
            .execute_fallback("gmail", "send", &HashMap::new())
            .await
            .unwrap();
        assert!(!outcome.is_success());
        assert_eq!(outcome.error.as_deref(), Some("captcha"));
    }

    #[tokio::test]
    async fn error_status_is_request_error() {
        let app = Router::new().route(
            "/fallback",
            post(|| async { (StatusCode::BAD_GATEWAY, "agent down") }),
        );
        let agent = RemoteFallbackAgent::new("remote", spawn_agent(app).await, Duration::from_secs(5))
            .unwrap();
        let err = agent
            .execute_fallback("gmail", "send", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FallbackError::Request(ref m) if m.contains("502")));
    }

    #[test]
    fn declines_cancellations() {
        let agent =
            RemoteFallbackAgent::new("remote", "http://localhost:1", Duration::from_secs(1)).unwrap();
        assert!(agent.should_fallback("API quota exceeded"));
        assert!(!agent.should_fallback("execution cancelled"));
    }

    #[test]
    fn from_config_requires_endpoint() {
        assert!(
            RemoteFallbackAgent::from_config(&FallbackConfig::default())
                .unwrap()
                .is_none()
        );
        let config = FallbackConfig {
            endpoint: Some("http://agent.local/fallback".into()),
            timeout_secs: 10,
        };
        let agent = RemoteFallbackAgent::from_config(&config).unwrap().unwrap();
        assert_eq!(agent.endpoint(), "http://agent.local/fallback");
    }
}
