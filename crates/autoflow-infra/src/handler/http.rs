//! `http_request` step handler.
//!
//! Parameters:
//! - `url` (required)
//! - `method` (default `GET`)
//! - `headers`: object of header name to string value
//! - `body`: string sent verbatim, or any other JSON value sent as JSON
//!
//! Output is `{ status, headers, body }`, with `body` parsed as JSON when the
//! response is JSON. Error messages are worded so the retry policy's default
//! substrings classify 429/5xx and network failures as transient and other
//! 4xx responses as permanent.

use std::collections::HashMap;
use std::time::Duration;

use autoflow_core::workflow::handler::{HandlerError, StepHandler, StepInvocation};
use autoflow_types::execution::StepResult;
use serde_json::{Value, json};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Makes one HTTP request per invocation through a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpRequestHandler {
    client: reqwest::Client,
}

impl HttpRequestHandler {
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

fn classify_transport_error(url: &str, err: &reqwest::Error) -> HandlerError {
    if err.is_timeout() {
        HandlerError::Failed(format!("timeout: request to '{url}' timed out"))
    } else if err.is_connect() {
        HandlerError::Failed(format!("connection error: request to '{url}' failed: {err}"))
    } else {
        HandlerError::Failed(format!("HTTP request to '{url}' failed: {err}"))
    }
}

fn classify_status(url: &str, status: u16, body: &str) -> HandlerError {
    let snippet: String = body.chars().take(200).collect();
    match status {
        429 => HandlerError::Failed(format!("rate limit: '{url}' returned 429: {snippet}")),
        500..=599 => HandlerError::Failed(format!(
            "temporary server error: '{url}' returned {status}: {snippet}"
        )),
        _ => HandlerError::Permanent(format!("'{url}' returned {status}: {snippet}")),
    }
}

impl StepHandler for HttpRequestHandler {
    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepResult, HandlerError> {
        let url = invocation.param_str("url").ok_or_else(|| {
            HandlerError::Permanent(format!(
                "http_request step '{}' requires a 'url' parameter",
                invocation.step.step_id
            ))
        })?;
        let method = invocation.param_str("method").unwrap_or("GET");
        let http_method: reqwest::Method = method
            .to_uppercase()
            .parse()
            .map_err(|_| HandlerError::Permanent(format!("invalid HTTP method: {method}")))?;

        let mut request = self.client.request(http_method, url);

        if let Some(Value::Object(headers)) = invocation.parameters.get("headers") {
            for (name, value) in headers {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                request = request.header(name.as_str(), value);
            }
        }

        match invocation.parameters.get("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(body)) => request = request.body(body.clone()),
            Some(body) => request = request.json(body),
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_transport_error(url, &e))?;

        let status = response.status().as_u16();
        let response_headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or("<binary>").to_string(),
                )
            })
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| classify_transport_error(url, &e))?;

        if status >= 400 {
            return Err(classify_status(url, status, &text));
        }

        tracing::info!(
            execution_id = %invocation.execution_id,
            step_id = %invocation.step.step_id,
            url,
            status,
            body_len = text.len(),
            "HTTP step completed"
        );

        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        Ok(StepResult::completed(json!({
            "status": status,
            "headers": response_headers,
            "body": body,
        })))
    }
}
