//! Result shape returned by self-healing fallback agents.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status string a fallback agent reports when recovery did not work.
pub const FALLBACK_FAILED: &str = "failed";

/// Response of `execute_fallback`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackOutcome {
    pub status: String,
    /// Which agent performed the recovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FallbackOutcome {
    pub fn success(agent: impl Into<String>, data: Value) -> Self {
        Self {
            status: "completed".to_string(),
            agent: Some(agent.into()),
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: FALLBACK_FAILED.to_string(),
            agent: None,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Any status other than "failed" counts as recovered.
    pub fn is_success(&self) -> bool {
        !self.status.eq_ignore_ascii_case(FALLBACK_FAILED)
    }
}
