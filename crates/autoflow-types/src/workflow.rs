//! Workflow definition types.
//!
//! A `WorkflowDefinition` is the immutable graph the orchestrator walks. Each
//! `WorkflowStep` names a handler via its `StepType` tag, carries a parameter
//! map that may contain `{{token}}` templates, and points at the steps that
//! follow it sequentially (`next_steps`) or concurrently (`parallel_steps`).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// Immutable named graph of steps with one designated start step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Registry key. Unique across the graph store.
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    /// Id of the step traversal starts from.
    pub start_step: String,
    /// Steps in authoring order.
    pub steps: Vec<WorkflowStep>,
    /// Event names that start this workflow via `trigger_event`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    /// Look up a step by id.
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Whether this workflow declares the given trigger name.
    pub fn has_trigger(&self, event_type: &str) -> bool {
        self.triggers.iter().any(|t| t == event_type)
    }
}

// ---------------------------------------------------------------------------
// WorkflowStep
// ---------------------------------------------------------------------------

/// Default per-step timeout (5 minutes).
pub const DEFAULT_STEP_TIMEOUT_SECS: f64 = 300.0;

/// Ceiling for any authored duration: step timeouts and retry delays (one week).
pub const MAX_DURATION_SECS: f64 = 7.0 * 24.0 * 3600.0;

/// Largest accepted `exponential_base`.
pub const MAX_EXPONENTIAL_BASE: f64 = 100.0;

/// Float seconds to `Duration`, saturating instead of panicking on values
/// too large to represent. Negative and NaN inputs give zero.
pub fn saturating_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// A unit of work inside a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    #[serde(alias = "id")]
    pub step_id: String,

    /// Handler discriminator.
    #[serde(rename = "type")]
    pub step_type: StepType,

    #[serde(default)]
    pub description: String,

    /// Handler parameters. Strings may contain `{{token}}` templates.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, Value>,

    /// Guard expression (`variable OP literal`). Evaluated as a pass-through
    /// gate by the orchestrator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Steps launched concurrently after this one completes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallel_steps: Vec<String>,

    /// Steps run one at a time, in order, after this one (and its parallel
    /// fan-out) completes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_steps: Vec<String>,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Per-attempt timeout in seconds. Falls back to the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,

    /// Results with confidence below this floor pause for approval.
    /// The default of 1.0 never pauses a handler that reports no confidence.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Explicit fallback agent id for self-healing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_agent: Option<String>,
}

fn default_confidence_threshold() -> f64 {
    1.0
}

impl WorkflowStep {
    /// Minimal step of the given type with every optional field defaulted.
    pub fn new(step_id: impl Into<String>, step_type: StepType) -> Self {
        Self {
            step_id: step_id.into(),
            step_type,
            description: String::new(),
            parameters: HashMap::new(),
            condition: None,
            parallel_steps: Vec::new(),
            next_steps: Vec::new(),
            retry_policy: RetryPolicy::default(),
            timeout_secs: None,
            confidence_threshold: default_confidence_threshold(),
            fallback_agent: None,
        }
    }

    /// Effective per-attempt timeout.
    pub fn timeout(&self, default_secs: f64) -> Duration {
        let secs = self.timeout_secs.unwrap_or(default_secs);
        if secs.is_finite() && secs > 0.0 {
            saturating_duration(secs)
        } else {
            saturating_duration(DEFAULT_STEP_TIMEOUT_SECS)
        }
    }
}

// ---------------------------------------------------------------------------
// StepType
// ---------------------------------------------------------------------------

/// Closed set of step-type tags known to the engine.
///
/// Tags outside the known set round-trip through `Custom` so experimental
/// handlers can be registered without touching this enum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepType {
    Slack,
    Gmail,
    Notion,
    Salesforce,
    Hubspot,
    GoogleSheets,
    Shopify,
    HttpRequest,
    AiAnalysis,
    ConditionalLogic,
    DataTransform,
    Custom(String),
}

impl StepType {
    pub fn as_str(&self) -> &str {
        match self {
            StepType::Slack => "slack",
            StepType::Gmail => "gmail",
            StepType::Notion => "notion",
            StepType::Salesforce => "salesforce",
            StepType::Hubspot => "hubspot",
            StepType::GoogleSheets => "google_sheets",
            StepType::Shopify => "shopify",
            StepType::HttpRequest => "http_request",
            StepType::AiAnalysis => "ai_analysis",
            StepType::ConditionalLogic => "conditional_logic",
            StepType::DataTransform => "data_transform",
            StepType::Custom(tag) => tag,
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "slack" => StepType::Slack,
            "gmail" => StepType::Gmail,
            "notion" => StepType::Notion,
            "salesforce" => StepType::Salesforce,
            "hubspot" => StepType::Hubspot,
            "google_sheets" => StepType::GoogleSheets,
            "shopify" => StepType::Shopify,
            "http_request" | "http" => StepType::HttpRequest,
            "ai_analysis" => StepType::AiAnalysis,
            "conditional_logic" | "condition" => StepType::ConditionalLogic,
            "data_transform" => StepType::DataTransform,
            other => StepType::Custom(other.to_string()),
        })
    }
}

impl From<String> for StepType {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(t) => t,
            Err(never) => match never {},
        }
    }
}

impl From<StepType> for String {
    fn from(t: StepType) -> Self {
        t.as_str().to_string()
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Exponential-backoff retry policy with substring-based error classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    /// Lower-case substrings that mark an error message as transient.
    #[serde(default = "default_retryable_errors")]
    pub retryable_errors: Vec<String>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    60.0
}

fn default_exponential_base() -> f64 {
    2.0
}

fn default_retryable_errors() -> Vec<String> {
    [
        "timeout",
        "timed out",
        "connection",
        "rate limit",
        "temporary",
        "temporarily unavailable",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            exponential_base: default_exponential_base(),
            retryable_errors: default_retryable_errors(),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before the retry that follows failed attempt `attempt`
    /// (zero-based): `min(initial * base^attempt, max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_delay_secs * self.exponential_base.powi(exp);
        let secs = if raw.is_finite() {
            raw.min(self.max_delay_secs)
        } else {
            self.max_delay_secs
        };
        saturating_duration(secs)
    }

    /// Whether the lower-cased error text matches any retryable substring.
    pub fn is_retryable(&self, error: &str) -> bool {
        let lowered = error.to_lowercase();
        self.retryable_errors
            .iter()
            .any(|needle| lowered.contains(&needle.to_lowercase()))
    }

    /// True iff `attempt < max_retries` and the error is retryable.
    pub fn should_retry(&self, error: &str, attempt: u32) -> bool {
        attempt < self.max_retries && self.is_retryable(error)
    }
}
