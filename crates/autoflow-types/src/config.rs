//! Engine configuration types.
//!
//! `EngineConfig` represents the `config.toml` in the data directory. Every
//! field has a default so a partial (or missing) file is always valid.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::workflow::DEFAULT_STEP_TIMEOUT_SECS;

/// Top-level configuration for the workflow engine and its servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout applied to steps that do not set `timeout_secs`.
    #[serde(default = "default_step_timeout")]
    pub default_step_timeout_secs: f64,

    /// Ceiling on steps visited by one traversal. Guards against loops
    /// introduced by dynamically returned `next_steps`.
    #[serde(default = "default_max_traversal_hops")]
    pub max_traversal_hops: usize,

    /// Capacity of the broadcast channel carrying execution events.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Directory of workflow files registered at startup.
    #[serde(default)]
    pub workflows_dir: Option<PathBuf>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub fallback: FallbackConfig,

    #[serde(default)]
    pub planner: PlannerConfig,
}

fn default_step_timeout() -> f64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

fn default_max_traversal_hops() -> usize {
    1000
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout(),
            max_traversal_hops: default_max_traversal_hops(),
            event_bus_capacity: default_event_bus_capacity(),
            workflows_dir: None,
            server: ServerConfig::default(),
            fallback: FallbackConfig::default(),
            planner: PlannerConfig::default(),
        }
    }
}

/// REST server bind address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8700
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Remote self-healing agent settings. No endpoint means no fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_fallback_timeout")]
    pub timeout_secs: u64,
}

fn default_fallback_timeout() -> u64 {
    120
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_fallback_timeout(),
        }
    }
}

/// Remote planner used by `generate`. No endpoint disables generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_planner_timeout")]
    pub timeout_secs: u64,
}

fn default_planner_timeout() -> u64 {
    60
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_planner_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.default_step_timeout_secs, 300.0);
        assert_eq!(config.max_traversal_hops, 1000);
        assert_eq!(config.event_bus_capacity, 1024);
        assert_eq!(config.server.port, 8700);
        assert!(config.fallback.endpoint.is_none());
        assert!(config.planner.endpoint.is_none());
        assert_eq!(config.planner.timeout_secs, 60);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let config: EngineConfig = toml::from_str(
            r#"
default_step_timeout_secs = 30.0
workflows_dir = "/srv/workflows"

[server]
port = 9000

[fallback]
endpoint = "http://localhost:8800/heal"
"#,
        )
        .unwrap();
        assert_eq!(config.default_step_timeout_secs, 30.0);
        assert_eq!(config.max_traversal_hops, 1000);
        assert_eq!(config.workflows_dir, Some(PathBuf::from("/srv/workflows")));
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(
            config.fallback.endpoint.as_deref(),
            Some("http://localhost:8800/heal")
        );
        assert_eq!(config.fallback.timeout_secs, 120);
    }
}
