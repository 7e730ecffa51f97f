//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.autoflow/` unless
//! `AUTOFLOW_DATA_DIR` says otherwise) into [`EngineConfig`]. Falls back to
//! defaults when the file is missing or malformed.

use std::path::{Path, PathBuf};

use autoflow_types::config::EngineConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "AUTOFLOW_DATA_DIR";

/// Config file name inside the data directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Resolve the data directory: `AUTOFLOW_DATA_DIR`, else `~/.autoflow`.
pub fn resolve_data_dir() -> PathBuf {
    match std::env::var_os(DATA_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".autoflow"),
    }
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// A missing file yields defaults silently; an unreadable or unparsable file
/// yields defaults with a warning.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(mut config) => {
            // Relative workflow directories are anchored at the data directory.
            if let Some(dir) = config.workflows_dir.take() {
                config.workflows_dir = Some(if dir.is_relative() {
                    data_dir.join(dir)
                } else {
                    dir
                });
            }
            config
        }
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"
default_step_timeout_secs = 30.0
workflows_dir = "workflows"

[server]
port = 9100

[fallback]
endpoint = "http://localhost:8001/fallback"
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.default_step_timeout_secs, 30.0);
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(
            config.fallback.endpoint.as_deref(),
            Some("http://localhost:8001/fallback")
        );
        assert_eq!(config.workflows_dir, Some(tmp.path().join("workflows")));
        assert_eq!(config.max_traversal_hops, 1000);
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn resolve_data_dir_is_never_empty() {
        assert!(!resolve_data_dir().as_os_str().is_empty());
    }
}
