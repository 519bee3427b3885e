//! Configuration model for editrpc
//!
//! Loaded from TOML; every key is optional.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// editrpc configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EditRpcConfig {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Runtime settings for a served connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSettings {
    /// Per-request execution limit; 0 disables it
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Cap on concurrently running Parallel items, unbounded when unset
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    #[serde(default = "defaults::content_modified")]
    pub content_modified: bool,

    /// Wait limit for requests sent to the remote peer
    #[serde(default = "defaults::outbound_timeout_secs")]
    pub outbound_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: defaults::request_timeout_secs(),
            max_concurrency: None,
            content_modified: defaults::content_modified(),
            outbound_timeout_secs: defaults::outbound_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, overridden by RUST_LOG
    #[serde(default = "defaults::filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: defaults::filter(),
        }
    }
}

mod defaults {
    // Server
    pub fn request_timeout_secs() -> u64 {
        300
    }
    pub fn content_modified() -> bool {
        true
    }
    pub fn outbound_timeout_secs() -> u64 {
        30
    }

    // Logging
    pub fn filter() -> String {
        "editrpc=warn".to_string()
    }
}

impl EditRpcConfig {
    /// Load from an explicit path, else the global config file, else defaults.
    pub async fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound(format!(
                        "Config file does not exist: {}",
                        path.display()
                    )));
                }
                Self::load_from_path(path).await?
            }
            None => Self::load_from_path(&Self::global_config_path()).await?,
        };
        let config = apply_env_overrides(config);
        config.validate()?;
        Ok(config)
    }

    pub fn global_config_path() -> PathBuf {
        // XDG standard: ~/.config/editrpc/config.toml
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .ok()
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("editrpc")
            .join("config.toml")
    }

    async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path).await?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_concurrency == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "server.max_concurrency".to_string(),
                message: "must be at least 1 (omit it for no limit)".to_string(),
            });
        }
        Ok(())
    }
}

fn apply_env_overrides(mut config: EditRpcConfig) -> EditRpcConfig {
    if let Ok(val) = std::env::var("EDITRPC_REQUEST_TIMEOUT")
        && let Ok(secs) = val.parse()
    {
        config.server.request_timeout_secs = secs;
    }
    if let Ok(val) = std::env::var("EDITRPC_MAX_CONCURRENCY")
        && let Ok(limit) = val.parse()
    {
        config.server.max_concurrency = Some(limit);
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EditRpcConfig::default();
        assert_eq!(config.server.request_timeout_secs, 300);
        assert_eq!(config.server.max_concurrency, None);
        assert!(config.server.content_modified);
        assert_eq!(config.server.outbound_timeout_secs, 30);
        assert_eq!(config.logging.filter, "editrpc=warn");
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let config: EditRpcConfig = toml::from_str(
            r#"
            [server]
            max_concurrency = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.server.max_concurrency, Some(4));
        assert_eq!(config.server.request_timeout_secs, 300);
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[tokio::test]
    async fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[server]\ncontent_modified = false\noutbound_timeout_secs = 5\n",
        )
        .unwrap();

        let config = EditRpcConfig::load(Some(&path)).await.unwrap();
        assert!(!config.server.content_modified);
        assert_eq!(config.server.outbound_timeout_secs, 5);
    }

    #[tokio::test]
    async fn test_load_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nrequest_timeout_secs = ").unwrap();

        assert!(matches!(
            EditRpcConfig::load(Some(&path)).await,
            Err(ConfigError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_load_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            EditRpcConfig::load(Some(&path)).await,
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let mut config = EditRpcConfig::default();
        config.server.max_concurrency = Some(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
