//! Global Configuration Singleton

use std::sync::OnceLock;
use std::time::Duration;

use crate::models::config::EditRpcConfig;

static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    request_timeout: Option<Duration>,
    pub max_concurrency: Option<usize>,
    pub content_modified: bool,
    outbound_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from(&EditRpcConfig::default())
    }
}

impl From<&EditRpcConfig> for RuntimeConfig {
    fn from(config: &EditRpcConfig) -> Self {
        let server = &config.server;
        Self {
            request_timeout: (server.request_timeout_secs > 0)
                .then(|| Duration::from_secs(server.request_timeout_secs)),
            max_concurrency: server.max_concurrency,
            content_modified: server.content_modified,
            outbound_timeout: Duration::from_secs(server.outbound_timeout_secs),
        }
    }
}

impl RuntimeConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub fn outbound_timeout(&self) -> Duration {
        self.outbound_timeout
    }
}

pub fn init(config: &EditRpcConfig) {
    let _ = CONFIG.set(RuntimeConfig::from(config));
}

/// `None` when request timeouts are disabled
pub fn request_timeout() -> Option<Duration> {
    config().request_timeout()
}

pub fn max_concurrency() -> Option<usize> {
    config().max_concurrency
}

pub fn content_modified() -> bool {
    config().content_modified
}

pub fn outbound_timeout() -> Duration {
    config().outbound_timeout()
}

pub fn is_initialized() -> bool {
    CONFIG.get().is_some()
}

pub fn runtime() -> RuntimeConfig {
    config()
}

fn config() -> RuntimeConfig {
    CONFIG.get().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(config.outbound_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_concurrency, None);
        assert!(config.content_modified);
    }

    #[test]
    fn test_zero_timeout_disables() {
        let mut model = EditRpcConfig::default();
        model.server.request_timeout_secs = 0;
        model.server.max_concurrency = Some(8);
        let config = RuntimeConfig::from(&model);
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.max_concurrency, Some(8));
    }
}
