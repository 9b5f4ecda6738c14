//! Client configuration loaded from TOML.
//!
//! All fields are required unless explicitly marked optional.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use strata_core::{CacheConfig, ConfigError};

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV: &str = "STRATA_CLIENT_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Base WebSocket URL of the feed server, e.g. `ws://localhost:8000`.
    pub ws_endpoint: String,
    pub reconnect: ReconnectConfig,
    /// Local cache for fetched resources. No cache when absent.
    pub cache: Option<ClientCacheConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
    /// Consecutive failed connection attempts before the session gives up.
    /// Retries forever when absent.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: 250,
            max_ms: 10_000,
            multiplier: 2.0,
            jitter_ms: 100,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientCacheConfig {
    pub path: PathBuf,
    /// Byte budget; free space minus headroom when absent.
    pub available_bytes: Option<u64>,
    #[serde(default)]
    pub error_if_full: bool,
    #[serde(default)]
    pub cull_on_startup: bool,
}

impl ClientCacheConfig {
    pub fn to_cache_config(&self) -> CacheConfig {
        let mut config = CacheConfig::on_disk(&self.path)
            .with_error_if_full(self.error_if_full)
            .with_cull_on_startup(self.cull_on_startup);
        if let Some(bytes) = self.available_bytes {
            config = config.with_available_bytes(bytes);
        }
        config
    }
}

impl ClientConfig {
    /// Load from the file named by `--config` or `STRATA_CLIENT_CONFIG`.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args()
            .or_else(config_path_from_env)
            .ok_or_else(|| ConfigError::MissingRequired {
                field: format!("config path (use --config or {CONFIG_ENV})"),
            })?;
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&contents, &path.display().to_string())
    }

    /// Parse and validate TOML. `origin` names the source in errors.
    pub fn parse(contents: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = self.ws_endpoint.trim();
        if endpoint.is_empty() {
            return Err(invalid("ws_endpoint", endpoint, "must not be empty"));
        }
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(invalid("ws_endpoint", endpoint, "must be a ws:// or wss:// URL"));
        }
        self.reconnect.validate()?;
        if let Some(cache) = &self.cache {
            if cache.path.as_os_str().is_empty() {
                return Err(invalid("cache.path", "", "must not be empty"));
            }
            cache.to_cache_config().validate()?;
        }
        Ok(())
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_ms == 0 {
            return Err(invalid("reconnect.initial_ms", "0", "must be > 0"));
        }
        if self.max_ms < self.initial_ms {
            return Err(invalid(
                "reconnect.max_ms",
                &self.max_ms.to_string(),
                "must be >= initial_ms",
            ));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(invalid(
                "reconnect.multiplier",
                &self.multiplier.to_string(),
                "must be >= 1.0",
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(invalid("reconnect.max_attempts", "0", "must be > 0 when set"));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
ws_endpoint = "ws://localhost:8000"

[reconnect]
initial_ms = 250
max_ms = 5000
multiplier = 1.5
jitter_ms = 100
max_attempts = 10

[cache]
path = "/var/cache/strata"
available_bytes = 1048576
error_if_full = true
"#;

    #[test]
    fn test_parse_full_config() {
        let config = ClientConfig::parse(FULL, "inline").expect("valid config");
        assert_eq!(config.reconnect.max_attempts, Some(10));
        let cache = config.cache.expect("cache section").to_cache_config();
        assert_eq!(cache.available_bytes, Some(1_048_576));
        assert!(cache.error_if_full);
        assert!(!cache.cull_on_startup);
        assert_eq!(cache.path, Some(PathBuf::from("/var/cache/strata")));
    }

    #[test]
    fn test_cache_and_max_attempts_are_optional() {
        let text = r#"
ws_endpoint = "wss://feeds.example.org"
[reconnect]
initial_ms = 100
max_ms = 100
multiplier = 1.0
jitter_ms = 0
"#;
        let config = ClientConfig::parse(text, "inline").expect("valid config");
        assert!(config.cache.is_none());
        assert_eq!(config.reconnect.max_attempts, None);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let text = FULL.replace("jitter_ms = 100", "jitter_ms = 100\nretries = 3");
        assert!(matches!(
            ClientConfig::parse(&text, "inline"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_reconnect_validation() {
        let mut reconnect = ReconnectConfig::default();
        assert!(reconnect.validate().is_ok());

        reconnect.max_ms = reconnect.initial_ms - 1;
        assert!(reconnect.validate().is_err());

        let mut reconnect = ReconnectConfig::default();
        reconnect.multiplier = 0.5;
        assert!(reconnect.validate().is_err());

        let mut reconnect = ReconnectConfig::default();
        reconnect.max_attempts = Some(0);
        assert!(reconnect.validate().is_err());
    }

    #[test]
    fn test_endpoint_must_be_websocket() {
        let text = FULL.replace("ws://localhost:8000", "http://localhost:8000");
        assert!(matches!(
            ClientConfig::parse(&text, "inline"),
            Err(ConfigError::InvalidValue { field, .. }) if field == "ws_endpoint"
        ));
    }

    #[test]
    fn test_from_path_reports_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("client.toml");
        assert!(matches!(
            ClientConfig::from_path(&missing),
            Err(ConfigError::Io { .. })
        ));

        std::fs::write(&missing, FULL).expect("write config");
        assert!(ClientConfig::from_path(&missing).is_ok());
    }
}
