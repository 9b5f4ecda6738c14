//! Server configuration from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use strata_core::{ConfigError, StreamConfig};

/// Default interval between WebSocket pings.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Interval between pings on idle feeds. A failed ping drops the
    /// subscriber.
    pub heartbeat_interval: Duration,
    pub stream: StreamConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            heartbeat_interval: DEFAULT_HEARTBEAT,
            stream: StreamConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create ServerConfig from environment variables.
    ///
    /// Environment variables:
    /// - `STRATA_BIND`: listen host (default: 0.0.0.0)
    /// - `PORT` or `STRATA_PORT`: listen port (default: 8000)
    /// - `STRATA_HEARTBEAT_SECS`: ping interval (default: 30)
    /// - `STRATA_DATA_TTL_SECS`: record retention (default: 3600)
    /// - `STRATA_SEQ_TTL_SECS`: sequence counter retention (default: 2592000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = lookup("STRATA_BIND").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = match lookup("PORT").or_else(|| lookup("STRATA_PORT")) {
            Some(raw) => raw.trim().parse::<u16>().map_err(|e| ConfigError::InvalidValue {
                field: "STRATA_PORT".to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => DEFAULT_PORT,
        };
        let addr = format!("{host}:{port}");
        let bind = addr.parse::<SocketAddr>().map_err(|e| ConfigError::InvalidValue {
            field: "STRATA_BIND".to_string(),
            value: addr.clone(),
            reason: e.to_string(),
        })?;

        let mut stream = StreamConfig::default();
        if let Some(ttl) = lookup_secs(&lookup, "STRATA_DATA_TTL_SECS")? {
            stream.data_ttl = ttl;
        }
        if let Some(ttl) = lookup_secs(&lookup, "STRATA_SEQ_TTL_SECS")? {
            stream.seq_ttl = ttl;
        }

        let config = Self {
            bind,
            heartbeat_interval: lookup_secs(&lookup, "STRATA_HEARTBEAT_SECS")?
                .unwrap_or(DEFAULT_HEARTBEAT),
            stream,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "STRATA_HEARTBEAT_SECS".to_string(),
                value: "0".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        self.stream.validate()
    }
}

fn lookup_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<Duration>, ConfigError> {
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| ConfigError::InvalidValue {
                    field: name.to_string(),
                    value: raw.clone(),
                    reason: e.to_string(),
                })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config.bind.port(), DEFAULT_PORT);
        assert_eq!(config.heartbeat_interval, DEFAULT_HEARTBEAT);
        assert_eq!(config.stream, StreamConfig::default());
    }

    #[test]
    fn test_stream_ttls() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("STRATA_DATA_TTL_SECS", "60"),
            ("STRATA_SEQ_TTL_SECS", "120"),
        ]))
        .expect("config");
        assert_eq!(config.stream.data_ttl, Duration::from_secs(60));
        assert_eq!(config.stream.seq_ttl, Duration::from_secs(120));
    }

    #[test]
    fn test_port_precedence() {
        let config = ServerConfig::from_lookup(lookup(&[("PORT", "9000"), ("STRATA_PORT", "9001")]))
            .expect("config");
        assert_eq!(config.bind.port(), 9000);

        let config =
            ServerConfig::from_lookup(lookup(&[("STRATA_PORT", "9001"), ("STRATA_BIND", "127.0.0.1")]))
                .expect("config");
        assert_eq!(config.bind.to_string(), "127.0.0.1:9001");
    }

    #[test]
    fn test_invalid_values() {
        assert!(ServerConfig::from_lookup(lookup(&[("PORT", "http")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("STRATA_BIND", "not a host")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("STRATA_HEARTBEAT_SECS", "0")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[
            ("STRATA_DATA_TTL_SECS", "600"),
            ("STRATA_SEQ_TTL_SECS", "60"),
        ]))
        .is_err());
    }
}
