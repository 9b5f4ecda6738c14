//! Configuration types

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Space left untouched on the cache volume when no explicit budget is set.
pub const DISK_HEADROOM_BYTES: u64 = 1 << 30;

/// Default cache scoring half-life, in touches.
pub const DEFAULT_HALFLIFE: f64 = 1000.0;

/// Default LMDB map size for the on-disk index (metadata only, not payloads).
pub const DEFAULT_INDEX_MAP_SIZE: usize = 64 * 1024 * 1024;

/// Default retention of record payloads after their write.
pub const DEFAULT_DATA_TTL: Duration = Duration::from_secs(3600);

/// Default retention of a key's sequence counter after its last write.
pub const DEFAULT_SEQ_TTL: Duration = Duration::from_secs(2_592_000);

/// Scored eviction cache configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Byte budget. Required in memory; on disk `None` means
    /// "free space minus [`DISK_HEADROOM_BYTES`]".
    pub available_bytes: Option<u64>,
    /// Reject a `put` that does not fit instead of evicting.
    pub error_if_full: bool,
    /// On disk only: evict pre-existing entries that exceed the budget at
    /// startup instead of refusing to open.
    pub cull_on_startup: bool,
    /// On disk only: cache directory.
    pub path: Option<PathBuf>,
    /// Number of touches after which an old touch counts half as much as a
    /// fresh one.
    pub halflife: f64,
    /// On disk only: LMDB map size for the index.
    pub index_map_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            available_bytes: None,
            error_if_full: false,
            cull_on_startup: false,
            path: None,
            halflife: DEFAULT_HALFLIFE,
            index_map_size: DEFAULT_INDEX_MAP_SIZE,
        }
    }
}

impl CacheConfig {
    pub fn in_memory(available_bytes: u64) -> Self {
        Self {
            available_bytes: Some(available_bytes),
            ..Self::default()
        }
    }

    pub fn on_disk(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    pub fn with_available_bytes(mut self, bytes: u64) -> Self {
        self.available_bytes = Some(bytes);
        self
    }

    pub fn with_error_if_full(mut self, enabled: bool) -> Self {
        self.error_if_full = enabled;
        self
    }

    pub fn with_cull_on_startup(mut self, enabled: bool) -> Self {
        self.cull_on_startup = enabled;
        self
    }

    pub fn with_halflife(mut self, halflife: f64) -> Self {
        self.halflife = halflife;
        self
    }

    pub fn with_index_map_size(mut self, bytes: usize) -> Self {
        self.index_map_size = bytes;
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - halflife is finite and > 0
    /// - index_map_size > 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.halflife.is_finite() || self.halflife <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "halflife".to_string(),
                value: self.halflife.to_string(),
                reason: "must be a positive number".to_string(),
            });
        }
        if self.index_map_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "index_map_size".to_string(),
                value: "0".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Update broker retention configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// How long a record's payload is retained after it was written.
    pub data_ttl: Duration,
    /// How long a key's sequence counter survives without any write.
    pub seq_ttl: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            data_ttl: DEFAULT_DATA_TTL,
            seq_ttl: DEFAULT_SEQ_TTL,
        }
    }
}

impl StreamConfig {
    /// Create StreamConfig from environment variables.
    ///
    /// Environment variables:
    /// - `STRATA_DATA_TTL_SECS`: payload retention (default: 3600)
    /// - `STRATA_SEQ_TTL_SECS`: sequence counter retention (default: 2592000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(secs) = env_secs("STRATA_DATA_TTL_SECS")? {
            config.data_ttl = secs;
        }
        if let Some(secs) = env_secs("STRATA_SEQ_TTL_SECS")? {
            config.seq_ttl = secs;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_data_ttl(mut self, ttl: Duration) -> Self {
        self.data_ttl = ttl;
        self
    }

    pub fn with_seq_ttl(mut self, ttl: Duration) -> Self {
        self.seq_ttl = ttl;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "data_ttl".to_string(),
                value: "0".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        if self.seq_ttl < self.data_ttl {
            return Err(ConfigError::InvalidValue {
                field: "seq_ttl".to_string(),
                value: format!("{}s", self.seq_ttl.as_secs()),
                reason: format!(
                    "must be >= data_ttl ({}s) so counters outlive their records",
                    self.data_ttl.as_secs()
                ),
            });
        }
        Ok(())
    }
}

fn env_secs(name: &str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|e| ConfigError::InvalidValue {
                field: name.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_builder() {
        let config = CacheConfig::on_disk("/tmp/strata")
            .with_available_bytes(1024)
            .with_error_if_full(true)
            .with_cull_on_startup(true)
            .with_halflife(10.0);
        assert_eq!(config.available_bytes, Some(1024));
        assert!(config.error_if_full);
        assert!(config.cull_on_startup);
        assert_eq!(config.path.as_deref(), Some(Path::new("/tmp/strata")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cache_config_rejects_bad_halflife() {
        assert!(CacheConfig::in_memory(10).with_halflife(0.0).validate().is_err());
        assert!(CacheConfig::in_memory(10)
            .with_halflife(f64::NAN)
            .validate()
            .is_err());
    }

    #[test]
    fn test_stream_config_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.data_ttl, Duration::from_secs(3600));
        assert_eq!(config.seq_ttl, Duration::from_secs(2_592_000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stream_config_seq_ttl_must_cover_data_ttl() {
        let config = StreamConfig::default()
            .with_data_ttl(Duration::from_secs(100))
            .with_seq_ttl(Duration::from_secs(10));
        assert!(config.validate().is_err());
        assert!(StreamConfig::default()
            .with_data_ttl(Duration::ZERO)
            .validate()
            .is_err());
    }
}
