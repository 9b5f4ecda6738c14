//! Error types for STRATA operations

use thiserror::Error;

/// Scored eviction cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error(
        "Cache full: storing {key} needs {required} bytes but only {free} of {capacity} are free \
         (raise `available_bytes`, clear entries, or disable `error_if_full`)"
    )]
    Full {
        key: String,
        required: u64,
        free: u64,
        capacity: u64,
    },

    #[error("Cache I/O error on {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Cache index error: {reason}")]
    Index { reason: String },

    #[error("Cache serialization error: {reason}")]
    Serialization { reason: String },

    #[error(
        "Cache directory holds {used} bytes, over its budget of {capacity} bytes \
         (enable `cull_on_startup` or raise `available_bytes`)"
    )]
    OverBudget { used: u64, capacity: u64 },

    #[error("Cache configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl CacheError {
    pub fn io(path: impl std::fmt::Display, err: std::io::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            reason: err.to_string(),
        }
    }

    /// Returns true for local disk failures, which callers degrade to a miss.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Index { .. })
    }
}

/// Sequenced update broker errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("Publish to {key} failed, retry later: {reason}")]
    PublishFailed { key: String, reason: String },

    #[error("Backing store error: {reason}")]
    Store { reason: String },

    #[error("Record serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Broker is no longer running")]
    BrokerGone,
}

impl StreamError {
    /// Whether the writer may retry the same publish.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PublishFailed { .. } | Self::Store { .. })
    }
}

/// Client-side subscription session errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Transport-level disconnect, distinct from normal stream completion.
    #[error("Subscription disconnected: {reason}")]
    Disconnected { reason: String },

    #[error("Failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("Failed to decode feed message: {reason}")]
    Decode { reason: String },

    #[error("Session already started")]
    AlreadyStarted,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config {path}: {reason}")]
    Parse { path: String, reason: String },
}

/// Validation errors for keys and records.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },
}

/// Master error type for all STRATA errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StrataError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Result type alias for STRATA operations.
pub type StrataResult<T> = Result<T, StrataError>;

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Result type alias for broker operations.
pub type StreamResult<T> = Result<T, StreamError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_full_names_the_knobs() {
        let err = CacheError::Full {
            key: "array/x".to_string(),
            required: 4096,
            free: 100,
            capacity: 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("available_bytes"));
        assert!(msg.contains("error_if_full"));
        assert!(msg.contains("4096"));
    }

    #[test]
    fn test_over_budget_mentions_cull_on_startup() {
        let err = CacheError::OverBudget {
            used: 10,
            capacity: 5,
        };
        assert!(err.to_string().contains("cull_on_startup"));
    }

    #[test]
    fn test_cache_io_classification() {
        let io = CacheError::io("/tmp/x", std::io::Error::other("disk gone"));
        assert!(io.is_io());
        assert!(io.to_string().contains("disk gone"));

        let full = CacheError::Full {
            key: "k".to_string(),
            required: 1,
            free: 0,
            capacity: 0,
        };
        assert!(!full.is_io());
    }

    #[test]
    fn test_publish_failure_is_retryable() {
        let err = StreamError::PublishFailed {
            key: "x".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(err.is_retryable());
        assert!(!StreamError::Serialization {
            reason: "bad".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_disconnect_display() {
        let err = SessionError::Disconnected {
            reason: "reset by peer".to_string(),
        };
        assert!(err.to_string().contains("reset by peer"));
    }

    #[test]
    fn test_master_error_from_conversions() {
        let err: StrataError = ConfigError::MissingRequired {
            field: "path".to_string(),
        }
        .into();
        assert!(matches!(err, StrataError::Config(_)));

        let err: StrataError = StreamError::BrokerGone.into();
        assert!(err.to_string().contains("Stream error"));
    }
}
