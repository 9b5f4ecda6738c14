//! Cache trait and the values it stores.
//!
//! [`InMemoryCache`](crate::InMemoryCache) and [`DiskCache`](crate::DiskCache)
//! both implement [`Cache`]; the backend is chosen at construction time and
//! callers only ever see the trait.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use strata_core::{CacheKey, CacheResult, Timestamp};

/// Revalidation metadata stored next to the cached bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    /// Entity tag returned by the origin, used for conditional requests.
    pub etag: Option<String>,
    pub media_type: Option<String>,
    /// When the bytes were last confirmed against the origin.
    pub cached_at: Timestamp,
}

impl ResourceMetadata {
    pub fn new(etag: Option<String>, media_type: Option<String>) -> Self {
        Self {
            etag,
            media_type,
            cached_at: Utc::now(),
        }
    }

    /// Same validators, confirmed fresh now.
    pub fn refreshed(&self) -> Self {
        Self {
            cached_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// Cached response body plus its revalidation metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResource {
    pub body: Arc<[u8]>,
    pub metadata: ResourceMetadata,
}

impl CachedResource {
    pub fn new(body: impl Into<Arc<[u8]>>, metadata: ResourceMetadata) -> Self {
        Self {
            body: body.into(),
            metadata,
        }
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// Result of a [`Cache::put`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// Stored; lists the entries evicted to make room, lowest score first.
    Stored { evicted: Vec<CacheKey> },
    /// The entry's cost exceeds the whole budget; nothing was evicted.
    TooLarge,
    /// A local I/O failure prevented caching. Equivalent to a miss later.
    NotCached,
}

impl PutOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored { .. })
    }

    pub fn evicted(&self) -> &[CacheKey] {
        match self {
            Self::Stored { evicted } => evicted,
            _ => &[],
        }
    }
}

/// Scored eviction cache.
///
/// Implementations must be safe to share between threads. `clear` is atomic
/// with respect to concurrent `get`/`put`: no reader observes a partially
/// cleared cache.
pub trait Cache: Send + Sync {
    /// Look up `key`. A miss has no side effects; a hit updates the entry's
    /// recency/frequency score.
    fn get(&self, key: &CacheKey) -> CacheResult<Option<CachedResource>>;

    /// Store `resource` with the given byte `cost`.
    ///
    /// When the budget would be exceeded, either evicts lowest-scoring
    /// entries (oldest first on ties) or, with `error_if_full`, fails with
    /// [`CacheError::Full`](strata_core::CacheError::Full) and leaves every
    /// existing entry untouched.
    fn put(&self, key: &CacheKey, resource: CachedResource, cost: u64) -> CacheResult<PutOutcome>;

    /// Remove `key` if present. Never an error when absent.
    fn discard(&self, key: &CacheKey) -> CacheResult<()>;

    /// Remove every entry.
    fn clear(&self) -> CacheResult<()>;

    fn stats(&self) -> CacheStats;

    /// Byte budget.
    fn capacity(&self) -> u64;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Sum of the live entries' costs.
    pub bytes_used: u64,
    /// Number of evictions due to capacity.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_put_outcome_evicted() {
        let key = CacheKey::new("a", "m");
        let outcome = PutOutcome::Stored {
            evicted: vec![key.clone()],
        };
        assert!(outcome.is_stored());
        assert_eq!(outcome.evicted(), &[key]);
        assert!(PutOutcome::TooLarge.evicted().is_empty());
        assert!(!PutOutcome::NotCached.is_stored());
    }

    #[test]
    fn test_refreshed_keeps_validators() {
        let meta = ResourceMetadata {
            etag: Some("\"v1\"".to_string()),
            media_type: Some("application/json".to_string()),
            cached_at: Utc::now() - chrono::Duration::seconds(30),
        };
        let fresh = meta.refreshed();
        assert_eq!(fresh.etag, meta.etag);
        assert!(fresh.cached_at > meta.cached_at);
    }
}
