//! Freshness contracts for read-through lookups.
//!
//! A caller states how stale a cached representation may be; the result
//! reports where the bytes came from and how old they are.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Staleness tolerance for a read-through lookup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Freshness {
    /// Serve cached bytes confirmed no longer ago than `max_staleness`
    /// without contacting the origin. Older entries are revalidated.
    BestEffort {
        /// Maximum acceptable age of a cached representation.
        max_staleness: Duration,
    },

    /// Always revalidate with the origin, using the cached entity tag so an
    /// unchanged resource costs a round trip but no transfer.
    #[default]
    Consistent,
}

impl Freshness {
    pub fn best_effort(max_staleness: Duration) -> Self {
        Self::BestEffort { max_staleness }
    }

    pub fn consistent() -> Self {
        Self::Consistent
    }

    pub fn is_best_effort(&self) -> bool {
        matches!(self, Self::BestEffort { .. })
    }

    pub fn is_consistent(&self) -> bool {
        matches!(self, Self::Consistent)
    }

    /// Max staleness for BestEffort, zero for Consistent.
    pub fn max_staleness(&self) -> Duration {
        match self {
            Self::BestEffort { max_staleness } => *max_staleness,
            Self::Consistent => Duration::ZERO,
        }
    }

    /// Whether an entry confirmed at `cached_at` may be served as is.
    pub fn accepts(&self, cached_at: DateTime<Utc>) -> bool {
        match self {
            Self::BestEffort { max_staleness } => age(cached_at) <= *max_staleness,
            Self::Consistent => false,
        }
    }
}

/// Where a read-through result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Cached bytes served without contacting the origin.
    Cache,
    /// Cached bytes the origin confirmed unchanged.
    Revalidated,
    /// Bytes transferred from the origin.
    Origin,
}

/// Result of a read-through lookup, carrying its provenance and age.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    /// When the value was last confirmed against the origin.
    cached_at: DateTime<Utc>,
    source: ReadSource,
}

impl<T> CacheRead<T> {
    /// Served from cache, confirmed at `cached_at`.
    pub fn from_cache(value: T, cached_at: DateTime<Utc>) -> Self {
        Self {
            value,
            cached_at,
            source: ReadSource::Cache,
        }
    }

    /// Served from cache after the origin reported it unchanged.
    pub fn revalidated(value: T) -> Self {
        Self {
            value,
            cached_at: Utc::now(),
            source: ReadSource::Revalidated,
        }
    }

    /// Transferred from the origin.
    pub fn from_origin(value: T) -> Self {
        Self {
            value,
            cached_at: Utc::now(),
            source: ReadSource::Origin,
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn source(&self) -> ReadSource {
        self.source
    }

    /// True unless the bytes were transferred from the origin.
    pub fn was_cache_hit(&self) -> bool {
        self.source != ReadSource::Origin
    }

    pub fn was_cache_miss(&self) -> bool {
        !self.was_cache_hit()
    }

    pub fn cached_at(&self) -> DateTime<Utc> {
        self.cached_at
    }

    /// Time since the value was last confirmed against the origin.
    pub fn staleness(&self) -> Duration {
        age(self.cached_at)
    }

    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            cached_at: self.cached_at,
            source: self.source,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}

fn age(since: DateTime<Utc>) -> Duration {
    (Utc::now() - since).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freshness_default_is_consistent() {
        assert!(Freshness::default().is_consistent());
        assert_eq!(Freshness::consistent().max_staleness(), Duration::ZERO);
    }

    #[test]
    fn test_best_effort_accepts_young_entries() {
        let freshness = Freshness::best_effort(Duration::from_secs(60));
        assert!(freshness.is_best_effort());
        assert!(freshness.accepts(Utc::now() - chrono::Duration::seconds(5)));
        assert!(!freshness.accepts(Utc::now() - chrono::Duration::seconds(120)));
    }

    #[test]
    fn test_consistent_never_accepts_without_revalidation() {
        assert!(!Freshness::Consistent.accepts(Utc::now()));
    }

    #[test]
    fn test_cache_read_provenance() {
        let past = Utc::now() - chrono::Duration::seconds(5);
        let read = CacheRead::from_cache("bytes", past);
        assert!(read.was_cache_hit());
        assert_eq!(read.source(), ReadSource::Cache);
        let staleness = read.staleness();
        assert!(staleness >= Duration::from_secs(4));
        assert!(staleness <= Duration::from_secs(10));

        let read = CacheRead::revalidated("bytes");
        assert!(read.was_cache_hit());
        assert!(read.staleness() < Duration::from_secs(1));

        let read = CacheRead::from_origin(42i32);
        assert!(read.was_cache_miss());
        assert_eq!(read.map(|v| v.to_string()).into_value(), "42");
    }

    #[test]
    fn test_future_timestamp_has_zero_staleness() {
        let read = CacheRead::from_cache((), Utc::now() + chrono::Duration::seconds(30));
        assert_eq!(read.staleness(), Duration::ZERO);
    }
}
