//! Read-through lookups against a fake origin.

use std::sync::Arc;
use std::time::Duration;

use std::sync::atomic::{AtomicU64, Ordering};

use strata_cache::{
    Cache, CacheStats, CachedResource, Freshness, InMemoryCache, PutOutcome, ReadSource,
    ReadThroughCache, TransportError,
};
use strata_core::{CacheConfig, CacheError, CacheKey, CacheResult};
use strata_test_utils::fixtures::cache_key;
use strata_test_utils::FakeTransport;

fn reader(budget: u64) -> (ReadThroughCache<FakeTransport>, Arc<FakeTransport>, Arc<InMemoryCache>) {
    let transport = Arc::new(FakeTransport::new());
    let cache = Arc::new(InMemoryCache::with_capacity(budget));
    let reader = ReadThroughCache::new(cache.clone(), transport.clone());
    (reader, transport, cache)
}

#[tokio::test]
async fn test_miss_fetches_and_caches() {
    let (reader, transport, cache) = reader(1024);
    let key = cache_key("raw/x");
    transport.set(&key, b"payload".to_vec(), Some("\"1\""));

    let read = reader.get(&key, Freshness::Consistent).await.expect("read");
    assert_eq!(read.source(), ReadSource::Origin);
    assert_eq!(&*read.value().body, b"payload");
    assert_eq!(read.value().metadata.etag.as_deref(), Some("\"1\""));
    assert!(cache.contains(&key));
    assert_eq!(transport.fetches(), 1);
}

#[tokio::test]
async fn test_best_effort_serves_without_origin() {
    let (reader, transport, _cache) = reader(1024);
    let key = cache_key("raw/x");
    transport.set(&key, b"payload".to_vec(), Some("\"1\""));
    reader.get(&key, Freshness::Consistent).await.expect("warm");

    transport.fail_with(Some("origin down"));
    let read = reader
        .get(&key, Freshness::best_effort(Duration::from_secs(60)))
        .await
        .expect("served from cache");
    assert_eq!(read.source(), ReadSource::Cache);
    assert_eq!(transport.revalidations(), 0);
}

#[tokio::test]
async fn test_consistent_revalidates_with_etag() {
    let (reader, transport, _cache) = reader(1024);
    let key = cache_key("raw/x");
    transport.set(&key, b"v1".to_vec(), Some("\"1\""));
    reader.get(&key, Freshness::Consistent).await.expect("warm");

    let read = reader.get(&key, Freshness::Consistent).await.expect("read");
    assert_eq!(read.source(), ReadSource::Revalidated);
    assert_eq!(transport.fetches(), 1);
    assert_eq!(transport.revalidations(), 1);

    transport.set(&key, b"v2".to_vec(), Some("\"2\""));
    let read = reader.get(&key, Freshness::Consistent).await.expect("read");
    assert_eq!(read.source(), ReadSource::Origin);
    assert_eq!(&*read.value().body, b"v2");

    let read = reader
        .get(&key, Freshness::best_effort(Duration::from_secs(60)))
        .await
        .expect("read");
    assert_eq!(&*read.value().body, b"v2");
}

#[tokio::test]
async fn test_untagged_entries_are_refetched() {
    let (reader, transport, _cache) = reader(1024);
    let key = cache_key("raw/x");
    transport.set(&key, b"v1".to_vec(), None);
    reader.get(&key, Freshness::Consistent).await.expect("warm");
    reader.get(&key, Freshness::Consistent).await.expect("read");
    assert_eq!(transport.fetches(), 2);
    assert_eq!(transport.revalidations(), 0);
}

#[tokio::test]
async fn test_not_found_drops_cached_entry() {
    let (reader, transport, cache) = reader(1024);
    let key = cache_key("raw/x");
    transport.set(&key, b"v1".to_vec(), Some("\"1\""));
    reader.get(&key, Freshness::Consistent).await.expect("warm");

    transport.remove(&key);
    let err = reader.get(&key, Freshness::Consistent).await.unwrap_err();
    assert!(matches!(err, TransportError::NotFound { .. }));
    assert!(!cache.contains(&key));
}

#[tokio::test]
async fn test_modes_are_cached_separately() {
    let (reader, transport, cache) = reader(1024);
    let json = CacheKey::new("raw/x", "application/json");
    let csv = CacheKey::new("raw/x", "text/csv");
    transport.set(&json, b"[1]".to_vec(), Some("\"j\""));
    transport.set(&csv, b"1\n".to_vec(), Some("\"c\""));

    reader.get(&json, Freshness::Consistent).await.expect("json");
    reader.get(&csv, Freshness::Consistent).await.expect("csv");
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.stats().bytes_used, 5);
}

#[tokio::test]
async fn test_uncached_reader_always_fetches() {
    let transport = Arc::new(FakeTransport::new());
    let reader = ReadThroughCache::uncached(transport.clone());
    let key = cache_key("raw/x");
    transport.set(&key, b"v1".to_vec(), Some("\"1\""));
    for _ in 0..3 {
        let read = reader
            .get(&key, Freshness::best_effort(Duration::from_secs(60)))
            .await
            .expect("read");
        assert!(read.was_cache_miss());
    }
    assert_eq!(transport.fetches(), 3);
    assert!(reader.cache().is_none());
}

/// Cache whose every operation fails like an unreadable disk.
#[derive(Default)]
struct BrokenCache {
    calls: AtomicU64,
}

impl BrokenCache {
    fn fail<T>(&self) -> CacheResult<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::Io {
            path: "/cache/index".to_string(),
            reason: "input/output error".to_string(),
        })
    }
}

impl Cache for BrokenCache {
    fn get(&self, _key: &CacheKey) -> CacheResult<Option<CachedResource>> {
        self.fail()
    }

    fn put(&self, _key: &CacheKey, _resource: CachedResource, _cost: u64) -> CacheResult<PutOutcome> {
        self.fail()
    }

    fn discard(&self, _key: &CacheKey) -> CacheResult<()> {
        self.fail()
    }

    fn clear(&self) -> CacheResult<()> {
        self.fail()
    }

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }

    fn capacity(&self) -> u64 {
        1024
    }
}

#[tokio::test]
async fn test_failing_cache_degrades_to_origin() {
    let transport = Arc::new(FakeTransport::new());
    let cache = Arc::new(BrokenCache::default());
    let reader = ReadThroughCache::new(cache.clone(), transport.clone());
    let key = cache_key("raw/x");
    transport.set(&key, b"payload".to_vec(), Some("\"1\""));

    for freshness in [Freshness::Consistent, Freshness::best_effort(Duration::from_secs(60))] {
        let read = reader.get(&key, freshness).await.expect("origin read");
        assert_eq!(read.source(), ReadSource::Origin);
        assert_eq!(&*read.value().body, b"payload");
    }
    assert_eq!(transport.fetches(), 2);
    assert!(cache.calls.load(Ordering::SeqCst) >= 4);
}

#[tokio::test]
async fn test_rejected_update_is_not_served_stale() {
    let transport = Arc::new(FakeTransport::new());
    let config = CacheConfig::default()
        .with_available_bytes(20)
        .with_error_if_full(true);
    let cache = Arc::new(InMemoryCache::new(&config).expect("cache"));
    let reader = ReadThroughCache::new(cache.clone(), transport.clone());

    let filler = cache_key("raw/filler");
    transport.set(&filler, vec![0u8; 10], Some("\"f\""));
    reader.get(&filler, Freshness::Consistent).await.expect("filler");

    let key = cache_key("raw/x");
    transport.set(&key, b"v1".to_vec(), Some("\"1\""));
    reader.get(&key, Freshness::Consistent).await.expect("warm");

    // Too big to fit next to the filler in strict mode.
    transport.set(&key, vec![2u8; 15], Some("\"2\""));
    let read = reader.get(&key, Freshness::Consistent).await.expect("read");
    assert_eq!(read.value().body.len(), 15);
    assert!(!cache.contains(&key));

    let read = reader
        .get(&key, Freshness::best_effort(Duration::from_secs(60)))
        .await
        .expect("read");
    assert_eq!(read.source(), ReadSource::Origin);
    assert_eq!(read.value().body.len(), 15);
    assert!(cache.contains(&filler));
}
