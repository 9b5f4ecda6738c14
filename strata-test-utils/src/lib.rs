//! STRATA Test Utilities
//!
//! Shared test infrastructure for the STRATA workspace:
//! - A scriptable fake origin implementing the cache [`Transport`]
//! - A key-value store whose operations can be made to fail
//! - Proptest generators for keys, updates and cache workloads
//! - Fixtures for common records and resources
//! - Assertions over feed events

pub use strata_cache::{CachedResource, Fetched, ResourceMetadata, Revalidation, Transport, TransportError};
pub use strata_core::{
    ArrayPatch, CacheError, CacheKey, EventCategory, FeedEvent, Payload, Sequence, StreamError,
    StreamKey, StreamResult, Update, UpdateKind, UpdateRecord,
};
pub use strata_stream::{InMemoryKvStore, KeyValueWithExpiry};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

// ============================================================================
// FAKE ORIGIN
// ============================================================================

#[derive(Debug, Clone)]
struct Representation {
    body: Vec<u8>,
    etag: Option<String>,
}

/// In-memory origin with request counters.
///
/// Entity tags are compared verbatim: a revalidation with the current tag
/// answers `Unchanged`, anything else gets the full representation.
#[derive(Debug, Default)]
pub struct FakeTransport {
    resources: Mutex<HashMap<CacheKey, Representation>>,
    failure: Mutex<Option<String>>,
    fetches: AtomicU64,
    revalidations: AtomicU64,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish (or replace) a representation.
    pub fn set(&self, key: &CacheKey, body: impl Into<Vec<u8>>, etag: Option<&str>) {
        let mut resources = self.resources.lock().unwrap_or_else(|p| p.into_inner());
        resources.insert(
            key.clone(),
            Representation {
                body: body.into(),
                etag: etag.map(str::to_string),
            },
        );
    }

    pub fn remove(&self, key: &CacheKey) {
        let mut resources = self.resources.lock().unwrap_or_else(|p| p.into_inner());
        resources.remove(key);
    }

    /// Make every subsequent request fail with `reason`; `None` heals.
    pub fn fail_with(&self, reason: Option<&str>) {
        let mut failure = self.failure.lock().unwrap_or_else(|p| p.into_inner());
        *failure = reason.map(str::to_string);
    }

    /// Number of unconditional fetches served.
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of conditional requests served.
    pub fn revalidations(&self) -> u64 {
        self.revalidations.load(Ordering::SeqCst)
    }

    fn lookup(&self, key: &CacheKey) -> Result<Representation, TransportError> {
        if let Some(reason) = self.failure.lock().unwrap_or_else(|p| p.into_inner()).clone() {
            return Err(TransportError::Failed {
                path: key.path().to_string(),
                reason,
            });
        }
        let resources = self.resources.lock().unwrap_or_else(|p| p.into_inner());
        resources
            .get(key)
            .cloned()
            .ok_or_else(|| TransportError::NotFound {
                path: key.path().to_string(),
            })
    }
}

fn to_fetched(key: &CacheKey, repr: Representation) -> Fetched {
    let fetched = Fetched::new(repr.body).with_media_type(key.mode());
    match repr.etag {
        Some(etag) => fetched.with_etag(etag),
        None => fetched,
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn fetch(&self, key: &CacheKey) -> Result<Fetched, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let repr = self.lookup(key)?;
        Ok(to_fetched(key, repr))
    }

    async fn revalidate(&self, key: &CacheKey, etag: &str) -> Result<Revalidation, TransportError> {
        self.revalidations.fetch_add(1, Ordering::SeqCst);
        let repr = self.lookup(key)?;
        if repr.etag.as_deref() == Some(etag) {
            Ok(Revalidation::Unchanged)
        } else {
            Ok(Revalidation::Modified(to_fetched(key, repr)))
        }
    }
}

// ============================================================================
// FAULTY STORE
// ============================================================================

/// Operations of [`KeyValueWithExpiry`] that [`FaultyKvStore`] can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Set,
    Get,
    Increment,
    Expire,
    Delete,
}

/// [`InMemoryKvStore`] wrapper that fails chosen operations with
/// [`StreamError::Store`], as an unreachable backing store would.
#[derive(Debug, Default)]
pub struct FaultyKvStore {
    inner: InMemoryKvStore,
    failing: Mutex<HashSet<StoreOp>>,
    failures: AtomicU64,
}

impl FaultyKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that fails every operation from the start.
    pub fn unavailable() -> Self {
        let store = Self::new();
        for op in [
            StoreOp::Set,
            StoreOp::Get,
            StoreOp::Increment,
            StoreOp::Expire,
            StoreOp::Delete,
        ] {
            store.fail(op);
        }
        store
    }

    pub fn fail(&self, op: StoreOp) {
        self.failing.lock().unwrap_or_else(|p| p.into_inner()).insert(op);
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    /// Number of operations failed so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    fn check(&self, op: StoreOp, key: &str) -> StreamResult<()> {
        if self.failing.lock().unwrap_or_else(|p| p.into_inner()).contains(&op) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(StreamError::Store {
                reason: format!("{op:?} {key}: connection refused"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueWithExpiry for FaultyKvStore {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StreamResult<()> {
        self.check(StoreOp::Set, key)?;
        self.inner.set(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> StreamResult<Option<Vec<u8>>> {
        self.check(StoreOp::Get, key)?;
        self.inner.get(key).await
    }

    async fn increment(&self, key: &str, ttl: Duration) -> StreamResult<u64> {
        self.check(StoreOp::Increment, key)?;
        self.inner.increment(key, ttl).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StreamResult<bool> {
        self.check(StoreOp::Expire, key)?;
        self.inner.expire(key, ttl).await
    }

    async fn delete(&self, key: &str) -> StreamResult<bool> {
        self.check(StoreOp::Delete, key)?;
        self.inner.delete(key).await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for STRATA types.

    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    /// A valid stream key of one to three segments.
    pub fn arb_stream_key() -> impl Strategy<Value = StreamKey> {
        prop::collection::vec("[a-z][a-z0-9_]{0,7}", 1..=3).prop_filter_map(
            "valid stream key",
            |segments| StreamKey::new(segments.join("/")).ok(),
        )
    }

    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        (
            "[a-z]{1,6}(/[a-z0-9]{1,6}){0,2}",
            prop_oneof![
                Just("application/json"),
                Just("application/octet-stream"),
                Just("text/csv"),
            ],
            prop::collection::btree_map("[a-z]{1,4}", "[a-z0-9:]{0,6}", 0..3),
        )
            .prop_map(|(path, mode, params)| {
                params
                    .into_iter()
                    .fold(CacheKey::new(path, mode), |key, (name, value)| {
                        key.with_param(name, value)
                    })
            })
    }

    pub fn arb_update_kind() -> impl Strategy<Value = UpdateKind> {
        prop_oneof![
            Just(UpdateKind::ArrayData),
            Just(UpdateKind::ArrayRef),
            Just(UpdateKind::TableData),
            Just(UpdateKind::ChildCreated),
            Just(UpdateKind::ChildMetadataUpdated),
        ]
    }

    pub fn arb_update() -> impl Strategy<Value = Update> {
        (arb_update_kind(), prop::collection::vec(any::<i32>(), 0..8)).prop_map(|(kind, values)| {
            match kind {
                UpdateKind::ArrayRef => Update::array_ref(format!("file:///data/{}.bin", values.len())),
                UpdateKind::ChildCreated => Update::child_created(format!("child_{}", values.len())),
                other => Update::new(other, Payload::Inline(json!(values))),
            }
        })
    }

    /// One step of a cache workload: `(key id, cost, read instead of put)`.
    pub fn arb_cache_op(keys: u8, max_cost: u64) -> impl Strategy<Value = (u8, u64, bool)> {
        (0..keys, 0..=max_cost, any::<bool>())
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built values for common test scenarios.

    use super::*;
    use serde_json::json;

    /// Parse a stream key that is known to be valid.
    pub fn stream_key(path: &str) -> StreamKey {
        StreamKey::new(path).unwrap_or_else(|e| panic!("invalid fixture key {path:?}: {e}"))
    }

    pub fn cache_key(path: &str) -> CacheKey {
        CacheKey::new(path, "application/octet-stream")
    }

    /// Inline values written at the start of an array.
    pub fn array_update(values: &[i64]) -> Update {
        Update::array(json!(values)).with_patch(ArrayPatch::at(vec![0]))
    }

    /// Inline values appended at `offset`, growing the array.
    pub fn extend_update(offset: u64, values: &[i64]) -> Update {
        Update::array(json!(values))
            .with_patch(ArrayPatch::extending(vec![offset]).with_shape(vec![values.len() as u64]))
    }

    pub fn record(key: &str, sequence: Sequence, values: &[i64]) -> UpdateRecord {
        array_update(values).into_record(stream_key(key), sequence, chrono::Utc::now())
    }

    /// `len` bytes of `fill` with fresh metadata.
    pub fn resource(fill: u8, len: usize) -> CachedResource {
        CachedResource::new(vec![fill; len], ResourceMetadata::new(None, None))
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over feed events and cache errors.

    use super::*;

    /// Sequences of the `Record` events, in delivery order.
    pub fn record_sequences(events: &[FeedEvent]) -> Vec<Sequence> {
        events
            .iter()
            .filter_map(|event| match event {
                FeedEvent::Record(record) => Some(record.sequence),
                _ => None,
            })
            .collect()
    }

    /// Assert the delivered records carry exactly `expected`, in order.
    #[track_caller]
    pub fn assert_record_sequences(events: &[FeedEvent], expected: &[Sequence]) {
        assert_eq!(
            record_sequences(events),
            expected,
            "unexpected record sequences in {events:?}"
        );
    }

    /// Assert sequences strictly increase between resets.
    #[track_caller]
    pub fn assert_monotonic(events: &[FeedEvent]) {
        let mut last = 0;
        for event in events {
            match event {
                FeedEvent::Record(record) => {
                    assert!(
                        record.sequence > last,
                        "sequence {} delivered after {last}",
                        record.sequence
                    );
                    last = record.sequence;
                }
                FeedEvent::Reset { .. } => last = 0,
                FeedEvent::Completed { .. } => {}
            }
        }
    }

    /// Assert a cache result is the strict-mode full error.
    #[track_caller]
    pub fn assert_cache_full<T: std::fmt::Debug>(result: &Result<T, CacheError>) {
        match result {
            Err(CacheError::Full { .. }) => {}
            other => panic!("Expected CacheError::Full, got: {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[tokio::test]
    async fn test_fake_transport_revalidation() {
        let transport = FakeTransport::new();
        let key = cache_key("x");
        transport.set(&key, b"v1".to_vec(), Some("\"1\""));

        let answer = transport.revalidate(&key, "\"1\"").await;
        assert_eq!(answer, Ok(Revalidation::Unchanged));

        transport.set(&key, b"v2".to_vec(), Some("\"2\""));
        let answer = transport.revalidate(&key, "\"1\"").await;
        assert!(matches!(answer, Ok(Revalidation::Modified(f)) if f.body == b"v2"));
        assert_eq!(transport.revalidations(), 2);
    }

    #[tokio::test]
    async fn test_fake_transport_failures() {
        let transport = FakeTransport::new();
        let key = cache_key("x");
        assert!(matches!(
            transport.fetch(&key).await,
            Err(TransportError::NotFound { .. })
        ));

        transport.set(&key, b"v1".to_vec(), None);
        transport.fail_with(Some("connection refused"));
        assert!(matches!(
            transport.fetch(&key).await,
            Err(TransportError::Failed { .. })
        ));
        transport.fail_with(None);
        assert!(transport.fetch(&key).await.is_ok());
        assert_eq!(transport.fetches(), 3);
    }

    #[tokio::test]
    async fn test_faulty_store_fails_selected_ops() {
        let store = FaultyKvStore::new();
        let ttl = Duration::from_secs(60);
        store.set("a", b"1".to_vec(), ttl).await.expect("set");

        store.fail(StoreOp::Get);
        assert!(matches!(store.get("a").await, Err(StreamError::Store { .. })));
        assert_eq!(store.increment("n", ttl).await.expect("incr"), 1);

        store.heal();
        assert_eq!(store.get("a").await.expect("get"), Some(b"1".to_vec()));
        assert_eq!(store.failures(), 1);
    }

    #[test]
    fn test_fixtures() {
        let update = extend_update(3, &[4, 5, 6]);
        let patch = update.patch.expect("patch");
        assert!(patch.extend);
        assert_eq!(patch.offset, vec![3]);
        assert_eq!(record("x", 7, &[1]).sequence, 7);
    }
}
