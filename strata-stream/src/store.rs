//! Expiring key-value capability the broker is built on.
//!
//! The broker never assumes more than this trait: TTL'd byte values and an
//! atomic counter increment that also refreshes the counter's TTL. Anything
//! offering these (an external key-value server, a shared cache service) can
//! back a broker shared between processes; [`InMemoryKvStore`] backs a
//! single process and the tests.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use strata_core::{StreamError, StreamResult};
use tokio::time::Instant;
use tracing::trace;

/// Key-value store with per-key expiry.
#[async_trait]
pub trait KeyValueWithExpiry: Send + Sync {
    /// Store `value`, replacing any previous value, expiring after `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StreamResult<()>;

    /// Fetch a live value.
    async fn get(&self, key: &str) -> StreamResult<Option<Vec<u8>>>;

    /// Atomically increment the counter at `key` and reset its expiry to
    /// `ttl`. A missing or expired counter starts from zero, so the first
    /// increment returns 1.
    async fn increment(&self, key: &str, ttl: Duration) -> StreamResult<u64>;

    /// Reset the expiry of a live key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> StreamResult<bool>;

    /// Remove `key`. Returns false if it was absent.
    async fn delete(&self, key: &str) -> StreamResult<bool>;
}

/// Decode a counter value written by [`KeyValueWithExpiry::increment`].
pub fn decode_counter(bytes: &[u8]) -> StreamResult<u64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| StreamError::Store {
            reason: format!("counter holds non-numeric value {bytes:?}"),
        })
}

#[derive(Debug, Clone)]
struct Slot {
    value: Vec<u8>,
    expires_at: Instant,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Process-local store on the tokio clock.
///
/// Expired keys are dropped lazily on access, or in bulk by
/// [`purge_expired`](Self::purge_expired). Pausing and advancing the tokio
/// clock in tests expires keys deterministically.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    slots: DashMap<String, Slot>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.is_live(now));
        let purged = before.saturating_sub(self.slots.len());
        if purged > 0 {
            trace!(purged, "Purged expired keys");
        }
        purged
    }

    /// Number of stored keys, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[async_trait]
impl KeyValueWithExpiry for InMemoryKvStore {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StreamResult<()> {
        self.slots.insert(
            key.to_string(),
            Slot {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StreamResult<Option<Vec<u8>>> {
        let now = Instant::now();
        if let Some(slot) = self.slots.get(key) {
            if slot.is_live(now) {
                return Ok(Some(slot.value.clone()));
            }
        }
        self.slots.remove_if(key, |_, slot| !slot.is_live(now));
        Ok(None)
    }

    async fn increment(&self, key: &str, ttl: Duration) -> StreamResult<u64> {
        let now = Instant::now();
        let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: b"0".to_vec(),
            expires_at: now,
        });
        let current = if slot.is_live(now) {
            decode_counter(&slot.value)?
        } else {
            0
        };
        let next = current + 1;
        slot.value = next.to_string().into_bytes();
        slot.expires_at = now + ttl;
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StreamResult<bool> {
        let now = Instant::now();
        match self.slots.get_mut(key) {
            Some(mut slot) if slot.is_live(now) => {
                slot.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> StreamResult<bool> {
        let now = Instant::now();
        Ok(self
            .slots
            .remove(key)
            .is_some_and(|(_, slot)| slot.is_live(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_values_expire() {
        let store = InMemoryKvStore::new();
        store
            .set("a", b"1".to_vec(), Duration::from_secs(10))
            .await
            .expect("set");
        assert_eq!(store.get("a").await.expect("get"), Some(b"1".to_vec()));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("a").await.expect("get"), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_refreshes_ttl() {
        let store = InMemoryKvStore::new();
        let ttl = Duration::from_secs(10);
        assert_eq!(store.increment("n", ttl).await.expect("incr"), 1);
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.increment("n", ttl).await.expect("incr"), 2);
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.increment("n", ttl).await.expect("incr"), 3);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.increment("n", ttl).await.expect("incr"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_and_delete() {
        let store = InMemoryKvStore::new();
        store
            .set("a", b"x".to_vec(), Duration::from_secs(5))
            .await
            .expect("set");
        assert!(store.expire("a", Duration::from_secs(60)).await.expect("expire"));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(store.get("a").await.expect("get").is_some());

        assert!(store.delete("a").await.expect("delete"));
        assert!(!store.delete("a").await.expect("delete"));
        assert!(!store.expire("a", Duration::from_secs(1)).await.expect("expire"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = InMemoryKvStore::new();
        store
            .set("short", vec![], Duration::from_secs(1))
            .await
            .expect("set");
        store
            .set("long", vec![], Duration::from_secs(100))
            .await
            .expect("set");
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_decode_counter_rejects_garbage() {
        assert_eq!(decode_counter(b"42").expect("decode"), 42);
        assert!(decode_counter(b"forty-two").is_err());
    }
}
