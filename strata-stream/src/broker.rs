//! Sequenced update broker.
//!
//! Every published update is assigned the next per-key sequence number by
//! an atomic increment in the backing store, then written to the store
//! under that number with the data TTL. Subscribers replay what the store
//! still retains and then follow live notifications.
//!
//! # Store layout
//!
//! | Key | Value | TTL |
//! |-----|-------|-----|
//! | `seq_num:{key}` | last assigned sequence (decimal) | `seq_ttl`, refreshed on every publish |
//! | `data:{key}:{seq}` | JSON [`UpdateRecord`] | `data_ttl` |
//! | `closed:{key}` | last sequence at close (decimal) | `seq_ttl` |
//!
//! # Ordering
//!
//! Publishes to one key are serialised by a per-key lock held across the
//! increment, the record write and the notification, so subscribers are
//! notified in sequence order and only after the record is readable.
//! Registration of a new subscriber takes the same lock, which makes its
//! snapshot of the current sequence consistent with the notifications it
//! will receive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use strata_core::{
    Sequence, StreamConfig, StreamError, StreamKey, StreamResult, Update, UpdateRecord,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::store::{decode_counter, KeyValueWithExpiry};
use crate::subscription::{Registration, Subscription};

pub(crate) fn seq_key(key: &StreamKey) -> String {
    format!("seq_num:{key}")
}

pub(crate) fn data_key(key: &StreamKey, sequence: Sequence) -> String {
    format!("data:{key}:{sequence}")
}

pub(crate) fn closed_key(key: &StreamKey) -> String {
    format!("closed:{key}")
}

/// Wake-up sent to subscribers of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Notice {
    Published(Sequence),
    Closed { last_sequence: Sequence },
}

/// Per-key coordination state. Exists only while someone uses the key.
#[derive(Debug, Default)]
pub(crate) struct StreamChannel {
    publish_lock: tokio::sync::Mutex<()>,
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<Notice>>>,
}

impl StreamChannel {
    fn register(&self, id: u64, sender: mpsc::UnboundedSender<Notice>) {
        self.lock_subscribers().insert(id, sender);
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.lock_subscribers().remove(&id);
    }

    fn notify(&self, notice: Notice) {
        // Senders whose receiver is gone are pruned on the way.
        self.lock_subscribers()
            .retain(|_, sender| sender.send(notice).is_ok());
    }

    fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    fn lock_subscribers(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<Notice>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct BrokerInner {
    store: Arc<dyn KeyValueWithExpiry>,
    config: StreamConfig,
    channels: DashMap<StreamKey, Arc<StreamChannel>>,
    next_subscriber: AtomicU64,
}

/// Handle to a broker. Clones share the same state.
#[derive(Clone)]
pub struct UpdateBroker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for UpdateBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateBroker")
            .field("config", &self.inner.config)
            .field("channels", &self.inner.channels.len())
            .finish()
    }
}

impl UpdateBroker {
    pub fn new(store: Arc<dyn KeyValueWithExpiry>, config: StreamConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                store,
                config,
                channels: DashMap::new(),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    /// Append `update` to the stream at `key` and notify live subscribers.
    ///
    /// Returns the sequence assigned to the record. A store failure is
    /// reported as a retryable [`StreamError::PublishFailed`]; if it happens
    /// after the sequence was assigned, that sequence is left as a gap
    /// subscribers skip over.
    pub async fn publish(&self, key: &StreamKey, update: Update) -> StreamResult<Sequence> {
        let channel = self.channel(key);
        let result = self.publish_locked(&channel, key, update).await;
        drop(channel);
        self.release(key, 0);
        result
    }

    async fn publish_locked(
        &self,
        channel: &StreamChannel,
        key: &StreamKey,
        update: Update,
    ) -> StreamResult<Sequence> {
        let _guard = channel.publish_lock.lock().await;
        let store = &self.inner.store;
        let config = &self.inner.config;
        let publish_failed = |e: StreamError| StreamError::PublishFailed {
            key: key.to_string(),
            reason: e.to_string(),
        };

        let sequence = store
            .increment(&seq_key(key), config.seq_ttl)
            .await
            .map_err(publish_failed)?;

        let record = update.into_record(key.clone(), sequence, Utc::now());
        let bytes = serde_json::to_vec(&record).map_err(|e| StreamError::Serialization {
            reason: e.to_string(),
        })?;
        store
            .set(&data_key(key, sequence), bytes, config.data_ttl)
            .await
            .map_err(publish_failed)?;

        // Publishing reopens a closed stream.
        if let Err(e) = store.delete(&closed_key(key)).await {
            warn!(key = %key, error = %e, "Failed to clear close marker");
        }

        channel.notify(Notice::Published(sequence));
        debug!(key = %key, sequence, kind = ?record.kind, "Published update");
        Ok(sequence)
    }

    /// Subscribe to `key`, replaying retained records from `from_sequence`
    /// (0 or 1 for everything retained) before following live updates.
    ///
    /// If `from_sequence` is beyond the next sequence to be assigned, the
    /// caller's view predates a counter reset: the feed starts with a
    /// `Reset` event and replays from 1.
    pub async fn subscribe(
        &self,
        key: &StreamKey,
        from_sequence: Sequence,
    ) -> StreamResult<Subscription> {
        let channel = self.channel(key);
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();

        let snapshot = {
            let _guard = channel.publish_lock.lock().await;
            channel.register(id, sender);
            self.snapshot(key).await
        };
        let (current, closed_at) = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                channel.unregister(id);
                drop(channel);
                self.release(key, 0);
                return Err(e);
            }
        };

        let registration = Registration {
            id,
            channel,
            notices: receiver,
        };
        let subscription = Subscription::start(
            self.clone(),
            key.clone(),
            registration,
            from_sequence,
            current,
            closed_at,
        )
        .await?;
        info!(key = %key, subscriber = id, from_sequence, current, "Subscribed");
        Ok(subscription)
    }

    /// Mark the stream at `key` as ended.
    ///
    /// Live subscribers receive the remaining records and then `Completed`;
    /// later subscribers replay what is retained and complete. A subsequent
    /// publish reopens the stream for new subscribers. Returns the last
    /// assigned sequence.
    pub async fn close_stream(&self, key: &StreamKey) -> StreamResult<Sequence> {
        let channel = self.channel(key);
        let result = async {
            let _guard = channel.publish_lock.lock().await;
            let last_sequence = self.current_sequence(key).await?;
            self.inner
                .store
                .set(
                    &closed_key(key),
                    last_sequence.to_string().into_bytes(),
                    self.inner.config.seq_ttl,
                )
                .await?;
            channel.notify(Notice::Closed { last_sequence });
            Ok::<_, StreamError>(last_sequence)
        }
        .await;
        drop(channel);
        self.release(key, 0);

        if let Ok(last_sequence) = result {
            info!(key = %key, last_sequence, "Closed stream");
        }
        result
    }

    /// Last sequence assigned at `key`, 0 if none is retained.
    pub async fn current_sequence(&self, key: &StreamKey) -> StreamResult<Sequence> {
        match self.inner.store.get(&seq_key(key)).await? {
            Some(bytes) => decode_counter(&bytes),
            None => Ok(0),
        }
    }

    /// Sequence recorded by the last close, if the stream is closed.
    pub async fn closed_at(&self, key: &StreamKey) -> StreamResult<Option<Sequence>> {
        match self.inner.store.get(&closed_key(key)).await? {
            Some(bytes) => decode_counter(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Load a retained record.
    pub async fn record(
        &self,
        key: &StreamKey,
        sequence: Sequence,
    ) -> StreamResult<Option<UpdateRecord>> {
        match self.inner.store.get(&data_key(key, sequence)).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StreamError::Serialization {
                    reason: format!("record {key}:{sequence}: {e}"),
                }),
            None => Ok(None),
        }
    }

    pub(crate) async fn is_retained(&self, key: &StreamKey, sequence: Sequence) -> StreamResult<bool> {
        Ok(self
            .inner
            .store
            .get(&data_key(key, sequence))
            .await?
            .is_some())
    }

    /// Live subscribers of `key` in this process.
    pub fn subscriber_count(&self, key: &StreamKey) -> usize {
        self.inner
            .channels
            .get(key)
            .map_or(0, |channel| channel.subscriber_count())
    }

    /// Keys with live coordination state in this process.
    pub fn active_channels(&self) -> usize {
        self.inner.channels.len()
    }

    async fn snapshot(&self, key: &StreamKey) -> StreamResult<(Sequence, Option<Sequence>)> {
        let current = self.current_sequence(key).await?;
        let closed_at = self.closed_at(key).await?;
        Ok((current, closed_at))
    }

    fn channel(&self, key: &StreamKey) -> Arc<StreamChannel> {
        self.inner
            .channels
            .entry(key.clone())
            .or_insert_with(Default::default)
            .clone()
    }

    /// Drop the channel for `key` once nothing uses it. `held` is the
    /// number of references the caller still owns.
    pub(crate) fn release(&self, key: &StreamKey, held: usize) {
        let removed = self.inner.channels.remove_if(key, |_, channel| {
            channel.subscriber_count() == 0 && Arc::strong_count(channel) <= 1 + held
        });
        if removed.is_some() {
            debug!(key = %key, "Released idle stream channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryKvStore;
    use serde_json::json;

    fn broker() -> UpdateBroker {
        UpdateBroker::new(Arc::new(InMemoryKvStore::new()), StreamConfig::default())
    }

    fn key(path: &str) -> StreamKey {
        StreamKey::new(path).expect("valid key")
    }

    #[test]
    fn test_store_key_layout() {
        let k = key("raw/x");
        assert_eq!(seq_key(&k), "seq_num:raw/x");
        assert_eq!(data_key(&k, 7), "data:raw/x:7");
        assert_eq!(closed_key(&k), "closed:raw/x");
    }

    #[tokio::test]
    async fn test_publish_assigns_consecutive_sequences() {
        let broker = broker();
        let k = key("x");
        for expected in 1..=3 {
            let seq = broker
                .publish(&k, Update::array(json!([expected])))
                .await
                .expect("publish");
            assert_eq!(seq, expected);
        }
        assert_eq!(broker.current_sequence(&k).await.expect("current"), 3);
        let record = broker.record(&k, 2).await.expect("load").expect("retained");
        assert_eq!(record.payload.as_inline(), Some(&json!([2])));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let broker = broker();
        broker.publish(&key("a"), Update::array(json!([1]))).await.expect("publish");
        let seq = broker
            .publish(&key("b"), Update::array(json!([1])))
            .await
            .expect("publish");
        assert_eq!(seq, 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_leaves_no_channel() {
        let broker = broker();
        broker.publish(&key("x"), Update::array(json!([1]))).await.expect("publish");
        assert_eq!(broker.active_channels(), 0);
    }

    #[tokio::test]
    async fn test_close_records_last_sequence() {
        let broker = broker();
        let k = key("x");
        broker.publish(&k, Update::array(json!([1]))).await.expect("publish");
        assert_eq!(broker.close_stream(&k).await.expect("close"), 1);
        assert_eq!(broker.closed_at(&k).await.expect("closed"), Some(1));

        broker.publish(&k, Update::array(json!([2]))).await.expect("publish");
        assert_eq!(broker.closed_at(&k).await.expect("closed"), None);
    }
}
