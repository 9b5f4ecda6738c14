//! Hook through which the write path announces mutations.

use std::sync::Arc;

use async_trait::async_trait;
use strata_core::{StreamKey, StreamResult, Update};
use tracing::warn;

use crate::broker::UpdateBroker;

/// Receives every successful write to a streamable resource.
#[async_trait]
pub trait WriteObserver: Send + Sync {
    async fn on_write(&self, key: &StreamKey, update: &Update) -> StreamResult<()>;
}

#[async_trait]
impl WriteObserver for UpdateBroker {
    async fn on_write(&self, key: &StreamKey, update: &Update) -> StreamResult<()> {
        self.publish(key, update.clone()).await.map(|_| ())
    }
}

/// Fan-out of writes to every registered observer.
#[derive(Clone, Default)]
pub struct WritePath {
    observers: Vec<Arc<dyn WriteObserver>>,
}

impl WritePath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(mut self, observer: Arc<dyn WriteObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn register(&mut self, observer: Arc<dyn WriteObserver>) {
        self.observers.push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Notify every observer, even when an earlier one fails.
    ///
    /// Returns the first failure so the writer can retry; the write itself
    /// has already happened.
    pub async fn notify(&self, key: &StreamKey, update: &Update) -> StreamResult<()> {
        let mut first_error = None;
        for observer in &self.observers {
            if let Err(e) = observer.on_write(key, update).await {
                warn!(key = %key, error = %e, retryable = e.is_retryable(), "Write observer failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryKvStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strata_core::{StreamConfig, StreamError};

    struct Failing;

    #[async_trait]
    impl WriteObserver for Failing {
        async fn on_write(&self, key: &StreamKey, _update: &Update) -> StreamResult<()> {
            Err(StreamError::PublishFailed {
                key: key.to_string(),
                reason: "store unreachable".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl WriteObserver for Counting {
        async fn on_write(&self, _key: &StreamKey, _update: &Update) -> StreamResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_broker_observes_writes() {
        let broker = UpdateBroker::new(Arc::new(InMemoryKvStore::new()), StreamConfig::default());
        let path = WritePath::new().with_observer(Arc::new(broker.clone()));
        let key = StreamKey::new("x").expect("key");

        path.notify(&key, &Update::array(serde_json::json!([1])))
            .await
            .expect("notify");
        assert_eq!(broker.current_sequence(&key).await.expect("current"), 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_skip_later_observers() {
        let counting = Arc::new(Counting::default());
        let mut path = WritePath::new().with_observer(Arc::new(Failing));
        path.register(counting.clone());
        let key = StreamKey::new("x").expect("key");

        let err = path
            .notify(&key, &Update::array(serde_json::json!([1])))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
        assert_eq!(path.observer_count(), 2);
    }
}
