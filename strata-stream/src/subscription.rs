//! Server-side subscription feed.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::stream::{self, Stream};
use strata_core::{FeedEvent, Sequence, StreamError, StreamKey, StreamResult};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::broker::{Notice, StreamChannel, UpdateBroker};

/// A subscriber's slot in a stream channel.
pub(crate) struct Registration {
    pub(crate) id: u64,
    pub(crate) channel: Arc<StreamChannel>,
    pub(crate) notices: mpsc::UnboundedReceiver<Notice>,
}

/// Ordered feed of one key: retained records first, then live ones.
///
/// Records are read from the store by sequence, so a subscriber that falls
/// behind never loses records that are still retained. Sequences whose
/// record has expired or was never written are skipped. Dropping the
/// subscription unregisters it from the broker.
pub struct Subscription {
    broker: UpdateBroker,
    key: StreamKey,
    registration: Registration,
    pending: VecDeque<FeedEvent>,
    /// Last sequence handed out (or skipped).
    delivered: Sequence,
    /// Highest sequence known to be published.
    target: Sequence,
    close_at: Option<Sequence>,
    finished: bool,
}

impl Subscription {
    pub(crate) async fn start(
        broker: UpdateBroker,
        key: StreamKey,
        registration: Registration,
        from_sequence: Sequence,
        current: Sequence,
        closed_at: Option<Sequence>,
    ) -> StreamResult<Self> {
        let mut subscription = Self {
            broker,
            key,
            registration,
            pending: VecDeque::new(),
            delivered: 0,
            // A close marker can outlive the counter; its records are then
            // skipped as expired.
            target: current.max(closed_at.unwrap_or(0)),
            close_at: closed_at,
            finished: false,
        };

        let mut from = from_sequence.max(1);
        if from > current + 1 {
            debug!(
                key = %subscription.key,
                requested = from_sequence,
                current,
                "Requested sequence is ahead of the stream, resetting"
            );
            subscription.pending.push_back(FeedEvent::Reset {
                previous: from_sequence - 1,
            });
            from = 1;
        }

        if from <= current {
            from = subscription.first_retained(from, current).await?;
        }
        subscription.delivered = from - 1;
        Ok(subscription)
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Last sequence delivered or skipped.
    pub fn position(&self) -> Sequence {
        self.delivered
    }

    /// Lowest retained sequence in `from..=current`, or `current + 1`.
    ///
    /// Records expire in write order, so the retained ones form a suffix;
    /// a binary search finds its start without probing every expired
    /// sequence.
    async fn first_retained(&self, from: Sequence, current: Sequence) -> StreamResult<Sequence> {
        if self.broker.is_retained(&self.key, from).await? {
            return Ok(from);
        }
        let (mut lo, mut hi) = (from + 1, current + 1);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.broker.is_retained(&self.key, mid).await? {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        if lo > from {
            debug!(key = %self.key, from, first_retained = lo, "Skipping expired records");
        }
        Ok(lo)
    }

    /// Next feed event.
    ///
    /// Returns `Ok(None)` once `Completed` has been delivered. Waits for a
    /// publish or a close when caught up. Cancel safe: a dropped call loses
    /// no event.
    pub async fn next(&mut self) -> StreamResult<Option<FeedEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.finished {
                return Ok(None);
            }

            if self.delivered < self.target {
                let sequence = self.delivered + 1;
                let record = self.broker.record(&self.key, sequence).await?;
                self.delivered = sequence;
                match record {
                    Some(record) => return Ok(Some(FeedEvent::Record(record))),
                    None => {
                        trace!(key = %self.key, sequence, "Record not retained, skipping");
                        continue;
                    }
                }
            }

            if let Some(last_sequence) = self.close_at {
                if self.delivered >= last_sequence {
                    self.finished = true;
                    return Ok(Some(FeedEvent::Completed { last_sequence }));
                }
            }

            match self.registration.notices.recv().await {
                Some(Notice::Published(sequence)) => self.on_published(sequence),
                Some(Notice::Closed { last_sequence }) => {
                    self.close_at = Some(last_sequence);
                    self.target = self.target.max(last_sequence);
                }
                None => return Err(StreamError::BrokerGone),
            }
        }
    }

    fn on_published(&mut self, sequence: Sequence) {
        if sequence > self.delivered {
            self.target = self.target.max(sequence);
        } else if sequence == 1 {
            // The counter expired and restarted.
            debug!(key = %self.key, previous = self.delivered, "Stream sequence reset");
            self.pending.push_back(FeedEvent::Reset {
                previous: self.delivered,
            });
            self.delivered = 0;
            self.target = 1;
        }
    }

    /// Adapt into a [`Stream`] that ends after `Completed` or the first
    /// error.
    pub fn into_stream(self) -> impl Stream<Item = StreamResult<FeedEvent>> + Send {
        stream::unfold(Some(self), |state| async move {
            let mut subscription = state?;
            match subscription.next().await {
                Ok(Some(event)) => Some((Ok(event), Some(subscription))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.registration.id)
            .field("delivered", &self.delivered)
            .field("target", &self.target)
            .field("close_at", &self.close_at)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registration.channel.unregister(self.registration.id);
        self.broker.release(&self.key, 1);
        debug!(key = %self.key, subscriber = self.registration.id, "Unsubscribed");
    }
}
