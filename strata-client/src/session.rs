//! Long-lived subscription session with callback dispatch.
//!
//! A [`SubscriptionSession`] keeps one feed open for one key on a
//! background task, dispatches every record to the callbacks registered
//! for its [`EventCategory`], and reconnects with jittered exponential
//! backoff, resuming after the last delivered sequence.
//!
//! # Callbacks
//!
//! Callbacks run synchronously on the delivery task and must not block
//! for long. A panicking callback is logged and the remaining callbacks
//! for the same record still run. Callbacks may call
//! [`SubscriptionSession::stop`], [`add_callback`](SubscriptionSession::add_callback)
//! and [`remove_callback`](SubscriptionSession::remove_callback).
//!
//! # Stopping
//!
//! Dispatching one record and marking the session stopped take the same
//! lock, so once [`stop`](SubscriptionSession::stop) returns no callback
//! runs again. Called from inside a callback, `stop` cannot wait for the
//! dispatch it is part of; it returns at once and the rest of that
//! record's callbacks are skipped.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::StreamExt;
use strata_core::{EventCategory, FeedEvent, Sequence, SessionError, StreamKey, UpdateRecord};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::{ClientConfig, ReconnectConfig};
use crate::connector::{FeedConnector, WsConnector};

thread_local! {
    /// Session whose callbacks are running on this thread, if any.
    static DISPATCHING: Cell<Option<u64>> = const { Cell::new(None) };
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned by [`SubscriptionSession::add_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type Callback = Arc<dyn Fn(&UpdateRecord) + Send + Sync>;

struct Registered {
    id: CallbackId,
    category: EventCategory,
    callback: Callback,
}

/// Why a session stopped delivering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The stream was closed by its writer and fully delivered.
    Completed { last_sequence: Sequence },
    /// [`SubscriptionSession::stop`] was called.
    Stopped,
    /// Reconnect attempts were exhausted.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Closed(CloseReason),
}

impl SessionState {
    pub fn close_reason(&self) -> Option<&CloseReason> {
        match self {
            Self::Closed(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

/// What the receive loop does after one event.
enum Flow {
    Continue,
    Completed(Sequence),
    Stopped,
}

/// State shared between the handles and the receive loop.
struct Shared {
    id: u64,
    key: StreamKey,
    callbacks: Mutex<Vec<Registered>>,
    next_callback: AtomicU64,
    /// Held while one record is dispatched, and by `stop` to wait for it.
    dispatch: Mutex<()>,
    stopped: AtomicBool,
    /// Last delivered sequence, 0 before the first record.
    last_sequence: AtomicU64,
    state: watch::Sender<SessionState>,
}

impl Shared {
    fn lock_dispatch(&self) -> MutexGuard<'_, ()> {
        self.dispatch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_callbacks(&self) -> MutexGuard<'_, Vec<Registered>> {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn is_dispatching_here(&self) -> bool {
        DISPATCHING.with(|current| current.get() == Some(self.id))
    }

    /// Set the state unless the session already closed.
    fn transition(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_closed() || *state == next {
                false
            } else {
                *state = next;
                true
            }
        })
    }

    fn deliver(&self, event: FeedEvent) -> Flow {
        let _dispatch = self.lock_dispatch();
        if self.is_stopped() {
            return Flow::Stopped;
        }

        match event {
            FeedEvent::Record(record) => {
                let last = self.last_sequence.load(Ordering::SeqCst);
                if record.sequence <= last {
                    trace!(key = %self.key, sequence = record.sequence, last, "Skipping duplicate record");
                    return Flow::Continue;
                }
                self.last_sequence.store(record.sequence, Ordering::SeqCst);
                self.dispatch_record(&record);
                Flow::Continue
            }
            FeedEvent::Reset { previous } => {
                debug!(key = %self.key, previous, "Stream sequence reset");
                self.last_sequence.store(0, Ordering::SeqCst);
                Flow::Continue
            }
            FeedEvent::Completed { last_sequence } => Flow::Completed(last_sequence),
        }
    }

    fn dispatch_record(&self, record: &UpdateRecord) {
        let category = record.category();
        // Snapshot so callbacks can register or remove callbacks.
        let callbacks: Vec<(CallbackId, Callback)> = self
            .lock_callbacks()
            .iter()
            .filter(|registered| registered.category == category)
            .map(|registered| (registered.id, Arc::clone(&registered.callback)))
            .collect();

        for (id, callback) in callbacks {
            if self.is_stopped() {
                break;
            }
            let outer = DISPATCHING.with(|current| current.replace(Some(self.id)));
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(record)));
            DISPATCHING.with(|current| current.set(outer));
            if outcome.is_err() {
                error!(
                    key = %self.key,
                    sequence = record.sequence,
                    callback = id.0,
                    "Callback panicked"
                );
            }
        }
    }
}

/// Client-side subscription to one key. Clones share the session.
#[derive(Clone)]
pub struct SubscriptionSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    shared: Arc<Shared>,
    connector: Arc<dyn FeedConnector>,
    reconnect: ReconnectConfig,
    from_sequence: Sequence,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(task) = task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SubscriptionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionSession")
            .field("key", &self.inner.shared.key)
            .field("endpoint", &self.inner.connector.endpoint())
            .field("state", &*self.inner.shared.state.borrow())
            .field("last_sequence", &self.last_sequence())
            .finish()
    }
}

impl SubscriptionSession {
    pub fn new(connector: Arc<dyn FeedConnector>, key: StreamKey, reconnect: ReconnectConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Arc::new(SessionInner {
                shared: Arc::new(Shared {
                    id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                    key,
                    callbacks: Mutex::new(Vec::new()),
                    next_callback: AtomicU64::new(1),
                    dispatch: Mutex::new(()),
                    stopped: AtomicBool::new(false),
                    last_sequence: AtomicU64::new(0),
                    state,
                }),
                connector,
                reconnect,
                from_sequence: 0,
                started: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }

    /// Session against the WebSocket endpoint in `config`.
    pub fn websocket(config: &ClientConfig, key: StreamKey) -> Self {
        Self::new(
            Arc::new(WsConnector::new(config.ws_endpoint.clone())),
            key,
            config.reconnect.clone(),
        )
    }

    /// Start replay at `from_sequence` instead of everything retained.
    /// Only meaningful before [`start`](Self::start).
    pub fn from_sequence(self, from_sequence: Sequence) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.from_sequence = from_sequence;
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                warn!(key = %inner.shared.key, "from_sequence ignored on a shared session");
                Self { inner }
            }
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.inner.shared.key
    }

    /// Register `callback` for records of `category`.
    pub fn add_callback<F>(&self, category: EventCategory, callback: F) -> CallbackId
    where
        F: Fn(&UpdateRecord) + Send + Sync + 'static,
    {
        let shared = &self.inner.shared;
        let id = CallbackId(shared.next_callback.fetch_add(1, Ordering::Relaxed));
        shared.lock_callbacks().push(Registered {
            id,
            category,
            callback: Arc::new(callback),
        });
        id
    }

    /// Returns false if `id` was not registered.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self.inner.shared.lock_callbacks();
        let before = callbacks.len();
        callbacks.retain(|registered| registered.id != id);
        callbacks.len() != before
    }

    /// Spawn the receive loop. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) || inner.shared.is_stopped() {
            return Err(SessionError::AlreadyStarted);
        }
        let task = tokio::spawn(receive_loop(
            Arc::clone(&inner.shared),
            Arc::clone(&inner.connector),
            inner.reconnect.clone(),
            inner.from_sequence,
        ));
        *inner.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);
        Ok(())
    }

    /// Stop delivering and close the connection. Idempotent.
    ///
    /// Unless called from one of this session's own callbacks, no callback
    /// runs after this returns.
    pub fn stop(&self) {
        let shared = &self.inner.shared;
        let first = !shared.stopped.swap(true, Ordering::SeqCst);
        if !shared.is_dispatching_here() {
            drop(shared.lock_dispatch());
        }
        if !first {
            return;
        }

        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        shared.lock_callbacks().clear();
        shared.transition(SessionState::Closed(CloseReason::Stopped));
        info!(key = %shared.key, "Session stopped");
    }

    /// Alias of [`stop`](Self::stop).
    pub fn disconnect(&self) {
        self.stop();
    }

    pub fn state(&self) -> SessionState {
        self.inner.shared.state.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.state.borrow().is_closed()
    }

    /// Last delivered sequence, 0 before the first record or after a reset.
    pub fn last_sequence(&self) -> Sequence {
        self.inner.shared.last_sequence.load(Ordering::SeqCst)
    }

    /// Wait until the session closes.
    pub async fn wait(&self) -> CloseReason {
        let mut state = self.inner.shared.state.subscribe();
        let reason = match state.wait_for(SessionState::is_closed).await {
            Ok(state) => state.close_reason().cloned().unwrap_or(CloseReason::Stopped),
            Err(_) => CloseReason::Stopped,
        };
        reason
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    connector: Arc<dyn FeedConnector>,
    reconnect: ReconnectConfig,
    from_sequence: Sequence,
) {
    let mut backoff = reconnect.initial_ms;
    let mut failures: u32 = 0;

    loop {
        if shared.is_stopped() {
            return;
        }
        let from = match shared.last_sequence.load(Ordering::SeqCst) {
            0 => from_sequence,
            last => last + 1,
        };

        let failure = match connector.connect(&shared.key, from).await {
            Ok(mut feed) => {
                info!(key = %shared.key, endpoint = %connector.endpoint(), from, "Session connected");
                shared.transition(SessionState::Active);
                failures = 0;
                backoff = reconnect.initial_ms;

                loop {
                    match feed.next().await {
                        Some(Ok(event)) => match shared.deliver(event) {
                            Flow::Continue => {}
                            Flow::Completed(last_sequence) => {
                                info!(key = %shared.key, last_sequence, "Stream completed");
                                shared.transition(SessionState::Closed(CloseReason::Completed {
                                    last_sequence,
                                }));
                                return;
                            }
                            Flow::Stopped => return,
                        },
                        Some(Err(SessionError::Decode { reason })) => {
                            warn!(key = %shared.key, reason = %reason, "Dropping undecodable feed message");
                        }
                        Some(Err(e)) => break e,
                        None => {
                            break SessionError::Disconnected {
                                reason: "feed ended before completion".to_string(),
                            }
                        }
                    }
                }
            }
            Err(e) => e,
        };

        if shared.is_stopped() {
            return;
        }
        failures = failures.saturating_add(1);
        if reconnect.max_attempts.is_some_and(|max| failures >= max) {
            error!(key = %shared.key, failures, error = %failure, "Giving up on feed");
            shared.transition(SessionState::Closed(CloseReason::Error(failure.to_string())));
            return;
        }

        let delay = jittered_backoff(backoff, reconnect.jitter_ms);
        warn!(
            key = %shared.key,
            error = %failure,
            attempt = failures,
            delay_ms = delay,
            "Feed disconnected, reconnecting"
        );
        tokio::time::sleep(Duration::from_millis(delay)).await;

        let next = (backoff as f64 * reconnect.multiplier) as u64;
        backoff = next.min(reconnect.max_ms);
    }
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    base_ms.saturating_add(nanos % jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_is_bounded() {
        assert_eq!(jittered_backoff(100, 0), 100);
        for _ in 0..100 {
            let delay = jittered_backoff(100, 50);
            assert!((100..150).contains(&delay));
        }
    }

    #[test]
    fn test_state_helpers() {
        assert!(!SessionState::Active.is_closed());
        let closed = SessionState::Closed(CloseReason::Completed { last_sequence: 3 });
        assert_eq!(
            closed.close_reason(),
            Some(&CloseReason::Completed { last_sequence: 3 })
        );
    }
}
