//! Update feed over WebSocket.
//!
//! ## Protocol
//!
//! 1. Client connects to `GET /api/v1/stream/single/{key}?start=N`
//! 2. The key is validated and the subscription opened before the upgrade,
//!    so a malformed key or an unreachable store is answered over HTTP
//! 3. Server sends one JSON [`FeedMessage`] text frame per feed event:
//!    retained records from `start`, then live ones
//! 4. After `completed` the server closes with 1000; after an `error`
//!    frame it closes with 1011
//! 5. Server pings every heartbeat interval; a failed send or a client
//!    close drops the subscription
//!
//! The server ignores anything the client sends except close frames.

use std::borrow::Cow;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use strata_core::{FeedEvent, FeedMessage, Sequence, StreamKey};
use strata_stream::Subscription;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct StreamParams {
    /// First sequence to replay; 0 replays everything retained.
    #[serde(default)]
    pub start: Sequence,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/v1/stream/single/*key", get(stream_single))
}

/// WebSocket upgrade handler for one key's feed.
pub async fn stream_single(
    ws: WebSocketUpgrade,
    Path(key): Path<String>,
    Query(params): Query<StreamParams>,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    let key = StreamKey::new(&key)?;
    info!(key = %key, start = params.start, "Stream connection request");
    let subscription = state.broker.subscribe(&key, params.start).await?;
    let heartbeat = state.heartbeat_interval;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, subscription, heartbeat)))
}

/// How the send loop ended.
enum Outcome {
    Completed,
    Failed(String),
    ClientGone,
}

async fn handle_socket(socket: WebSocket, mut subscription: Subscription, heartbeat: Duration) {
    let key = subscription.key().clone();
    let (mut sender, mut receiver) = socket.split();

    let recv_key = key.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => {
                    debug!(key = %recv_key, "Client sent close frame");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(key = %recv_key, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            event = subscription.next() => match event {
                Ok(Some(event)) => {
                    let completed = matches!(event, FeedEvent::Completed { .. });
                    if let Err(e) = send_message(&mut sender, FeedMessage::from(event)).await {
                        debug!(key = %key, error = %e, "Failed to send feed message");
                        break Outcome::ClientGone;
                    }
                    if completed {
                        break Outcome::Completed;
                    }
                }
                Ok(None) => break Outcome::Completed,
                Err(e) => {
                    error!(key = %key, error = %e, "Feed failed");
                    break Outcome::Failed(e.to_string());
                }
            },
            _ = ticker.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    debug!(key = %key, "Heartbeat failed");
                    break Outcome::ClientGone;
                }
            }
            _ = &mut recv_task => {
                debug!(key = %key, "Receiver task finished");
                break Outcome::ClientGone;
            }
        }
    };
    recv_task.abort();
    drop(subscription);

    match outcome {
        Outcome::Completed => {
            close(&mut sender, close_code::NORMAL, "stream completed").await;
            info!(key = %key, "Stream completed, connection closed");
        }
        Outcome::Failed(message) => {
            let _ = send_message(&mut sender, FeedMessage::Error { message }).await;
            close(&mut sender, close_code::ERROR, "feed error").await;
        }
        Outcome::ClientGone => info!(key = %key, "Client disconnected"),
    }
}

async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: FeedMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(&message).map_err(|e| {
        error!(error = %e, message_type = message.message_type(), "Failed to serialize feed message");
        axum::Error::new(e)
    })?;
    sender.send(Message::Text(json)).await
}

async fn close(sender: &mut SplitSink<WebSocket, Message>, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    };
    if let Err(e) = sender.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "Failed to send close frame");
    }
}
