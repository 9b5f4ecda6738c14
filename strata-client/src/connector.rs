//! Connections to an update feed.
//!
//! A [`FeedConnector`] opens one feed for one key starting at a sequence;
//! the session owns reconnecting. Feeds end after `Completed`. A feed that
//! ends any other way, or yields an error other than
//! [`SessionError::Decode`], has been disconnected.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use strata_core::{FeedEvent, FeedMessage, Sequence, SessionError, StreamKey};
use strata_stream::UpdateBroker;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

/// Ordered feed events of one connection.
pub type FeedStream = BoxStream<'static, Result<FeedEvent, SessionError>>;

#[async_trait]
pub trait FeedConnector: Send + Sync + 'static {
    /// Open a feed for `key`, replaying retained records from
    /// `from_sequence`.
    async fn connect(&self, key: &StreamKey, from_sequence: Sequence)
        -> Result<FeedStream, SessionError>;

    /// Where this connector connects to, for logs and errors.
    fn endpoint(&self) -> String;
}

/// Subscribes directly to a broker in the same process.
#[derive(Debug, Clone)]
pub struct InProcessConnector {
    broker: UpdateBroker,
}

impl InProcessConnector {
    pub fn new(broker: UpdateBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl FeedConnector for InProcessConnector {
    async fn connect(
        &self,
        key: &StreamKey,
        from_sequence: Sequence,
    ) -> Result<FeedStream, SessionError> {
        let subscription = self
            .broker
            .subscribe(key, from_sequence)
            .await
            .map_err(|e| SessionError::Connect {
                endpoint: self.endpoint(),
                reason: e.to_string(),
            })?;
        Ok(subscription
            .into_stream()
            .map(|event| {
                event.map_err(|e| SessionError::Disconnected {
                    reason: e.to_string(),
                })
            })
            .boxed())
    }

    fn endpoint(&self) -> String {
        "in-process".to_string()
    }
}

/// Connects to the server's WebSocket stream route.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    /// `base_url` is the server root, e.g. `ws://localhost:8000`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn stream_url(&self, key: &StreamKey, from_sequence: Sequence) -> String {
        let path: Vec<String> = key.segments().map(encode_segment).collect();
        format!(
            "{}/api/v1/stream/single/{}?start={}",
            self.base_url,
            path.join("/"),
            from_sequence
        )
    }
}

#[async_trait]
impl FeedConnector for WsConnector {
    async fn connect(
        &self,
        key: &StreamKey,
        from_sequence: Sequence,
    ) -> Result<FeedStream, SessionError> {
        let url = self.stream_url(key, from_sequence);
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| SessionError::Connect {
                endpoint: url.clone(),
                reason: e.to_string(),
            })?;
        debug!(url = %url, "WebSocket connected");

        let events = stream::unfold(Some(socket), |state| async move {
            let mut socket = state?;
            loop {
                match socket.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let event = decode_frame(&text);
                        let keep = !matches!(event, Err(SessionError::Disconnected { .. }));
                        return Some((event, keep.then_some(socket)));
                    }
                    Some(Ok(Message::Close(Some(frame)))) if frame.code != CloseCode::Normal => {
                        let reason = SessionError::Disconnected {
                            reason: format!("closed with {}: {}", frame.code, frame.reason),
                        };
                        return Some((Err(reason), None));
                    }
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Ok(other)) => {
                        trace!(kind = ?other, "Ignoring non-text frame");
                    }
                    Some(Err(e)) => {
                        let reason = SessionError::Disconnected {
                            reason: e.to_string(),
                        };
                        return Some((Err(reason), None));
                    }
                }
            }
        });
        Ok(events.boxed())
    }

    fn endpoint(&self) -> String {
        self.base_url.clone()
    }
}

/// Decode one text frame. Server `error` frames become disconnects.
pub fn decode_frame(text: &str) -> Result<FeedEvent, SessionError> {
    let message: FeedMessage = serde_json::from_str(text).map_err(|e| SessionError::Decode {
        reason: e.to_string(),
    })?;
    message
        .into_event()
        .map_err(|reason| SessionError::Disconnected { reason })
}

/// Percent-encode one key segment for a URL path.
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_test_utils::fixtures::{record, stream_key};

    #[test]
    fn test_stream_url_encodes_segments() {
        let connector = WsConnector::new("ws://localhost:8000/");
        let url = connector.stream_url(&stream_key("raw/scan 1/primary"), 4);
        assert_eq!(
            url,
            "ws://localhost:8000/api/v1/stream/single/raw/scan%201/primary?start=4"
        );
    }

    #[test]
    fn test_decode_frame() {
        let record = record("x", 3, &[1, 2]);
        let text = serde_json::to_string(&FeedMessage::from(FeedEvent::Record(record.clone())))
            .expect("serialize");
        assert_eq!(decode_frame(&text), Ok(FeedEvent::Record(record)));

        assert!(matches!(
            decode_frame("{not json"),
            Err(SessionError::Decode { .. })
        ));
        assert!(matches!(
            decode_frame(r#"{"type":"error","message":"store down"}"#),
            Err(SessionError::Disconnected { reason }) if reason == "store down"
        ));
    }
}
