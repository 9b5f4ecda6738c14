//! Update records carried by the streaming feed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::key::StreamKey;

/// Per-key sequence number. The first record of a stream is 1; 0 means
/// "before the first retained record".
pub type Sequence = u64;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// What kind of mutation a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// New array values carried inline.
    ArrayData,
    /// New array values written to storage; the record only references them.
    ArrayRef,
    /// New table rows or partitions.
    TableData,
    /// A child node was created under the key.
    ChildCreated,
    /// A child node's metadata changed.
    ChildMetadataUpdated,
}

impl UpdateKind {
    pub fn category(self) -> EventCategory {
        match self {
            Self::ArrayData | Self::ArrayRef | Self::TableData => EventCategory::NewData,
            Self::ChildCreated => EventCategory::ChildCreated,
            Self::ChildMetadataUpdated => EventCategory::MetadataUpdated,
        }
    }
}

/// Category subscribers register callbacks against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    NewData,
    ChildCreated,
    MetadataUpdated,
}

/// Where new array values land inside the existing array.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArrayPatch {
    pub offset: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<u64>>,
    /// Whether the write grows the array past its current extent.
    #[serde(default)]
    pub extend: bool,
}

impl ArrayPatch {
    pub fn at(offset: Vec<u64>) -> Self {
        Self {
            offset,
            shape: None,
            extend: false,
        }
    }

    pub fn extending(offset: Vec<u64>) -> Self {
        Self {
            offset,
            shape: None,
            extend: true,
        }
    }

    pub fn with_shape(mut self, shape: Vec<u64>) -> Self {
        self.shape = Some(shape);
        self
    }
}

/// Record body: the values themselves or a pointer to where they were stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Inline(JsonValue),
    Reference { uri: String },
    Empty,
}

impl Payload {
    pub fn as_inline(&self) -> Option<&JsonValue> {
        match self {
            Self::Inline(value) => Some(value),
            _ => None,
        }
    }
}

/// A mutation as handed to the broker by the write path, before sequencing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub kind: UpdateKind,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<ArrayPatch>,
    #[serde(default)]
    pub persisted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

impl Update {
    pub fn new(kind: UpdateKind, payload: Payload) -> Self {
        Self {
            kind,
            payload,
            patch: None,
            persisted: false,
            metadata: None,
        }
    }

    /// Inline array values.
    pub fn array(values: JsonValue) -> Self {
        Self::new(UpdateKind::ArrayData, Payload::Inline(values))
    }

    /// Array values already persisted at `uri`.
    pub fn array_ref(uri: impl Into<String>) -> Self {
        let mut update = Self::new(UpdateKind::ArrayRef, Payload::Reference { uri: uri.into() });
        update.persisted = true;
        update
    }

    pub fn table(rows: JsonValue) -> Self {
        Self::new(UpdateKind::TableData, Payload::Inline(rows))
    }

    pub fn child_created(child: impl Into<String>) -> Self {
        Self::new(
            UpdateKind::ChildCreated,
            Payload::Inline(JsonValue::String(child.into())),
        )
    }

    pub fn with_patch(mut self, patch: ArrayPatch) -> Self {
        self.patch = Some(patch);
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn persisted(mut self, persisted: bool) -> Self {
        self.persisted = persisted;
        self
    }

    /// Attach the broker-assigned sequence.
    pub fn into_record(self, key: StreamKey, sequence: Sequence, timestamp: Timestamp) -> UpdateRecord {
        UpdateRecord {
            sequence,
            timestamp,
            key,
            kind: self.kind,
            payload: self.payload,
            patch: self.patch,
            persisted: self.persisted,
            metadata: self.metadata,
        }
    }
}

/// A sequenced, retained update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub sequence: Sequence,
    pub timestamp: Timestamp,
    pub key: StreamKey,
    pub kind: UpdateKind,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<ArrayPatch>,
    #[serde(default)]
    pub persisted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

impl UpdateRecord {
    pub fn category(&self) -> EventCategory {
        self.kind.category()
    }
}

/// One item of a subscription feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Record(UpdateRecord),
    /// The key's sequence restarted; `previous` is the last sequence the
    /// subscriber had seen. Not an error.
    Reset { previous: Sequence },
    /// The stream was closed and everything up to `last_sequence` has been
    /// delivered.
    Completed { last_sequence: Sequence },
}

/// Wire form of feed events, one JSON text frame per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    Record { record: UpdateRecord },
    Reset { previous: Sequence },
    Completed { last_sequence: Sequence },
    Error { message: String },
}

impl From<FeedEvent> for FeedMessage {
    fn from(event: FeedEvent) -> Self {
        match event {
            FeedEvent::Record(record) => Self::Record { record },
            FeedEvent::Reset { previous } => Self::Reset { previous },
            FeedEvent::Completed { last_sequence } => Self::Completed { last_sequence },
        }
    }
}

impl FeedMessage {
    /// Convert back to a feed event; `Error` frames yield their message.
    pub fn into_event(self) -> Result<FeedEvent, String> {
        match self {
            Self::Record { record } => Ok(FeedEvent::Record(record)),
            Self::Reset { previous } => Ok(FeedEvent::Reset { previous }),
            Self::Completed { last_sequence } => Ok(FeedEvent::Completed { last_sequence }),
            Self::Error { message } => Err(message),
        }
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Record { .. } => "record",
            Self::Reset { .. } => "reset",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
        }
    }
}
