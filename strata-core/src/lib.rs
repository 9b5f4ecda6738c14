//! STRATA Core - Shared Types
//!
//! Data model shared by the scored eviction cache, the sequenced update
//! broker and the client subscription session. This crate contains no I/O.

pub mod config;
pub mod error;
pub mod key;
pub mod record;

pub use config::{
    CacheConfig, StreamConfig, DEFAULT_DATA_TTL, DEFAULT_HALFLIFE, DEFAULT_INDEX_MAP_SIZE,
    DEFAULT_SEQ_TTL, DISK_HEADROOM_BYTES,
};
pub use error::{
    CacheError, CacheResult, ConfigError, SessionError, StrataError, StrataResult, StreamError,
    StreamResult, ValidationError,
};
pub use key::{CacheKey, StreamKey};
pub use record::{
    ArrayPatch, EventCategory, FeedEvent, FeedMessage, Payload, Sequence, Timestamp, Update,
    UpdateKind, UpdateRecord,
};
