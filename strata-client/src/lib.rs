//! STRATA Client - Subscription Session
//!
//! Follows the update feed of one key and dispatches records to callbacks
//! by [`EventCategory`](strata_core::EventCategory). The session owns one
//! background receive loop per key, reconnects with jittered exponential
//! backoff and resumes after the last delivered sequence, so a transient
//! disconnect loses nothing that is still retained.
//!
//! ```ignore
//! let config = ClientConfig::load()?;
//! let session = SubscriptionSession::websocket(&config, StreamKey::new("raw/scan_1/primary")?);
//! session.add_callback(EventCategory::NewData, |record| {
//!     tracing::info!(sequence = record.sequence, "new data");
//! });
//! session.start()?;
//! let reason = session.wait().await;
//! ```

pub mod config;
pub mod connector;
pub mod session;

pub use config::{ClientCacheConfig, ClientConfig, ReconnectConfig, CONFIG_ENV};
pub use connector::{decode_frame, FeedConnector, FeedStream, InProcessConnector, WsConnector};
pub use session::{CallbackId, CloseReason, SessionState, SubscriptionSession};

use std::sync::Arc;

use strata_cache::Cache;
use strata_core::CacheResult;

/// Open the local resource cache configured in `config`, if any.
pub fn open_client_cache(config: &ClientConfig) -> CacheResult<Option<Arc<dyn Cache>>> {
    config
        .cache
        .as_ref()
        .map(|cache| strata_cache::open_cache(&cache.to_cache_config()))
        .transpose()
}
