//! Shared application state for Axum routers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use strata_stream::{KeyValueWithExpiry, UpdateBroker, WritePath};

use crate::config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    pub broker: UpdateBroker,
    /// Mutations announced here are published to the broker.
    pub write_path: WritePath,
    pub heartbeat_interval: Duration,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(store: Arc<dyn KeyValueWithExpiry>, config: &ServerConfig) -> Self {
        let broker = UpdateBroker::new(store, config.stream);
        let write_path = WritePath::new().with_observer(Arc::new(broker.clone()));
        Self {
            broker,
            write_path,
            heartbeat_interval: config.heartbeat_interval,
            start_time: Instant::now(),
        }
    }
}
