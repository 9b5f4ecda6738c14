//! STRATA API - Update Feed Endpoint
//!
//! Serves the sequenced update broker over WebSocket: one connection per
//! key, replaying retained records from a requested sequence and then
//! following the live stream. Writers publish in-process through the
//! [`WritePath`](strata_stream::WritePath) held by [`AppState`].

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod telemetry;

pub use config::ServerConfig;
pub use error::{ApiError, ApiResult, ErrorCode};
pub use routes::create_router;
pub use state::AppState;
pub use telemetry::{init_tracing, TelemetryConfig};
