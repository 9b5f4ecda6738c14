//! HTTP and WebSocket routes.

pub mod health;
pub mod stream;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(stream::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
