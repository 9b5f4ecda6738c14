//! STRATA API Server Entry Point

use std::sync::Arc;
use std::time::Duration;

use strata_api::{create_router, init_tracing, ApiError, ApiResult, AppState, ServerConfig, TelemetryConfig};
use strata_stream::InMemoryKvStore;

/// How often expired keys are swept from the in-process store.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ApiResult<()> {
    init_tracing(&TelemetryConfig::default())?;
    let config = ServerConfig::from_env()?;

    let store = Arc::new(InMemoryKvStore::new());
    let state = AppState::new(store.clone(), &config);
    let app = create_router(state);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            store.purge_expired();
        }
    });

    tracing::info!(
        addr = %config.bind,
        data_ttl_secs = config.stream.data_ttl.as_secs(),
        seq_ttl_secs = config.stream.seq_ttl.as_secs(),
        "Starting STRATA API server"
    );
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", config.bind, e)))?;

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }
    Ok(())
}
