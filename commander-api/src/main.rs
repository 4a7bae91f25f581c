//! COMMANDER API Server Entry Point
//!
//! Loads configuration from the environment, opens the stores, applies
//! `cluster.yaml`/`roles.yaml`, spawns the background jobs and serves HTTP
//! until ctrl-c.

use std::net::SocketAddr;

use commander_api::jobs::{self, ConfigWatcher, ConfigWatcherConfig};
use commander_api::telemetry::{init_tracer, TelemetryConfig};
use commander_api::{create_router, ApiConfig, ApiError, ApiResult, AppState};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> ApiResult<()> {
    let telemetry_config = TelemetryConfig::default();
    init_tracer(&telemetry_config)?;

    let config = ApiConfig::from_env()?;
    let addr = resolve_bind_addr(&config)?;
    let state = AppState::open(config)?;

    // Register nodes and roles before the first request is served.
    let mut watcher = ConfigWatcher::new(
        state.registry.clone(),
        ConfigWatcherConfig::from_api_config(&state.config),
    );
    watcher.poll_once();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = jobs::spawn_all(&state, watcher, shutdown_rx);

    let controller = state.controller.clone();
    let app = create_router(state.clone());

    tracing::info!(
        %addr,
        node_id = %state.config.local_node_id,
        relay_mode = %state.config.relay_mode,
        "Starting COMMANDER API server"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await
        .map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;

    let _ = shutdown_tx.send(true);
    handles.join().await;
    controller.shutdown().await;
    tracing::info!("COMMANDER API server stopped");
    Ok(())
}

fn resolve_bind_addr(config: &ApiConfig) -> ApiResult<SocketAddr> {
    let addr = format!("{}:{}", config.bind_addr, config.port);
    addr.parse::<SocketAddr>()
        .map_err(|e| ApiError::invalid_input(format!("Invalid bind address {}: {}", addr, e)))
}
