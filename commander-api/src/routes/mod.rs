//! REST API Routes Module
//!
//! Each submodule owns one resource and exposes a `create_router()`;
//! [`create_router`] nests them and applies the cross-cutting layers.

pub mod agents;
pub mod health;
pub mod messages;
pub mod nodes;
pub mod relay;
pub mod system;
pub mod tasks;

use std::time::Duration;

use axum::{
    http::{header, HeaderValue, Method},
    middleware::from_fn,
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::config::ApiConfig;
use crate::state::AppState;
use crate::telemetry::{metrics_handler, observability_middleware};
use crate::ws::ws_handler;

/// Build the complete router.
///
/// - `/relay/*` only when this process hosts the relay store
/// - `/messages/*` answer 503 when no local store is hosted
/// - `/health`, `/metrics` and `/ws` are always mounted
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .nest("/nodes", nodes::create_router())
        .nest("/agents", agents::create_router())
        .nest("/tasks", tasks::create_router())
        .nest("/messages", messages::create_router())
        .nest("/system", system::create_router())
        .nest("/health", health::create_router())
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler));

    if state.relay.is_some() {
        router = router.nest("/relay", relay::create_router());
    }

    let cors = build_cors_layer(&state.config);

    router
        .layer(from_fn(observability_middleware))
        .layer(cors)
        .with_state(state)
}

fn build_cors_layer(config: &ApiConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(Duration::from_secs(config.cors_max_age_secs));

    if config.cors_origins.is_empty() {
        tracing::info!("CORS: Development mode - allowing all origins");
        cors.allow_origin(Any).allow_headers(Any)
    } else {
        tracing::info!(origins = ?config.cors_origins, "CORS: restricting origins");
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        if config.cors_allow_credentials {
            cors.allow_origin(origins).allow_credentials(true)
        } else {
            cors.allow_origin(origins)
        }
    }
}
