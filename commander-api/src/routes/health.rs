//! Health Check Endpoints
//!
//! - /health - Component report (local store, relay, outbox backlog)
//! - /health/ping - Simple liveness check
//!
//! `/health` answers 200 while the process can still serve writes (healthy
//! or degraded) and 503 once a component is unhealthy.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use commander_core::{HealthCheck, HealthReport, HealthStatus};

use crate::state::AppState;

/// GET /health/ping - Simple pong response
pub async fn ping() -> impl IntoResponse {
    (StatusCode::OK, "pong")
}

/// GET /health - Aggregate component health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = HealthReport::from_checks(collect_checks(&state).await);
    if report.status != HealthStatus::Healthy {
        tracing::warn!(status = ?report.status, "Health check not healthy");
    }
    (status_for(report.status), Json(report))
}

async fn collect_checks(state: &AppState) -> Vec<HealthCheck> {
    let mut checks = match &state.sync {
        Some(sync) => sync.health().await,
        None => Vec::new(),
    };

    if let Some(relay) = &state.relay {
        checks.push(match relay.count() {
            Ok(count) => {
                HealthCheck::healthy("relay_store").with_detail("envelopes", count.into())
            }
            Err(e) => HealthCheck::unhealthy("relay_store", e.to_string()),
        });
    }

    checks.push(match state.registry.revision() {
        Ok(revision) => HealthCheck::healthy("registry").with_detail("revision", revision.into()),
        Err(e) => HealthCheck::unhealthy("registry", e.to_string()),
    });
    checks
}

fn status_for(status: HealthStatus) -> StatusCode {
    match status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/", get(health))
        .route("/ping", get(ping))
}
