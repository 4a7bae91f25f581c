//! System status and maintenance endpoints.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use commander_storage::SyncStats;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::broadcast::BroadcastMetricsSnapshot;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub local_node_id: String,
    pub relay_mode: String,
    pub uptime_seconds: u64,
    pub nodes: usize,
    /// Node count per status.
    pub node_status: BTreeMap<String, usize>,
    pub agents: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_envelopes: Option<u64>,
    pub stream_subscribers: usize,
    pub broadcast: BroadcastMetricsSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayResponse {
    pub replayed: usize,
}

/// GET /system/status
pub async fn status(State(state): State<AppState>) -> ApiResult<Json<SystemStatus>> {
    let snapshot = state.registry.snapshot()?;
    let mut node_status = BTreeMap::new();
    for node in &snapshot.nodes {
        *node_status.entry(node.status.to_string()).or_insert(0) += 1;
    }

    let sync = match &state.sync {
        Some(sync) => Some(sync.stats()?),
        None => None,
    };
    let relay_envelopes = match &state.relay {
        Some(relay) => Some(relay.count()?),
        None => None,
    };

    Ok(Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        local_node_id: state.config.local_node_id.clone(),
        relay_mode: state.config.relay_mode.to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        nodes: snapshot.nodes.len(),
        node_status,
        agents: snapshot.agents.len(),
        sync,
        relay_envelopes,
        stream_subscribers: state.broadcaster.subscriber_count(),
        broadcast: state.broadcaster.metrics().snapshot(),
    }))
}

/// POST /system/outbox/replay - Requeue records whose retries ran out
pub async fn replay_outbox(State(state): State<AppState>) -> ApiResult<Json<ReplayResponse>> {
    let replayed = state.require_sync()?.replay_failed()?;
    Ok(Json(ReplayResponse { replayed }))
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/outbox/replay", post(replay_outbox))
}
