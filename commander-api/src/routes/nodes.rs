//! Node REST API Routes

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use commander_agents::{EngineController, NodeRegistry};
use commander_core::{EngineSettings, Node, NodeId, NodeStatus};
use serde::{Deserialize, Serialize};

use crate::error::ApiResult;
use crate::state::AppState;

/// Response for an accepted lifecycle request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleAccepted {
    pub node_id: NodeId,
    /// Status the node is heading to; the transition completes in the
    /// background.
    pub target_status: NodeStatus,
}

/// GET /nodes - All registered nodes in id order
pub async fn list_nodes(State(registry): State<Arc<NodeRegistry>>) -> ApiResult<Json<Vec<Node>>> {
    Ok(Json(registry.list_nodes()?))
}

/// GET /nodes/:node_id
pub async fn get_node(
    State(registry): State<Arc<NodeRegistry>>,
    Path(node_id): Path<NodeId>,
) -> ApiResult<Json<Node>> {
    Ok(Json(registry.get_node(&node_id)?))
}

/// POST /nodes/:node_id/start
pub async fn start_node(
    State(controller): State<Arc<EngineController>>,
    Path(node_id): Path<NodeId>,
) -> ApiResult<impl IntoResponse> {
    let target_status = controller.request_start(&node_id).await?;
    tracing::info!(node_id = %node_id, target = %target_status, "Start requested");
    Ok(accepted(node_id, target_status))
}

/// POST /nodes/:node_id/stop
pub async fn stop_node(
    State(controller): State<Arc<EngineController>>,
    Path(node_id): Path<NodeId>,
) -> ApiResult<impl IntoResponse> {
    let target_status = controller.request_stop(&node_id).await?;
    tracing::info!(node_id = %node_id, "Stop requested");
    Ok(accepted(node_id, target_status))
}

/// POST /nodes/:node_id/engine - Re-ignite with new settings
///
/// Requests that arrive while a re-ignition runs collapse into the latest
/// one; every caller still gets a 202.
pub async fn reconfigure_engine(
    State(controller): State<Arc<EngineController>>,
    Path(node_id): Path<NodeId>,
    Json(settings): Json<EngineSettings>,
) -> ApiResult<impl IntoResponse> {
    let target_status = controller.request_reconfigure(&node_id, settings).await?;
    tracing::info!(node_id = %node_id, "Engine reconfiguration requested");
    Ok(accepted(node_id, target_status))
}

fn accepted(node_id: NodeId, target_status: NodeStatus) -> (StatusCode, Json<LifecycleAccepted>) {
    (
        StatusCode::ACCEPTED,
        Json(LifecycleAccepted {
            node_id,
            target_status,
        }),
    )
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_nodes))
        .route("/:node_id", get(get_node))
        .route("/:node_id/start", post(start_node))
        .route("/:node_id/stop", post(stop_node))
        .route("/:node_id/engine", post(reconfigure_engine))
}
