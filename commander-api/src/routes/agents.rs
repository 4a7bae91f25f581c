//! Agent REST API Routes
//!
//! Agents run only while their node is READY. Start, restart and a config
//! change on a running agent answer 409 otherwise.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use commander_agents::{NodeRegistry, RegistryEvent};
use commander_core::{Agent, AgentId, AgentParams, NodeId};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAgentRequest {
    pub id: AgentId,
    pub node_id: NodeId,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignRoleRequest {
    pub role: String,
}

/// GET /agents - All agents, most authoritative role first
pub async fn list_agents(
    State(registry): State<Arc<NodeRegistry>>,
) -> ApiResult<Json<Vec<Agent>>> {
    Ok(Json(registry.list_agents()?))
}

/// POST /agents - Create or replace an agent on a registered node
pub async fn register_agent(
    State(registry): State<Arc<NodeRegistry>>,
    Json(req): Json<RegisterAgentRequest>,
) -> ApiResult<(StatusCode, Json<Agent>)> {
    if req.id.trim().is_empty() {
        return Err(ApiError::invalid_input("id must not be empty"));
    }
    let event = registry.register_agent(req.id.trim(), &req.node_id, req.role.trim())?;
    Ok((StatusCode::CREATED, Json(updated_agent(event)?)))
}

/// PUT /agents/:agent_id/role - Reassign an agent to another role
pub async fn assign_role(
    State(registry): State<Arc<NodeRegistry>>,
    Path(agent_id): Path<AgentId>,
    Json(req): Json<AssignRoleRequest>,
) -> ApiResult<Json<Agent>> {
    let role = req.role.trim();
    if role.is_empty() {
        return Err(ApiError::invalid_input("role must not be empty"));
    }
    let agent = updated_agent(registry.set_agent_role(&agent_id, role)?)?;
    tracing::info!(agent_id = %agent.id, role = %agent.role, rank = agent.role_rank, "Agent role reassigned");
    Ok(Json(agent))
}

/// GET /agents/:agent_id - One agent
pub async fn get_agent(
    State(registry): State<Arc<NodeRegistry>>,
    Path(agent_id): Path<AgentId>,
) -> ApiResult<Json<Agent>> {
    Ok(Json(registry.get_agent(&agent_id)?))
}

/// POST /agents/:agent_id/start - Run a stopped agent again
pub async fn start_agent(
    State(registry): State<Arc<NodeRegistry>>,
    Path(agent_id): Path<AgentId>,
) -> ApiResult<Json<Agent>> {
    Ok(Json(updated_agent(registry.start_agent(&agent_id)?)?))
}

/// POST /agents/:agent_id/stop - Stop an agent and drop its task
pub async fn stop_agent(
    State(registry): State<Arc<NodeRegistry>>,
    Path(agent_id): Path<AgentId>,
) -> ApiResult<Json<Agent>> {
    Ok(Json(updated_agent(registry.stop_agent(&agent_id)?)?))
}

/// POST /agents/:agent_id/restart - Stop and start in one step
pub async fn restart_agent(
    State(registry): State<Arc<NodeRegistry>>,
    Path(agent_id): Path<AgentId>,
) -> ApiResult<Json<Agent>> {
    Ok(Json(updated_agent(registry.restart_agent(&agent_id)?)?))
}

/// GET /agents/:agent_id/config - Current agent parameters
pub async fn get_config(
    State(registry): State<Arc<NodeRegistry>>,
    Path(agent_id): Path<AgentId>,
) -> ApiResult<Json<AgentParams>> {
    Ok(Json(registry.get_agent(&agent_id)?.params))
}

/// PUT /agents/:agent_id/config - Merge parameters; a running agent restarts
pub async fn update_config(
    State(registry): State<Arc<NodeRegistry>>,
    Path(agent_id): Path<AgentId>,
    Json(params): Json<AgentParams>,
) -> ApiResult<Json<Agent>> {
    if params.keys().any(|k| k.trim().is_empty()) {
        return Err(ApiError::invalid_input("parameter names must not be empty"));
    }
    let agent = updated_agent(registry.configure_agent(&agent_id, params)?)?;
    tracing::info!(agent_id = %agent.id, restarts = agent.restarts, "Agent config updated");
    Ok(Json(agent))
}

fn updated_agent(event: RegistryEvent) -> ApiResult<Agent> {
    match event {
        RegistryEvent::AgentUpdated { agent } => Ok(agent),
        other => Err(ApiError::internal_error(format!(
            "Unexpected registry event: {:?}",
            other
        ))),
    }
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_agents).post(register_agent))
        .route("/:agent_id", get(get_agent))
        .route("/:agent_id/role", put(assign_role))
        .route("/:agent_id/start", post(start_agent))
        .route("/:agent_id/stop", post(stop_agent))
        .route("/:agent_id/restart", post(restart_agent))
        .route("/:agent_id/config", get(get_config).put(update_config))
}
