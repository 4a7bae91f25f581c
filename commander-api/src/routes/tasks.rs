//! Task REST API Routes
//!
//! Dispatching a task sends one command envelope to each assigned node,
//! written locally first like any other message.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use commander_agents::TaskBoard;
use commander_core::{MessageEnvelope, MessageType, NodeId, TaskDefinition, TaskId};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefineTaskRequest {
    pub id: TaskId,
    /// role name -> node assigned to it
    #[serde(default)]
    pub role_assignments: BTreeMap<String, NodeId>,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub task: TaskDefinition,
    /// Content hashes of the command envelopes written for the task.
    pub commands: Vec<String>,
}

/// GET /tasks - All tasks in id order
pub async fn list_tasks(State(tasks): State<Arc<TaskBoard>>) -> ApiResult<Json<Vec<TaskDefinition>>> {
    Ok(Json(tasks.list()?))
}

/// GET /tasks/ready - DEFINED tasks whose dependencies completed
pub async fn ready_tasks(
    State(tasks): State<Arc<TaskBoard>>,
) -> ApiResult<Json<Vec<TaskDefinition>>> {
    Ok(Json(tasks.ready()?))
}

/// POST /tasks - Define a task
pub async fn define_task(
    State(state): State<AppState>,
    Json(req): Json<DefineTaskRequest>,
) -> ApiResult<(StatusCode, Json<TaskDefinition>)> {
    let id = req.id.trim();
    if id.is_empty() {
        return Err(ApiError::invalid_input("id must not be empty"));
    }
    let mut task = TaskDefinition::new(id);
    task.role_assignments = req.role_assignments;
    task.dependencies = req.dependencies;
    let task = state.tasks.define(task, &state.registry)?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// GET /tasks/:task_id
pub async fn get_task(
    State(tasks): State<Arc<TaskBoard>>,
    Path(task_id): Path<TaskId>,
) -> ApiResult<Json<TaskDefinition>> {
    Ok(Json(tasks.get(&task_id)?))
}

/// POST /tasks/:task_id/dispatch - Dispatch and send commands to assigned nodes
pub async fn dispatch_task(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
) -> ApiResult<Json<DispatchResponse>> {
    let sync = state.require_sync()?;
    let roles = state.registry.roles()?;
    let task = state.tasks.dispatch(&task_id)?;

    let mut commands = Vec::with_capacity(task.role_assignments.len());
    for (role, node_id) in &task.role_assignments {
        let envelope = MessageEnvelope::builder(
            state.config.local_node_id.as_str(),
            node_id.as_str(),
            MessageType::Command,
        )
        .task_id(task.id.clone())
        .priority(roles.rank(role).unwrap_or_default())
        .json_payload(&serde_json::json!({ "command": "run_task", "role": role }))
        .build();
        commands.push(sync.write(envelope)?.content_hash().to_string());
    }
    tracing::info!(task_id = %task.id, commands = commands.len(), "Task commands sent");
    Ok(Json(DispatchResponse { task, commands }))
}

/// POST /tasks/:task_id/complete
pub async fn complete_task(
    State(tasks): State<Arc<TaskBoard>>,
    Path(task_id): Path<TaskId>,
) -> ApiResult<Json<TaskDefinition>> {
    Ok(Json(tasks.complete(&task_id)?))
}

/// POST /tasks/:task_id/fail
pub async fn fail_task(
    State(tasks): State<Arc<TaskBoard>>,
    Path(task_id): Path<TaskId>,
) -> ApiResult<Json<TaskDefinition>> {
    Ok(Json(tasks.fail(&task_id)?))
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_tasks).post(define_task))
        .route("/ready", get(ready_tasks))
        .route("/:task_id", get(get_task))
        .route("/:task_id/dispatch", post(dispatch_task))
        .route("/:task_id/complete", post(complete_task))
        .route("/:task_id/fail", post(fail_task))
}
