//! Message REST API Routes
//!
//! Local writes through the sync engine. A write returns as soon as the
//! envelope is durable in the local store; relay delivery runs behind it.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use commander_core::{EnvelopeId, EnvelopeQuery, MessageEnvelope, MessageType, NodeId, TaskId};
use commander_storage::WriteOutcome;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_QUERY_LIMIT, MAX_QUERY_LIMIT};
use crate::error::{ApiError, ApiResult};
use crate::routes::relay::note_heartbeat;
use crate::state::AppState;
use crate::telemetry::metrics::metrics;

/// Request to send a message. The server stamps id, timestamp and hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    /// Defaults to the local node.
    #[serde(default)]
    pub sender_id: Option<NodeId>,
    pub recipient_id: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub correlation_id: Option<EnvelopeId>,
}

impl SendMessageRequest {
    fn into_envelope(self, default_sender: &str) -> MessageEnvelope {
        let sender = self.sender_id.unwrap_or_else(|| default_sender.to_string());
        let mut builder = MessageEnvelope::builder(sender, self.recipient_id, self.message_type)
            .json_payload(&self.payload);
        if let Some(task_id) = self.task_id {
            builder = builder.task_id(task_id);
        }
        if let Some(priority) = self.priority {
            builder = builder.priority(priority);
        }
        if let Some(id) = self.correlation_id {
            builder = builder.correlation_id(id);
        }
        builder.build()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub id: EnvelopeId,
    pub content_hash: String,
    /// False when an identical envelope was already stored.
    pub stored: bool,
}

/// POST /messages - Write an envelope locally and start relay delivery
pub async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let sync = state.require_sync()?;
    let envelope = req.into_envelope(&state.config.local_node_id);
    envelope.validate(&state.registry.roles()?)?;

    let id = envelope.id;
    note_heartbeat(&state, &envelope);
    let outcome = sync.write(envelope)?;

    let (status, content_hash, stored, label) = match outcome {
        WriteOutcome::Stored { content_hash } => (StatusCode::CREATED, content_hash, true, "stored"),
        WriteOutcome::Duplicate { content_hash } => (StatusCode::OK, content_hash, false, "duplicate"),
    };
    if let Some(m) = metrics() {
        m.record_envelope_write(label);
    }
    tracing::debug!(content_hash = %content_hash, outcome = label, "Message written");

    Ok((
        status,
        Json(SendMessageResponse {
            id,
            content_hash,
            stored,
        }),
    ))
}

/// GET /messages - Query envelopes, local first
pub async fn list_messages(
    State(state): State<AppState>,
    Query(mut query): Query<EnvelopeQuery>,
) -> ApiResult<Json<Vec<MessageEnvelope>>> {
    let sync = state.require_sync()?;
    let limit = query.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
    if limit == 0 || limit > MAX_QUERY_LIMIT {
        return Err(ApiError::invalid_input(format!(
            "limit must be between 1 and {MAX_QUERY_LIMIT}"
        )));
    }
    query.limit = Some(limit);
    Ok(Json(sync.query(&query).await?))
}

/// GET /messages/:content_hash - Local store first, then the relay
pub async fn get_message(
    State(state): State<AppState>,
    Path(content_hash): Path<String>,
) -> ApiResult<Json<MessageEnvelope>> {
    let sync = state.require_sync()?;
    sync.read(&content_hash)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::message_not_found(&content_hash))
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/", post(send_message).get(list_messages))
        .route("/:content_hash", get(get_message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use commander_test_utils::generators::{arb_node_id, arb_task_id};
    use proptest::prelude::*;

    #[test]
    fn test_request_defaults_sender_to_local_node() {
        let req: SendMessageRequest = serde_json::from_value(serde_json::json!({
            "recipient_id": "htpc",
            "task_id": "t-1",
            "payload": {"command": "summarize"}
        }))
        .unwrap();
        let envelope = req.into_envelope("main");
        assert_eq!(envelope.sender_id, "main");
        assert_eq!(envelope.recipient_id, "htpc");
        assert_eq!(envelope.message_type, MessageType::Command);
        assert_eq!(envelope.content_hash, envelope.compute_hash());
    }

    proptest! {
        #[test]
        fn prop_same_request_hashes_identically(
            sender in arb_node_id(),
            recipient in arb_node_id(),
            task_id in arb_task_id(),
            n in any::<u32>(),
        ) {
            let body = serde_json::json!({
                "sender_id": sender,
                "recipient_id": recipient,
                "task_id": task_id,
                "payload": {"n": n}
            });
            let a: SendMessageRequest = serde_json::from_value(body.clone()).unwrap();
            let b: SendMessageRequest = serde_json::from_value(body).unwrap();
            let (a, b) = (a.into_envelope("main"), b.into_envelope("main"));
            prop_assert_ne!(a.id, b.id);
            prop_assert_eq!(a.content_hash, b.content_hash);
        }
    }
}
