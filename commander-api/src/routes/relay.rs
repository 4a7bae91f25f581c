//! Relay REST API Routes
//!
//! The relay side of the sync protocol. Nodes push here, single envelopes
//! on the write path and batches from the outbox uploader.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use commander_core::{EnvelopeQuery, MessageEnvelope, MessageType, RelayBatch};
use commander_storage::{ContextWindow, RelayInsert, RelayPage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{
    DEFAULT_CONTEXT_TOKENS, DEFAULT_QUERY_LIMIT, MAX_CONTEXT_TOKENS, MAX_QUERY_LIMIT,
};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextParams {
    pub max_tokens: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResponse {
    pub id: Uuid,
    pub content_hash: String,
}

/// Validate an inbound envelope against the current role hierarchy.
fn validate_inbound(state: &AppState, envelope: &MessageEnvelope) -> ApiResult<()> {
    let roles = state.registry.roles()?;
    envelope.validate(&roles)?;
    Ok(())
}

/// A heartbeat envelope keeps its sender alive in the registry.
pub(crate) fn note_heartbeat(state: &AppState, envelope: &MessageEnvelope) {
    if envelope.message_type != MessageType::Heartbeat {
        return;
    }
    if let Err(e) = state
        .registry
        .heartbeat(&envelope.sender_id, envelope.created_at.min(Utc::now()))
    {
        tracing::debug!(node_id = %envelope.sender_id, error = %e, "Heartbeat from unregistered sender");
    }
}

/// POST /relay/immediate - Store one envelope
pub async fn push_immediate(
    State(state): State<AppState>,
    Json(envelope): Json<MessageEnvelope>,
) -> ApiResult<impl IntoResponse> {
    let relay = state.require_relay()?;
    validate_inbound(&state, &envelope)?;
    note_heartbeat(&state, &envelope);

    match relay.insert(&envelope)? {
        RelayInsert::Stored => Ok((
            StatusCode::CREATED,
            Json(StoredResponse {
                id: envelope.id,
                content_hash: envelope.content_hash,
            }),
        )),
        RelayInsert::Duplicate => Err(ApiError::duplicate(&envelope.content_hash)),
    }
}

/// POST /relay/batch - Store a batch; a retried batch id acks without reinserting
pub async fn push_batch(
    State(state): State<AppState>,
    Json(batch): Json<RelayBatch>,
) -> ApiResult<impl IntoResponse> {
    let relay = state.require_relay()?;
    if batch.node_id.trim().is_empty() {
        return Err(ApiError::invalid_input("node_id must not be empty"));
    }
    let roles = state.registry.roles()?;
    for envelope in &batch.envelopes {
        envelope.validate(&roles)?;
    }

    let ack = relay.insert_batch(&batch)?;
    if !ack.replayed {
        for envelope in &batch.envelopes {
            note_heartbeat(&state, envelope);
        }
    }
    tracing::debug!(
        batch_id = %batch.batch_id,
        node_id = %batch.node_id,
        accepted = ack.accepted,
        duplicates = ack.duplicates,
        replayed = ack.replayed,
        "Relay batch stored"
    );
    Ok((StatusCode::OK, Json(ack)))
}

/// GET /relay/query - Envelopes in creation order, paginated
pub async fn query(
    State(state): State<AppState>,
    Query(mut query): Query<EnvelopeQuery>,
) -> ApiResult<Json<RelayPage>> {
    let relay = state.require_relay()?;
    let limit = query.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
    if limit == 0 || limit > MAX_QUERY_LIMIT {
        return Err(ApiError::new(
            crate::error::ErrorCode::InvalidRange,
            format!("limit must be between 1 and {MAX_QUERY_LIMIT}"),
        ));
    }
    if let (Some(since), Some(until)) = (query.since, query.until) {
        if since > until {
            return Err(ApiError::invalid_input("since must not be after until"));
        }
    }
    query.limit = Some(limit);
    Ok(Json(relay.query(&query)?))
}

/// GET /relay/envelopes/:content_hash - Fetch one envelope
pub async fn get_envelope(
    State(state): State<AppState>,
    Path(content_hash): Path<String>,
) -> ApiResult<Json<MessageEnvelope>> {
    let relay = state.require_relay()?;
    relay
        .get(&content_hash)?
        .map(Json)
        .ok_or_else(|| ApiError::message_not_found(&content_hash))
}

/// GET /relay/context/:task_id - A task's newest envelopes as text within a token budget
pub async fn recent_context(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(params): Query<ContextParams>,
) -> ApiResult<Json<ContextWindow>> {
    let relay = state.require_relay()?;
    let max_tokens = params.max_tokens.unwrap_or(DEFAULT_CONTEXT_TOKENS);
    if max_tokens == 0 || max_tokens > MAX_CONTEXT_TOKENS {
        return Err(ApiError::new(
            crate::error::ErrorCode::InvalidRange,
            format!("max_tokens must be between 1 and {MAX_CONTEXT_TOKENS}"),
        ));
    }
    Ok(Json(relay.recent_context(&task_id, max_tokens)?))
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/immediate", post(push_immediate))
        .route("/batch", post(push_batch))
        .route("/query", get(query))
        .route("/envelopes/:content_hash", get(get_envelope))
        .route("/context/:task_id", get(recent_context))
}
