//! Error Types for COMMANDER API
//!
//! This module defines error handling for the API layer, including:
//! - ApiError struct for structured error responses
//! - ErrorCode enum for categorizing errors
//! - IntoResponse implementation for Axum HTTP responses
//! - Mapping from the core error taxonomy
//!
//! All errors are serialized as JSON with appropriate HTTP status codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use commander_core::{
    CommanderError, ConfigError, DeliveryError, LifecycleError, RegistryError, StorageError,
    ValidationError,
};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
///
/// Each error code maps to a specific HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Validation Errors (400)
    // ========================================================================
    /// Request validation failed
    ValidationFailed,

    /// Request contains invalid input data
    InvalidInput,

    /// Required field is missing from request
    MissingField,

    /// Field value is out of valid range
    InvalidRange,

    // ========================================================================
    // Not Found Errors (404)
    // ========================================================================
    NodeNotFound,
    AgentNotFound,
    MessageNotFound,
    EntityNotFound,

    // ========================================================================
    // Conflict Errors (409)
    // ========================================================================
    /// Content hash already stored
    Duplicate,

    /// Operation conflicts with current node state
    StateConflict,

    // ========================================================================
    // Server Errors (500, 503, 504)
    // ========================================================================
    /// No READY node can take the request
    NoEligibleNode,

    /// Relay could not be reached; the write is queued
    RelayUnavailable,

    ServiceUnavailable,

    Timeout,

    StorageError,

    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::ValidationFailed
            | ErrorCode::InvalidInput
            | ErrorCode::MissingField
            | ErrorCode::InvalidRange => StatusCode::BAD_REQUEST,

            ErrorCode::NodeNotFound
            | ErrorCode::AgentNotFound
            | ErrorCode::MessageNotFound
            | ErrorCode::EntityNotFound => StatusCode::NOT_FOUND,

            ErrorCode::Duplicate | ErrorCode::StateConflict => StatusCode::CONFLICT,

            ErrorCode::NoEligibleNode
            | ErrorCode::RelayUnavailable
            | ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,

            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,

            ErrorCode::StorageError | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::ValidationFailed => "Request validation failed",
            ErrorCode::InvalidInput => "Invalid input data",
            ErrorCode::MissingField => "Required field is missing",
            ErrorCode::InvalidRange => "Value is out of valid range",
            ErrorCode::NodeNotFound => "Node not found",
            ErrorCode::AgentNotFound => "Agent not found",
            ErrorCode::MessageNotFound => "Message not found",
            ErrorCode::EntityNotFound => "Entity not found",
            ErrorCode::Duplicate => "Envelope already stored",
            ErrorCode::StateConflict => "Operation conflicts with current state",
            ErrorCode::NoEligibleNode => "No eligible node available",
            ErrorCode::RelayUnavailable => "Relay unavailable",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
            ErrorCode::Timeout => "Operation timed out",
            ErrorCode::StorageError => "Storage operation failed",
            ErrorCode::InternalError => "Internal server error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error response for API operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code categorizing the error
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Create a new API error with the given code, using the default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn node_not_found(node_id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::NodeNotFound, format!("Node {} not found", node_id))
    }

    pub fn agent_not_found(agent_id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::AgentNotFound, format!("Agent {} not found", agent_id))
    }

    pub fn message_not_found(content_hash: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::MessageNotFound,
            format!("Message {} not found", content_hash),
        )
    }

    pub fn duplicate(content_hash: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::Duplicate,
            format!("Envelope {} already stored", content_hash),
        )
    }

    pub fn state_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StateConflict, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(self)).into_response()
    }
}

// ============================================================================
// CONVERSIONS FROM CORE ERRORS
// ============================================================================

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        let code = match &err {
            ValidationError::RequiredFieldMissing { .. } => ErrorCode::MissingField,
            ValidationError::PriorityOutOfBounds { .. } => ErrorCode::InvalidRange,
            _ => ErrorCode::ValidationFailed,
        };
        ApiError::new(code, err.to_string())
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match &err {
            RegistryError::UnknownNode { node_id } => ApiError::node_not_found(node_id),
            RegistryError::UnknownAgent { agent_id } => ApiError::agent_not_found(agent_id),
            RegistryError::UnknownRole { .. } => {
                ApiError::new(ErrorCode::ValidationFailed, err.to_string())
            }
            RegistryError::UnknownTask { .. } => {
                ApiError::new(ErrorCode::EntityNotFound, err.to_string())
            }
            RegistryError::AlreadyStarting { .. }
            | RegistryError::InvalidTransition { .. }
            | RegistryError::OrchestratorConflict { .. }
            | RegistryError::AgentNodeNotReady { .. }
            | RegistryError::DuplicateTask { .. } => ApiError::state_conflict(err.to_string()),
            RegistryError::TaskBlocked { pending, .. } => ApiError::state_conflict(err.to_string())
                .with_details(serde_json::json!({ "pending": pending })),
            RegistryError::NoEligibleNode { roles } => {
                ApiError::new(ErrorCode::NoEligibleNode, err.to_string())
                    .with_details(serde_json::json!({ "roles": roles }))
            }
            RegistryError::NodeTimeout { .. } => ApiError::new(ErrorCode::Timeout, err.to_string()),
            RegistryError::LockPoisoned => {
                tracing::error!("Registry lock poisoned");
                ApiError::internal_error("Registry unavailable")
            }
        }
    }
}

impl From<DeliveryError> for ApiError {
    fn from(err: DeliveryError) -> Self {
        match &err {
            DeliveryError::Transient { .. } => {
                ApiError::new(ErrorCode::RelayUnavailable, err.to_string())
            }
            DeliveryError::Permanent { batch_id, attempts, .. } => {
                ApiError::new(ErrorCode::RelayUnavailable, err.to_string()).with_details(
                    serde_json::json!({ "batch_id": batch_id, "attempts": attempts }),
                )
            }
            DeliveryError::Rejected { status, .. } if *status == 409 => {
                ApiError::new(ErrorCode::Duplicate, err.to_string())
            }
            DeliveryError::Rejected { status, .. } if (400..500).contains(status) => {
                ApiError::invalid_input(err.to_string())
            }
            DeliveryError::Rejected { .. } => {
                ApiError::new(ErrorCode::RelayUnavailable, err.to_string())
            }
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        match &err {
            LifecycleError::ExecutorClosed { .. } => ApiError::service_unavailable(err.to_string()),
            LifecycleError::ReadyTimeout { .. } => ApiError::new(ErrorCode::Timeout, err.to_string()),
            LifecycleError::NotLocal { local_node_id, .. } => {
                ApiError::new(ErrorCode::StateConflict, err.to_string())
                    .with_details(serde_json::json!({ "local_node_id": local_node_id }))
            }
            _ => ApiError::internal_error(err.to_string()),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        tracing::error!(error = %err, "Storage error");
        match err {
            StorageError::NotFound { key } => {
                ApiError::new(ErrorCode::EntityNotFound, format!("{} not found", key))
            }
            _ => ApiError::from_code(ErrorCode::StorageError),
        }
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        ApiError::new(ErrorCode::ValidationFailed, err.to_string())
    }
}

impl From<CommanderError> for ApiError {
    fn from(err: CommanderError) -> Self {
        match err {
            CommanderError::Validation(e) => e.into(),
            CommanderError::Duplicate(e) => ApiError::duplicate(e.content_hash),
            CommanderError::Delivery(e) => e.into(),
            CommanderError::Registry(e) => e.into(),
            CommanderError::Lifecycle(e) => e.into(),
            CommanderError::Storage(e) => e.into(),
            CommanderError::Config(e) => e.into(),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::invalid_input(format!("Invalid JSON: {}", err))
    }
}

// ============================================================================
// RESULT TYPE ALIAS
// ============================================================================

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_mapping() {
        assert_eq!(ErrorCode::ValidationFailed.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::Duplicate.status_code(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::NodeNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::StateConflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::NoEligibleNode.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ErrorCode::RelayUnavailable.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ErrorCode::InternalError.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_duplicate_serializes_as_screaming_snake() {
        let json = serde_json::to_value(ApiError::duplicate("abc")).expect("serialize");
        assert_eq!(json["code"], "DUPLICATE");
        assert!(json.get("details").is_none());
    }

    #[test]
    fn test_registry_errors_map_to_http() {
        let unknown: ApiError = RegistryError::UnknownNode {
            node_id: "ghost".to_string(),
        }
        .into();
        assert_eq!(unknown.status_code(), StatusCode::NOT_FOUND);

        let starting: ApiError = CommanderError::from(RegistryError::AlreadyStarting {
            node_id: "htpc".to_string(),
        })
        .into();
        assert_eq!(starting.code, ErrorCode::StateConflict);

        let none: ApiError = RegistryError::NoEligibleNode {
            roles: vec!["worker".to_string()],
        }
        .into();
        assert_eq!(none.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(none.details.is_some());
    }

    #[test]
    fn test_remote_node_lifecycle_is_conflict() {
        let err: ApiError = CommanderError::from(LifecycleError::NotLocal {
            node_id: "htpc".to_string(),
            local_node_id: "main".to_string(),
        })
        .into();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.details, Some(serde_json::json!({ "local_node_id": "main" })));
    }

    #[test]
    fn test_transient_delivery_is_503() {
        let err: ApiError = CommanderError::from(DeliveryError::Transient {
            reason: "connection refused".to_string(),
        })
        .into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
