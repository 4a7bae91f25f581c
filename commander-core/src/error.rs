//! Error types for COMMANDER operations

use crate::{NodeId, NodeStatus};
use thiserror::Error;
use uuid::Uuid;

/// Envelope and configuration validation errors.
///
/// A value that fails validation is rejected and never stored.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid envelope: field {field} {reason}")]
    InvalidEnvelope { field: String, reason: String },

    #[error("Priority {priority} outside role hierarchy bounds [{min}, {max}]")]
    PriorityOutOfBounds { priority: i32, min: i32, max: i32 },

    #[error("Content hash mismatch: expected {expected}, got {actual}")]
    ContentHashMismatch { expected: String, actual: String },

    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// A write whose content hash is already stored.
///
/// Duplicates are idempotent no-ops; callers treat this as success.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Duplicate envelope with content hash {content_hash}")]
pub struct DuplicateError {
    pub content_hash: String,
}

/// Relay delivery errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Network hiccup or relay unavailable; the record stays in the outbox.
    #[error("Transient network error: {reason}")]
    Transient { reason: String },

    /// Retry budget exhausted; the record is retained for manual replay.
    #[error("Permanent delivery failure for batch {batch_id} after {attempts} attempts: {reason}")]
    Permanent {
        batch_id: Uuid,
        attempts: u32,
        reason: String,
    },

    /// The relay answered but refused the payload.
    #[error("Relay rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },
}

impl DeliveryError {
    /// Whether a retry could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Transient { .. })
    }
}

/// Node registry errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Node not registered: {node_id}")]
    UnknownNode { node_id: NodeId },

    #[error("Agent not registered: {agent_id}")]
    UnknownAgent { agent_id: String },

    #[error("Unknown role: {role}")]
    UnknownRole { role: String },

    #[error("Node {node_id} is already starting")]
    AlreadyStarting { node_id: NodeId },

    #[error("Invalid transition for node {node_id}: {from} -> {to}")]
    InvalidTransition {
        node_id: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("No eligible node for roles {roles:?}")]
    NoEligibleNode { roles: Vec<String> },

    #[error("Node {node_id} missed heartbeat for {elapsed_ms}ms (timeout {timeout_ms}ms)")]
    NodeTimeout {
        node_id: NodeId,
        elapsed_ms: i64,
        timeout_ms: i64,
    },

    #[error("Agent {agent_id} cannot run: node {node_id} is {status}")]
    AgentNodeNotReady {
        agent_id: String,
        node_id: NodeId,
        status: NodeStatus,
    },

    #[error("Task not defined: {task_id}")]
    UnknownTask { task_id: String },

    #[error("Task already defined: {task_id}")]
    DuplicateTask { task_id: String },

    #[error("Task {task_id} waits on unfinished dependencies {pending:?}")]
    TaskBlocked { task_id: String, pending: Vec<String> },

    #[error("Orchestrator role already held by {existing}, cannot assign to {candidate}")]
    OrchestratorConflict { existing: NodeId, candidate: NodeId },

    #[error("Registry lock poisoned")]
    LockPoisoned,
}

/// Engine process lifecycle errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Failed to spawn engine for node {node_id}: {reason}")]
    SpawnFailed { node_id: NodeId, reason: String },

    #[error("Engine for node {node_id} not ready after {timeout_ms}ms")]
    ReadyTimeout {
        node_id: NodeId,
        timeout_ms: u64,
        diagnostics: String,
    },

    #[error("Engine for node {node_id} exited with code {code:?}")]
    ProcessExited {
        node_id: NodeId,
        code: Option<i32>,
        diagnostics: String,
    },

    #[error("Failed to persist engine config for node {node_id}: {reason}")]
    ConfigPersistFailed { node_id: NodeId, reason: String },

    #[error("Failed to stop engine for node {node_id}: {reason}")]
    StopFailed { node_id: NodeId, reason: String },

    #[error("Lifecycle executor for node {node_id} is closed")]
    ExecutorClosed { node_id: NodeId },

    #[error("Node {node_id} runs its engine elsewhere; this process manages {local_node_id}")]
    NotLocal { node_id: NodeId, local_node_id: NodeId },
}

impl LifecycleError {
    /// Captured process output attached to the failure, if any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            LifecycleError::ReadyTimeout { diagnostics, .. }
            | LifecycleError::ProcessExited { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("LMDB error: {reason}")]
    Lmdb { reason: String },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Record not found: {key}")]
    NotFound { key: String },

    #[error("IO error at {path}: {reason}")]
    Io { path: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Failed to read {path}: {reason}")]
    Io { path: String, reason: String },
}

/// Master error type for all COMMANDER errors.
#[derive(Debug, Clone, Error)]
pub enum CommanderError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Duplicate(#[from] DuplicateError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for COMMANDER operations.
pub type CommanderResult<T> = Result<T, CommanderError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display_priority_bounds() {
        let err = ValidationError::PriorityOutOfBounds {
            priority: 9,
            min: 0,
            max: 2,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Priority 9"));
        assert!(msg.contains("[0, 2]"));
    }

    #[test]
    fn test_duplicate_error_display() {
        let err = DuplicateError {
            content_hash: "abc123".to_string(),
        };
        assert!(err.to_string().contains("abc123"));
    }

    #[test]
    fn test_delivery_error_retryable() {
        let transient = DeliveryError::Transient {
            reason: "connection refused".to_string(),
        };
        let permanent = DeliveryError::Permanent {
            batch_id: Uuid::nil(),
            attempts: 5,
            reason: "relay down".to_string(),
        };
        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert!(permanent.to_string().contains("after 5 attempts"));
    }

    #[test]
    fn test_registry_error_display_invalid_transition() {
        let err = RegistryError::InvalidTransition {
            node_id: "htpc".to_string(),
            from: NodeStatus::Unknown,
            to: NodeStatus::Ready,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("htpc"));
        assert!(msg.contains("unknown -> ready"));
    }

    #[test]
    fn test_lifecycle_error_diagnostics() {
        let err = LifecycleError::ReadyTimeout {
            node_id: "deck".to_string(),
            timeout_ms: 5000,
            diagnostics: "CUDA out of memory".to_string(),
        };
        assert_eq!(err.diagnostics(), Some("CUDA out of memory"));

        let err = LifecycleError::ExecutorClosed {
            node_id: "deck".to_string(),
        };
        assert_eq!(err.diagnostics(), None);
    }

    #[test]
    fn test_commander_error_from_variants() {
        let validation = CommanderError::from(ValidationError::RequiredFieldMissing {
            field: "sender_id".to_string(),
        });
        assert!(matches!(validation, CommanderError::Validation(_)));

        let duplicate = CommanderError::from(DuplicateError {
            content_hash: "h".to_string(),
        });
        assert!(matches!(duplicate, CommanderError::Duplicate(_)));

        let registry = CommanderError::from(RegistryError::LockPoisoned);
        assert!(matches!(registry, CommanderError::Registry(_)));

        let storage = CommanderError::from(StorageError::Lmdb {
            reason: "map full".to_string(),
        });
        assert!(matches!(storage, CommanderError::Storage(_)));

        let config = CommanderError::from(ConfigError::MissingRequired {
            field: "nodes".to_string(),
        });
        assert!(matches!(config, CommanderError::Config(_)));
    }
}
