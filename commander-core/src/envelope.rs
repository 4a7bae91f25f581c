//! Message envelope protocol.
//!
//! Every piece of inter-node traffic travels as a [`MessageEnvelope`]. An
//! envelope is immutable once built; its `content_hash` is a SHA-256 digest
//! over sender, recipient, task id and payload, and is the deduplication key
//! in every store.

use crate::{new_id, EnvelopeId, RoleHierarchy, TaskId, Timestamp, ValidationError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Priority assigned when the builder is not given one.
pub const DEFAULT_PRIORITY: i32 = 2;

// ============================================================================
// MESSAGE TYPE
// ============================================================================

/// Kind of message carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Command,
    Response,
    Query,
    Event,
    Error,
    Heartbeat,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Command => "command",
            MessageType::Response => "response",
            MessageType::Query => "query",
            MessageType::Event => "event",
            MessageType::Error => "error",
            MessageType::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = MessageTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "command" => Ok(MessageType::Command),
            "response" => Ok(MessageType::Response),
            "query" => Ok(MessageType::Query),
            "event" => Ok(MessageType::Event),
            "error" => Ok(MessageType::Error),
            "heartbeat" => Ok(MessageType::Heartbeat),
            _ => Err(MessageTypeParseError(s.to_string())),
        }
    }
}

/// Error when parsing an invalid message type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTypeParseError(pub String);

impl fmt::Display for MessageTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid message type: {}", self.0)
    }
}

impl std::error::Error for MessageTypeParseError {}

// ============================================================================
// ENVELOPE
// ============================================================================

/// The atomic, immutable unit of inter-node communication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: EnvelopeId,
    pub created_at: Timestamp,
    pub sender_id: String,
    pub recipient_id: String,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    /// Lower is more authoritative; bounded by the role hierarchy.
    pub priority: i32,
    #[serde(default)]
    pub message_type: MessageType,
    /// Id of the envelope this one answers.
    #[serde(default)]
    pub correlation_id: Option<EnvelopeId>,
    /// Opaque payload, base64 on the wire.
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    pub content_hash: String,
}

impl MessageEnvelope {
    /// Start building an envelope.
    pub fn builder(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        message_type: MessageType,
    ) -> EnvelopeBuilder {
        EnvelopeBuilder {
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            message_type,
            task_id: None,
            priority: DEFAULT_PRIORITY,
            correlation_id: None,
            payload: Vec::new(),
        }
    }

    /// Command envelope with a JSON `{command, params}` payload.
    pub fn command(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        command: &str,
        params: serde_json::Value,
        priority: i32,
    ) -> Self {
        let payload = serde_json::json!({ "command": command, "params": params });
        Self::builder(sender_id, recipient_id, MessageType::Command)
            .priority(priority)
            .json_payload(&payload)
            .build()
    }

    /// Response to `original`: sender and recipient swap, the task is kept
    /// and `correlation_id` points back at the original.
    pub fn response_to(original: &MessageEnvelope, payload: Vec<u8>) -> Self {
        let mut builder = Self::builder(
            original.recipient_id.clone(),
            original.sender_id.clone(),
            MessageType::Response,
        )
        .priority(original.priority)
        .correlation_id(original.id)
        .payload(payload);
        if let Some(task_id) = &original.task_id {
            builder = builder.task_id(task_id.clone());
        }
        builder.build()
    }

    /// Heartbeat from a node. The payload carries the send time so successive
    /// heartbeats hash differently.
    pub fn heartbeat(node_id: impl Into<String>, recipient_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        let payload = serde_json::json!({ "node_id": node_id, "at": Utc::now() });
        Self::builder(node_id, recipient_id, MessageType::Heartbeat)
            .json_payload(&payload)
            .build()
    }

    /// Event notification with a JSON `{event, data}` payload.
    pub fn event(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        event: &str,
        data: serde_json::Value,
    ) -> Self {
        let payload = serde_json::json!({ "event": event, "data": data });
        Self::builder(sender_id, recipient_id, MessageType::Event)
            .json_payload(&payload)
            .build()
    }

    /// Recompute the content hash from the envelope's fields.
    pub fn compute_hash(&self) -> String {
        compute_content_hash(
            &self.sender_id,
            &self.recipient_id,
            self.task_id.as_deref(),
            &self.payload,
        )
    }

    /// Validate an envelope received from another node.
    ///
    /// Rejects missing required fields, a hash that does not match the
    /// content, and a priority outside the hierarchy bounds.
    pub fn validate(&self, roles: &RoleHierarchy) -> Result<(), ValidationError> {
        if self.id.is_nil() {
            return Err(missing("id"));
        }
        if self.sender_id.trim().is_empty() {
            return Err(missing("sender_id"));
        }
        if self.recipient_id.trim().is_empty() {
            return Err(missing("recipient_id"));
        }
        if matches!(&self.task_id, Some(t) if t.trim().is_empty()) {
            return Err(ValidationError::InvalidEnvelope {
                field: "task_id".to_string(),
                reason: "must not be blank when present".to_string(),
            });
        }
        if self.content_hash.is_empty() {
            return Err(missing("content_hash"));
        }
        let actual = self.compute_hash();
        if actual != self.content_hash {
            return Err(ValidationError::ContentHashMismatch {
                expected: self.content_hash.clone(),
                actual,
            });
        }
        roles.check_priority(self.priority)
    }

    /// Decode a JSON payload.
    pub fn json_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

fn missing(field: &str) -> ValidationError {
    ValidationError::InvalidEnvelope {
        field: field.to_string(),
        reason: "is required".to_string(),
    }
}

/// Builder for [`MessageEnvelope`]. `build` stamps id, timestamp and hash.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    sender_id: String,
    recipient_id: String,
    message_type: MessageType,
    task_id: Option<TaskId>,
    priority: i32,
    correlation_id: Option<EnvelopeId>,
    payload: Vec<u8>,
}

impl EnvelopeBuilder {
    pub fn task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn json_payload(mut self, value: &serde_json::Value) -> Self {
        self.payload = value.to_string().into_bytes();
        self
    }

    pub fn build(self) -> MessageEnvelope {
        let content_hash = compute_content_hash(
            &self.sender_id,
            &self.recipient_id,
            self.task_id.as_deref(),
            &self.payload,
        );
        MessageEnvelope {
            id: new_id(),
            created_at: Utc::now(),
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            task_id: self.task_id,
            priority: self.priority,
            message_type: self.message_type,
            correlation_id: self.correlation_id,
            payload: self.payload,
            content_hash,
        }
    }
}

/// Deterministic content hash over sender, recipient, task id and payload.
///
/// Each field is length-prefixed so that field boundaries cannot shift
/// (`"ab" + "c"` and `"a" + "bc"` hash differently). An absent task id and an
/// empty one are distinguished by a tag byte.
pub fn compute_content_hash(
    sender_id: &str,
    recipient_id: &str,
    task_id: Option<&str>,
    payload: &[u8],
) -> String {
    let mut hasher = Sha256::new();
    update_field(&mut hasher, sender_id.as_bytes());
    update_field(&mut hasher, recipient_id.as_bytes());
    match task_id {
        Some(task) => {
            hasher.update([1u8]);
            update_field(&mut hasher, task.as_bytes());
        }
        None => hasher.update([0u8]),
    }
    update_field(&mut hasher, payload);
    hex::encode(hasher.finalize())
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
