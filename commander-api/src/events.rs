//! Stream Frame Types
//!
//! Frames pushed to `/ws` subscribers by the state broadcaster, and the
//! messages a client may send back.

use commander_core::{Agent, AgentId, MessageEnvelope, Node, NodeId, Timestamp};
use commander_storage::OutboxStats;
use serde::{Deserialize, Serialize};

/// Frame discriminator, serialized as the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    StateUpdate,
    NewMessages,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::StateUpdate => "state_update",
            FrameKind::NewMessages => "new_messages",
        }
    }
}

/// Node and agent state, either a full snapshot or a diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateData {
    /// True for a snapshot; false for a diff against the previous frame.
    pub full: bool,
    /// Every node (snapshot) or the nodes that changed (diff).
    pub nodes: Vec<Node>,
    pub agents: Vec<Agent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_nodes: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_agents: Vec<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox: Option<OutboxStats>,
}

/// Envelopes written since the previous frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesData {
    pub full: bool,
    pub envelopes: Vec<MessageEnvelope>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameData {
    State(StateData),
    Messages(MessagesData),
}

/// One frame of the state stream.
///
/// `sequence` increases by one per emitted diff frame across all subscribers.
/// Snapshot frames repeat the sequence of the last diff they include.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub sequence: u64,
    pub timestamp: Timestamp,
    pub data: FrameData,
}

impl StreamFrame {
    pub fn state(sequence: u64, timestamp: Timestamp, data: StateData) -> Self {
        Self {
            kind: FrameKind::StateUpdate,
            sequence,
            timestamp,
            data: FrameData::State(data),
        }
    }

    pub fn messages(sequence: u64, timestamp: Timestamp, data: MessagesData) -> Self {
        Self {
            kind: FrameKind::NewMessages,
            sequence,
            timestamp,
            data: FrameData::Messages(data),
        }
    }

    pub fn is_full(&self) -> bool {
        match &self.data {
            FrameData::State(s) => s.full,
            FrameData::Messages(m) => m.full,
        }
    }
}

/// Messages a stream client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask for a fresh snapshot.
    Resync,
    Ping,
}

/// Server notices outside the frame sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerNotice {
    Pong,
    /// The subscriber fell behind and is being disconnected.
    Lagged { skipped: u64 },
    Error { message: String },
}
