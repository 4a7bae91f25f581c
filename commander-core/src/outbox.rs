//! Outbox records and relay batch wire types.

use crate::{MessageEnvelope, NodeId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Delivery status of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    #[default]
    Pending,
    Sending,
    /// Transient: an acked record is deleted in the same transaction.
    Acked,
    /// Rejected by the relay until the retry budget ran out; retained for
    /// manual replay.
    Failed,
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sending => "sending",
            OutboxStatus::Acked => "acked",
            OutboxStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A not-yet-acknowledged remote write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Batch the record was last attempted in.
    pub batch_id: Uuid,
    pub content_hash: String,
    pub node_id: NodeId,
    /// The envelope to deliver.
    pub payload: MessageEnvelope,
    pub status: OutboxStatus,
    /// Relay rejections so far; counts toward the retry budget.
    pub retry_count: u32,
    /// Every failed attempt, rejections and outages alike. Drives backoff.
    pub attempts: u32,
    pub created_at: Timestamp,
    pub last_attempt: Option<Timestamp>,
    /// Earliest time the uploader may try again.
    pub next_attempt_at: Option<Timestamp>,
    pub last_error: Option<String>,
}

impl OutboxRecord {
    pub fn pending(node_id: impl Into<String>, envelope: MessageEnvelope) -> Self {
        Self {
            batch_id: Uuid::nil(),
            content_hash: envelope.content_hash.clone(),
            node_id: node_id.into(),
            created_at: envelope.created_at,
            payload: envelope,
            status: OutboxStatus::Pending,
            retry_count: 0,
            attempts: 0,
            last_attempt: None,
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Whether the uploader may attempt this record at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status == OutboxStatus::Pending && self.next_attempt_at.map_or(true, |t| t <= now)
    }

    /// Reset a failed record for another round of attempts.
    pub fn reset_for_replay(&mut self) {
        self.status = OutboxStatus::Pending;
        self.retry_count = 0;
        self.attempts = 0;
        self.next_attempt_at = Some(Utc::now());
        self.last_error = None;
    }
}

/// Body of `POST /relay/batch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayBatch {
    pub batch_id: Uuid,
    pub node_id: NodeId,
    pub envelopes: Vec<MessageEnvelope>,
}

/// Acknowledgement of a relay batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAck {
    pub batch_id: Uuid,
    /// Envelopes newly stored.
    pub accepted: usize,
    /// Envelopes already present (idempotent no-ops).
    pub duplicates: usize,
    /// True when the batch id itself had already been acked.
    #[serde(default)]
    pub replayed: bool,
}

/// Filter for envelope queries, local or relay side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeQuery {
    /// Sender node.
    pub node_id: Option<NodeId>,
    pub task_id: Option<String>,
    pub since: Option<Timestamp>,
    pub until: Option<Timestamp>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

impl EnvelopeQuery {
    pub fn matches(&self, envelope: &MessageEnvelope) -> bool {
        if let Some(node) = &self.node_id {
            if &envelope.sender_id != node {
                return false;
            }
        }
        if let Some(task) = &self.task_id {
            if envelope.task_id.as_ref() != Some(task) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if envelope.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if envelope.created_at > until {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageType;
    use chrono::Duration;

    #[test]
    fn test_pending_record_is_due() {
        let env = MessageEnvelope::builder("main", "relay", MessageType::Event).build();
        let mut record = OutboxRecord::pending("main", env);
        let now = Utc::now();
        assert!(record.is_due(now));

        record.next_attempt_at = Some(now + Duration::seconds(30));
        assert!(!record.is_due(now));

        record.status = OutboxStatus::Failed;
        assert!(!record.is_due(now + Duration::seconds(60)));
    }

    #[test]
    fn test_query_matches_filters() {
        let env = MessageEnvelope::builder("htpc", "main", MessageType::Event)
            .task_id("t-9")
            .build();
        let query = EnvelopeQuery {
            node_id: Some("htpc".to_string()),
            task_id: Some("t-9".to_string()),
            ..Default::default()
        };
        assert!(query.matches(&env));

        let other = EnvelopeQuery {
            node_id: Some("deck".to_string()),
            ..Default::default()
        };
        assert!(!other.matches(&env));

        let later = EnvelopeQuery {
            since: Some(env.created_at + Duration::seconds(1)),
            ..Default::default()
        };
        assert!(!later.matches(&env));
    }
}
