//! Recent task context.
//!
//! Renders the newest envelopes of a task as prompt text that fits an
//! approximate token budget. Tokens are estimated at four characters each;
//! the window keeps the most recent lines that fit and lists them oldest
//! first.

use commander_core::{EnvelopeQuery, MessageEnvelope, StorageError, TaskId};
use serde::{Deserialize, Serialize};

use crate::relay_store::RelayStore;

/// Characters per token in the budget estimate.
pub const CHARS_PER_TOKEN: usize = 4;

/// Newest envelopes of a task considered for a window.
const CONTEXT_SCAN_LIMIT: usize = 1000;

/// A task's recent conversation, bounded by a token budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextWindow {
    pub task_id: TaskId,
    pub max_tokens: usize,
    pub text: String,
    /// Envelopes rendered into `text`.
    pub included: usize,
    /// Older envelopes left out to stay within budget.
    pub omitted: usize,
    pub approx_tokens: usize,
}

/// One context line: `[time] sender -> recipient (type): payload`.
pub fn context_line(envelope: &MessageEnvelope) -> String {
    format!(
        "[{}] {} -> {} ({}): {}\n",
        envelope.created_at.to_rfc3339(),
        envelope.sender_id,
        envelope.recipient_id,
        envelope.message_type,
        payload_text(&envelope.payload)
    )
}

fn payload_text(payload: &[u8]) -> String {
    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(serde_json::Value::String(text)) => text,
        Ok(value) => value.to_string(),
        Err(_) => match std::str::from_utf8(payload) {
            Ok(text) => text.to_string(),
            Err(_) => format!("<{} bytes>", payload.len()),
        },
    }
}

/// Build a window from envelopes in creation order.
pub fn build_context(
    task_id: &str,
    envelopes: &[MessageEnvelope],
    max_tokens: usize,
) -> ContextWindow {
    let budget = max_tokens.saturating_mul(CHARS_PER_TOKEN);
    let mut used = 0usize;
    let mut lines = Vec::new();
    for envelope in envelopes.iter().rev() {
        let line = context_line(envelope);
        let len = line.chars().count();
        if used + len > budget {
            break;
        }
        used += len;
        lines.push(line);
    }
    lines.reverse();

    ContextWindow {
        task_id: task_id.to_string(),
        max_tokens,
        included: lines.len(),
        omitted: envelopes.len() - lines.len(),
        approx_tokens: used.div_ceil(CHARS_PER_TOKEN),
        text: lines.concat(),
    }
}

impl RelayStore {
    /// Newest envelopes of `task_id` as text within `max_tokens`.
    pub fn recent_context(
        &self,
        task_id: &str,
        max_tokens: usize,
    ) -> Result<ContextWindow, StorageError> {
        let page = self.query(&EnvelopeQuery {
            task_id: Some(task_id.to_string()),
            ..Default::default()
        })?;
        let start = page.envelopes.len().saturating_sub(CONTEXT_SCAN_LIMIT);
        let window = build_context(task_id, &page.envelopes[start..], max_tokens);
        tracing::debug!(
            task_id = %task_id,
            included = window.included,
            omitted = window.omitted + start,
            approx_tokens = window.approx_tokens,
            "Context window built"
        );
        Ok(ContextWindow {
            omitted: window.omitted + start,
            ..window
        })
    }
}
