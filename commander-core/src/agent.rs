//! Agent records.

use crate::{AgentId, NodeId, TaskId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Free-form agent parameters (model overrides, sampling settings).
pub type AgentParams = BTreeMap<String, serde_json::Value>;

/// Status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Busy,
    Error,
    Stopped,
}

impl AgentStatus {
    /// Idle and busy agents are running; stopped and failed ones are not.
    pub fn is_running(&self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Busy)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Error => "error",
            AgentStatus::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// A role-bound logical worker owned by exactly one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub node_id: NodeId,
    pub role: String,
    /// Rank of `role` in the hierarchy; lower is more authoritative.
    pub role_rank: i32,
    pub status: AgentStatus,
    pub current_task: Option<TaskId>,
    #[serde(default)]
    pub params: AgentParams,
    /// When the agent last (re)started; `None` while stopped.
    pub started_at: Option<Timestamp>,
    #[serde(default)]
    pub restarts: u32,
}

impl Agent {
    pub fn new(id: impl Into<String>, node_id: impl Into<String>, role: impl Into<String>, role_rank: i32) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
            role: role.into(),
            role_rank,
            status: AgentStatus::Idle,
            current_task: None,
            params: AgentParams::new(),
            started_at: Some(Utc::now()),
            restarts: 0,
        }
    }

    /// Merge `update` into the parameters. A `null` value removes the key.
    pub fn merge_params(&mut self, update: AgentParams) {
        for (key, value) in update {
            if value.is_null() {
                self.params.remove(&key);
            } else {
                self.params.insert(key, value);
            }
        }
    }
}
