//! Task definitions.

use crate::{NodeId, TaskId, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Task status. Terminal states are never reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Defined,
    Dispatched,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Defined, TaskStatus::Dispatched)
                | (TaskStatus::Defined, TaskStatus::Failed)
                | (TaskStatus::Dispatched, TaskStatus::Completed)
                | (TaskStatus::Dispatched, TaskStatus::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Defined => "defined",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A unit of work with role assignments and dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: TaskId,
    /// role name -> node assigned to it
    pub role_assignments: BTreeMap<String, NodeId>,
    pub dependencies: BTreeSet<TaskId>,
    pub status: TaskStatus,
}

impl TaskDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role_assignments: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            status: TaskStatus::Defined,
        }
    }

    pub fn assign(mut self, role: impl Into<String>, node_id: impl Into<String>) -> Self {
        self.role_assignments.insert(role.into(), node_id.into());
        self
    }

    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.dependencies.insert(task_id.into());
        self
    }

    /// Move to `next`, rejecting anything the lifecycle does not allow.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), ValidationError> {
        if !self.status.can_transition_to(next) {
            return Err(ValidationError::InvalidValue {
                field: "status".to_string(),
                reason: format!("task {} cannot move from {} to {}", self.id, self.status, next),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Whether every dependency is in `completed`.
    pub fn is_ready(&self, completed: &BTreeSet<TaskId>) -> bool {
        self.status == TaskStatus::Defined && self.dependencies.is_subset(completed)
    }
}
