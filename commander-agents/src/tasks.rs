//! Task board.
//!
//! Holds task definitions and moves them through
//! `DEFINED -> DISPATCHED -> COMPLETED|FAILED`. A task dispatches only once
//! every task it depends on has completed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use commander_core::{CommanderResult, RegistryError, TaskDefinition, TaskId, TaskStatus};

use crate::registry::NodeRegistry;

#[derive(Debug, Default)]
pub struct TaskBoard {
    tasks: Mutex<BTreeMap<TaskId, TaskDefinition>>,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<TaskId, TaskDefinition>>, RegistryError> {
        self.tasks.lock().map_err(|_| RegistryError::LockPoisoned)
    }

    /// Add a task in DEFINED state.
    ///
    /// Every assigned node must be registered, every role must exist in the
    /// hierarchy and every dependency must already be on the board.
    pub fn define(
        &self,
        mut task: TaskDefinition,
        registry: &NodeRegistry,
    ) -> CommanderResult<TaskDefinition> {
        let roles = registry.roles()?;
        for (role, node_id) in &task.role_assignments {
            if roles.rank(role).is_none() {
                return Err(RegistryError::UnknownRole { role: role.clone() }.into());
            }
            registry.get_node(node_id)?;
        }
        task.status = TaskStatus::Defined;

        let mut tasks = self.lock()?;
        if tasks.contains_key(&task.id) {
            return Err(RegistryError::DuplicateTask {
                task_id: task.id.clone(),
            }
            .into());
        }
        if let Some(missing) = task.dependencies.iter().find(|d| !tasks.contains_key(*d)) {
            return Err(RegistryError::UnknownTask {
                task_id: missing.clone(),
            }
            .into());
        }
        tasks.insert(task.id.clone(), task.clone());
        drop(tasks);

        tracing::info!(
            task_id = %task.id,
            roles = task.role_assignments.len(),
            dependencies = task.dependencies.len(),
            "Task defined"
        );
        Ok(task)
    }

    pub fn get(&self, task_id: &str) -> CommanderResult<TaskDefinition> {
        self.lock()?
            .get(task_id)
            .cloned()
            .ok_or_else(|| {
                RegistryError::UnknownTask {
                    task_id: task_id.to_string(),
                }
                .into()
            })
    }

    /// All tasks in id order.
    pub fn list(&self) -> CommanderResult<Vec<TaskDefinition>> {
        Ok(self.lock()?.values().cloned().collect())
    }

    /// DEFINED tasks whose dependencies have all completed.
    pub fn ready(&self) -> CommanderResult<Vec<TaskDefinition>> {
        let tasks = self.lock()?;
        let completed = completed_ids(&tasks);
        Ok(tasks
            .values()
            .filter(|t| t.is_ready(&completed))
            .cloned()
            .collect())
    }

    /// Move a task to DISPATCHED. Fails with `TaskBlocked` while any
    /// dependency has not completed.
    pub fn dispatch(&self, task_id: &str) -> CommanderResult<TaskDefinition> {
        let mut tasks = self.lock()?;
        let completed = completed_ids(&tasks);
        let task = task_mut(&mut tasks, task_id)?;
        let pending: Vec<TaskId> = task
            .dependencies
            .difference(&completed)
            .cloned()
            .collect();
        if !pending.is_empty() {
            return Err(RegistryError::TaskBlocked {
                task_id: task_id.to_string(),
                pending,
            }
            .into());
        }
        task.transition(TaskStatus::Dispatched)?;
        let task = task.clone();
        drop(tasks);
        tracing::info!(task_id = %task_id, "Task dispatched");
        Ok(task)
    }

    pub fn complete(&self, task_id: &str) -> CommanderResult<TaskDefinition> {
        self.finish(task_id, TaskStatus::Completed)
    }

    pub fn fail(&self, task_id: &str) -> CommanderResult<TaskDefinition> {
        self.finish(task_id, TaskStatus::Failed)
    }

    fn finish(&self, task_id: &str, status: TaskStatus) -> CommanderResult<TaskDefinition> {
        let mut tasks = self.lock()?;
        let task = task_mut(&mut tasks, task_id)?;
        task.transition(status)?;
        let task = task.clone();
        drop(tasks);
        tracing::info!(task_id = %task_id, status = %status, "Task finished");
        Ok(task)
    }
}

fn task_mut<'a>(
    tasks: &'a mut BTreeMap<TaskId, TaskDefinition>,
    task_id: &str,
) -> Result<&'a mut TaskDefinition, RegistryError> {
    tasks.get_mut(task_id).ok_or_else(|| RegistryError::UnknownTask {
        task_id: task_id.to_string(),
    })
}

fn completed_ids(tasks: &BTreeMap<TaskId, TaskDefinition>) -> BTreeSet<TaskId> {
    tasks
        .values()
        .filter(|t| t.status == TaskStatus::Completed)
        .map(|t| t.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use commander_core::{CommanderError, NodeRole, NodeSpec, ValidationError};

    fn registry() -> NodeRegistry {
        let registry = NodeRegistry::new();
        registry
            .register(NodeSpec::new("htpc", 130, NodeRole::Worker))
            .expect("register");
        registry
    }

    #[test]
    fn test_dependency_gates_dispatch() {
        let registry = registry();
        let board = TaskBoard::new();
        board
            .define(TaskDefinition::new("plan").assign("worker", "htpc"), &registry)
            .expect("define");
        board
            .define(TaskDefinition::new("build").depends_on("plan"), &registry)
            .expect("define");

        let err = board.dispatch("build").unwrap_err();
        assert!(matches!(
            err,
            CommanderError::Registry(RegistryError::TaskBlocked { ref pending, .. })
                if pending == &vec!["plan".to_string()]
        ));
        let ready: Vec<_> = board.ready().expect("ready").into_iter().map(|t| t.id).collect();
        assert_eq!(ready, vec!["plan".to_string()]);

        board.dispatch("plan").expect("dispatch");
        board.complete("plan").expect("complete");
        assert_eq!(board.dispatch("build").expect("dispatch").status, TaskStatus::Dispatched);
    }

    #[test]
    fn test_define_validates_assignments() {
        let registry = registry();
        let board = TaskBoard::new();

        let unknown_node = TaskDefinition::new("t1").assign("worker", "nowhere");
        assert!(matches!(
            board.define(unknown_node, &registry),
            Err(CommanderError::Registry(RegistryError::UnknownNode { .. }))
        ));
        let unknown_role = TaskDefinition::new("t1").assign("poet", "htpc");
        assert!(matches!(
            board.define(unknown_role, &registry),
            Err(CommanderError::Registry(RegistryError::UnknownRole { .. }))
        ));
        let missing_dep = TaskDefinition::new("t1").depends_on("t0");
        assert!(matches!(
            board.define(missing_dep, &registry),
            Err(CommanderError::Registry(RegistryError::UnknownTask { .. }))
        ));

        board.define(TaskDefinition::new("t1"), &registry).expect("define");
        assert!(matches!(
            board.define(TaskDefinition::new("t1"), &registry),
            Err(CommanderError::Registry(RegistryError::DuplicateTask { .. }))
        ));
    }

    #[test]
    fn test_finished_task_is_never_reopened() {
        let registry = registry();
        let board = TaskBoard::new();
        board.define(TaskDefinition::new("t1"), &registry).expect("define");

        // Finishing needs a dispatch first
        assert!(matches!(
            board.complete("t1"),
            Err(CommanderError::Validation(ValidationError::InvalidValue { .. }))
        ));
        board.dispatch("t1").expect("dispatch");
        board.fail("t1").expect("fail");
        assert!(board.dispatch("t1").is_err());
        assert!(board.complete("t1").is_err());
        assert_eq!(board.get("t1").expect("task").status, TaskStatus::Failed);
    }
}
