//! Node registry: node lifecycle state machine, routing and the agent table.
//!
//! All state lives behind one `std::sync::Mutex`. Critical sections only
//! touch in-memory maps; callers never hold the lock across I/O.
//!
//! ```text
//! UNKNOWN -> STARTING -> READY <-> OFFLINE
//!               |          |          ^
//!               +-> ERROR <+          |
//!                     +---------------+
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use commander_core::{
    Agent, AgentId, AgentParams, AgentStatus, HeartbeatConfig, Node, NodeId, NodeRole, NodeSpec, NodeStatus,
    RegistryError, RoleHierarchy, TaskId, Timestamp,
};
use serde::Serialize;
use tokio::sync::Notify;

pub type RegistryResult<T> = Result<T, RegistryError>;

// ============================================================================
// EVENTS
// ============================================================================

/// Record of what a mutating registry operation did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegistryEvent {
    /// Static fields of a node were created or refreshed.
    Registered { node_id: NodeId, created: bool },
    /// A node moved between lifecycle states.
    Transitioned {
        node_id: NodeId,
        from: NodeStatus,
        to: NodeStatus,
        reason: Option<String>,
        /// Agents destroyed by a move to OFFLINE.
        agents_removed: Vec<AgentId>,
    },
    /// The request was valid but the node was already in the target state.
    Unchanged { node_id: NodeId, status: NodeStatus },
    Heartbeat { node_id: NodeId, at: Timestamp },
    AgentUpdated { agent: Agent },
}

impl RegistryEvent {
    pub fn node_id(&self) -> &str {
        match self {
            RegistryEvent::Registered { node_id, .. }
            | RegistryEvent::Transitioned { node_id, .. }
            | RegistryEvent::Unchanged { node_id, .. }
            | RegistryEvent::Heartbeat { node_id, .. } => node_id,
            RegistryEvent::AgentUpdated { agent } => &agent.node_id,
        }
    }

    /// Node status after the operation, where the event carries one.
    pub fn status(&self) -> Option<NodeStatus> {
        match self {
            RegistryEvent::Transitioned { to, .. } => Some(*to),
            RegistryEvent::Unchanged { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether observers should be told right away.
    pub fn is_significant(&self) -> bool {
        !matches!(
            self,
            RegistryEvent::Unchanged { .. } | RegistryEvent::Heartbeat { .. }
        )
    }
}

/// Consistent copy of the registry at one revision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrySnapshot {
    pub revision: u64,
    pub nodes: Vec<Node>,
    pub agents: Vec<Agent>,
}

// ============================================================================
// REGISTRY
// ============================================================================

#[derive(Debug, Default)]
struct Inner {
    nodes: BTreeMap<NodeId, Node>,
    agents: BTreeMap<AgentId, Agent>,
    roles: RoleHierarchy,
    revision: u64,
}

impl Inner {
    fn node_mut(&mut self, node_id: &str) -> RegistryResult<&mut Node> {
        self.nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::UnknownNode {
                node_id: node_id.to_string(),
            })
    }

    fn transition(
        &mut self,
        node_id: &str,
        to: NodeStatus,
        reason: Option<String>,
    ) -> RegistryResult<RegistryEvent> {
        let node = self.node_mut(node_id)?;
        let from = node.status;
        if !from.can_transition_to(to) {
            return Err(RegistryError::InvalidTransition {
                node_id: node_id.to_string(),
                from,
                to,
            });
        }
        node.status = to;
        node.status_reason = reason.clone();

        let mut agents_removed = Vec::new();
        if to == NodeStatus::Offline {
            self.agents.retain(|id, agent| {
                let keep = agent.node_id != node_id;
                if !keep {
                    agents_removed.push(id.clone());
                }
                keep
            });
        }
        self.revision += 1;

        Ok(RegistryEvent::Transitioned {
            node_id: node_id.to_string(),
            from,
            to,
            reason,
            agents_removed,
        })
    }
}

/// Authoritative view of nodes and their agents.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    inner: Mutex<Inner>,
    changed: Arc<Notify>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_roles(roles: RoleHierarchy) -> Self {
        let registry = Self::default();
        if let Ok(mut inner) = registry.inner.lock() {
            inner.roles = roles;
        }
        registry
    }

    fn lock(&self) -> RegistryResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| RegistryError::LockPoisoned)
    }

    /// Notified after every significant change.
    pub fn change_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.changed)
    }

    fn publish(&self, event: RegistryEvent) -> RegistryEvent {
        if event.is_significant() {
            self.changed.notify_one();
        }
        if let RegistryEvent::Transitioned {
            node_id,
            from,
            to,
            reason,
            agents_removed,
        } = &event
        {
            tracing::info!(
                node_id = %node_id,
                from = %from,
                to = %to,
                reason = reason.as_deref().unwrap_or(""),
                agents_removed = agents_removed.len(),
                "Node transition"
            );
        }
        event
    }

    // ------------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------------

    /// Create or refresh a node's static fields.
    ///
    /// A new node starts UNKNOWN; an existing node keeps its status. Only one
    /// node may hold the orchestrator role.
    pub fn register(&self, spec: NodeSpec) -> RegistryResult<RegistryEvent> {
        let mut inner = self.lock()?;
        if spec.role == NodeRole::Orchestrator {
            if let Some(existing) = inner
                .nodes
                .values()
                .find(|n| n.role == NodeRole::Orchestrator && n.id != spec.id)
            {
                return Err(RegistryError::OrchestratorConflict {
                    existing: existing.id.clone(),
                    candidate: spec.id,
                });
            }
        }

        let node_id = spec.id.clone();
        let created = match inner.nodes.get_mut(&node_id) {
            Some(node) => {
                node.apply_spec(spec);
                false
            }
            None => {
                inner.nodes.insert(node_id.clone(), Node::from_spec(spec));
                true
            }
        };
        inner.revision += 1;
        drop(inner);

        if created {
            tracing::info!(node_id = %node_id, "Node registered");
        }
        Ok(self.publish(RegistryEvent::Registered { node_id, created }))
    }

    /// Move a node to STARTING.
    ///
    /// A READY node is left alone; a node already STARTING is an error.
    pub fn start(&self, node_id: &str) -> RegistryResult<RegistryEvent> {
        let mut inner = self.lock()?;
        let status = inner.node_mut(node_id)?.status;
        let event = match status {
            NodeStatus::Ready => RegistryEvent::Unchanged {
                node_id: node_id.to_string(),
                status,
            },
            NodeStatus::Starting => {
                return Err(RegistryError::AlreadyStarting {
                    node_id: node_id.to_string(),
                })
            }
            _ => inner.transition(node_id, NodeStatus::Starting, None)?,
        };
        drop(inner);
        Ok(self.publish(event))
    }

    /// Move a node to READY and record its heartbeat.
    pub fn mark_ready(&self, node_id: &str, heartbeat: Timestamp) -> RegistryResult<RegistryEvent> {
        let mut inner = self.lock()?;
        let node = inner.node_mut(node_id)?;
        node.last_heartbeat = Some(heartbeat);
        let event = if node.status == NodeStatus::Ready {
            RegistryEvent::Unchanged {
                node_id: node_id.to_string(),
                status: NodeStatus::Ready,
            }
        } else {
            inner.transition(node_id, NodeStatus::Ready, None)?
        };
        drop(inner);
        Ok(self.publish(event))
    }

    /// Move a node to OFFLINE, destroying its agents.
    pub fn mark_offline(
        &self,
        node_id: &str,
        reason: impl Into<String>,
    ) -> RegistryResult<RegistryEvent> {
        let mut inner = self.lock()?;
        let node = inner.node_mut(node_id)?;
        node.last_heartbeat = Some(Utc::now());
        let event = if node.status == NodeStatus::Offline {
            RegistryEvent::Unchanged {
                node_id: node_id.to_string(),
                status: NodeStatus::Offline,
            }
        } else {
            inner.transition(node_id, NodeStatus::Offline, Some(reason.into()))?
        };
        drop(inner);
        Ok(self.publish(event))
    }

    /// Move a node to ERROR with captured diagnostics.
    pub fn mark_error(
        &self,
        node_id: &str,
        diagnostics: impl Into<String>,
    ) -> RegistryResult<RegistryEvent> {
        let diagnostics = diagnostics.into();
        let mut inner = self.lock()?;
        let node = inner.node_mut(node_id)?;
        let event = if node.status == NodeStatus::Error {
            node.status_reason = Some(diagnostics);
            RegistryEvent::Unchanged {
                node_id: node_id.to_string(),
                status: NodeStatus::Error,
            }
        } else {
            inner.transition(node_id, NodeStatus::Error, Some(diagnostics))?
        };
        drop(inner);
        Ok(self.publish(event))
    }

    /// Record a heartbeat. Only READY nodes are kept alive by heartbeats;
    /// other states just remember the timestamp.
    pub fn heartbeat(&self, node_id: &str, at: Timestamp) -> RegistryResult<RegistryEvent> {
        let mut inner = self.lock()?;
        let node = inner.node_mut(node_id)?;
        let newest = node.last_heartbeat.map_or(at, |prev| prev.max(at));
        node.last_heartbeat = Some(newest);
        let event = if node.status == NodeStatus::Ready {
            RegistryEvent::Heartbeat {
                node_id: node_id.to_string(),
                at: newest,
            }
        } else {
            RegistryEvent::Unchanged {
                node_id: node_id.to_string(),
                status: node.status,
            }
        };
        drop(inner);
        Ok(self.publish(event))
    }

    /// Mark READY nodes whose heartbeat is older than their tier timeout as
    /// OFFLINE. Returns the forced transitions.
    pub fn sweep_stale(
        &self,
        now: Timestamp,
        config: &HeartbeatConfig,
    ) -> RegistryResult<Vec<RegistryEvent>> {
        let mut inner = self.lock()?;
        let stale: Vec<RegistryError> = inner
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Ready)
            .filter_map(|n| {
                let last = n.last_heartbeat?;
                let elapsed_ms = (now - last).num_milliseconds();
                let timeout_ms = config.timeout_for(n.benchmark_score).as_millis() as i64;
                (elapsed_ms > timeout_ms).then(|| RegistryError::NodeTimeout {
                    node_id: n.id.clone(),
                    elapsed_ms,
                    timeout_ms,
                })
            })
            .collect();

        let mut events = Vec::with_capacity(stale.len());
        for timeout in stale {
            let RegistryError::NodeTimeout { node_id, .. } = &timeout else {
                continue;
            };
            let node_id = node_id.clone();
            events.push(inner.transition(&node_id, NodeStatus::Offline, Some(timeout.to_string()))?);
        }
        drop(inner);

        Ok(events.into_iter().map(|e| self.publish(e)).collect())
    }

    /// Best READY node for the candidate roles: highest benchmark score,
    /// ties broken by lowest id. An empty candidate set accepts any role.
    pub fn select_for_routing(&self, candidate_roles: &[NodeRole]) -> RegistryResult<Node> {
        let inner = self.lock()?;
        let mut best: Option<&Node> = None;
        // BTreeMap iterates in id order, so strict > keeps the lowest id on ties
        for node in inner.nodes.values() {
            if !node.status.is_routable() || !node.enabled {
                continue;
            }
            if !candidate_roles.is_empty() && !candidate_roles.contains(&node.role) {
                continue;
            }
            if best.map_or(true, |b| node.benchmark_score > b.benchmark_score) {
                best = Some(node);
            }
        }
        best.cloned().ok_or_else(|| RegistryError::NoEligibleNode {
            roles: candidate_roles.iter().map(|r| r.to_string()).collect(),
        })
    }

    pub fn get_node(&self, node_id: &str) -> RegistryResult<Node> {
        let inner = self.lock()?;
        inner
            .nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownNode {
                node_id: node_id.to_string(),
            })
    }

    pub fn list_nodes(&self) -> RegistryResult<Vec<Node>> {
        Ok(self.lock()?.nodes.values().cloned().collect())
    }

    /// Update a node's engine fields after a re-ignition applied them.
    pub fn record_engine(
        &self,
        node_id: &str,
        engine: &commander_core::EngineSettings,
    ) -> RegistryResult<()> {
        let mut inner = self.lock()?;
        inner.node_mut(node_id)?.apply_engine(engine);
        inner.revision += 1;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Roles and agents
    // ------------------------------------------------------------------------

    /// Replace the role hierarchy. Agents keep their role names; ranks are
    /// refreshed, and agents whose role vanished keep their previous rank.
    pub fn set_roles(&self, roles: RoleHierarchy) -> RegistryResult<()> {
        let mut inner = self.lock()?;
        for agent in inner.agents.values_mut() {
            if let Some(rank) = roles.rank(&agent.role) {
                agent.role_rank = rank;
            }
        }
        inner.roles = roles;
        inner.revision += 1;
        Ok(())
    }

    pub fn roles(&self) -> RegistryResult<RoleHierarchy> {
        Ok(self.lock()?.roles.clone())
    }

    /// Create or replace an agent on a registered node.
    pub fn register_agent(
        &self,
        agent_id: impl Into<String>,
        node_id: &str,
        role: &str,
    ) -> RegistryResult<RegistryEvent> {
        let mut inner = self.lock()?;
        inner.node_mut(node_id)?;
        let rank = inner.roles.rank(role).ok_or_else(|| RegistryError::UnknownRole {
            role: role.to_string(),
        })?;
        let agent = Agent::new(agent_id, node_id, role, rank);
        inner.agents.insert(agent.id.clone(), agent.clone());
        inner.revision += 1;
        drop(inner);
        Ok(self.publish(RegistryEvent::AgentUpdated { agent }))
    }

    /// Reassign an agent's role; the role must exist in the hierarchy.
    pub fn set_agent_role(&self, agent_id: &str, role: &str) -> RegistryResult<RegistryEvent> {
        let mut inner = self.lock()?;
        let rank = inner.roles.rank(role).ok_or_else(|| RegistryError::UnknownRole {
            role: role.to_string(),
        })?;
        let agent = inner
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent {
                agent_id: agent_id.to_string(),
            })?;
        agent.role = role.to_string();
        agent.role_rank = rank;
        let agent = agent.clone();
        inner.revision += 1;
        drop(inner);
        Ok(self.publish(RegistryEvent::AgentUpdated { agent }))
    }

    pub fn set_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        current_task: Option<TaskId>,
    ) -> RegistryResult<RegistryEvent> {
        let mut inner = self.lock()?;
        let agent = inner
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent {
                agent_id: agent_id.to_string(),
            })?;
        agent.status = status;
        agent.current_task = current_task;
        let agent = agent.clone();
        inner.revision += 1;
        drop(inner);
        Ok(self.publish(RegistryEvent::AgentUpdated { agent }))
    }

    /// Run a stopped or failed agent again. Its node must be READY; an
    /// agent that is already running is left alone.
    pub fn start_agent(&self, agent_id: &str) -> RegistryResult<RegistryEvent> {
        self.update_running_agent(agent_id, |agent| {
            if !agent.status.is_running() {
                agent.status = AgentStatus::Idle;
                agent.started_at = Some(Utc::now());
            }
        })
    }

    /// Stop an agent, dropping whatever task it held.
    pub fn stop_agent(&self, agent_id: &str) -> RegistryResult<RegistryEvent> {
        self.update_agent(agent_id, |agent| {
            agent.status = AgentStatus::Stopped;
            agent.current_task = None;
            agent.started_at = None;
        })
    }

    /// Stop and start an agent in one step.
    pub fn restart_agent(&self, agent_id: &str) -> RegistryResult<RegistryEvent> {
        self.update_running_agent(agent_id, restart)
    }

    /// Merge parameters into an agent. A running agent restarts so the new
    /// parameters take effect; a stopped one keeps them for its next start.
    pub fn configure_agent(
        &self,
        agent_id: &str,
        params: AgentParams,
    ) -> RegistryResult<RegistryEvent> {
        self.update_agent(agent_id, |agent| {
            agent.merge_params(params);
            if agent.status.is_running() {
                restart(agent);
            }
        })
    }

    pub fn get_agent(&self, agent_id: &str) -> RegistryResult<Agent> {
        self.lock()?
            .agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownAgent {
                agent_id: agent_id.to_string(),
            })
    }

    /// Apply `update` to an agent whose node is READY.
    fn update_running_agent(
        &self,
        agent_id: &str,
        update: impl FnOnce(&mut Agent),
    ) -> RegistryResult<RegistryEvent> {
        self.apply_to_agent(agent_id, true, update)
    }

    fn update_agent(
        &self,
        agent_id: &str,
        update: impl FnOnce(&mut Agent),
    ) -> RegistryResult<RegistryEvent> {
        self.apply_to_agent(agent_id, false, update)
    }

    fn apply_to_agent(
        &self,
        agent_id: &str,
        require_ready: bool,
        update: impl FnOnce(&mut Agent),
    ) -> RegistryResult<RegistryEvent> {
        let agent = {
            let mut guard = self.lock()?;
            let inner = &mut *guard;
            let agent = inner
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| RegistryError::UnknownAgent {
                    agent_id: agent_id.to_string(),
                })?;
            if require_ready {
                let status = inner
                    .nodes
                    .get(&agent.node_id)
                    .map_or(NodeStatus::Unknown, |n| n.status);
                if status != NodeStatus::Ready {
                    return Err(RegistryError::AgentNodeNotReady {
                        agent_id: agent_id.to_string(),
                        node_id: agent.node_id.clone(),
                        status,
                    });
                }
            }
            update(agent);
            let agent = agent.clone();
            inner.revision += 1;
            agent
        };
        tracing::info!(agent_id = %agent.id, status = %agent.status, "Agent updated");
        Ok(self.publish(RegistryEvent::AgentUpdated { agent }))
    }

    pub fn agents_on_node(&self, node_id: &str) -> RegistryResult<Vec<Agent>> {
        let inner = self.lock()?;
        if !inner.nodes.contains_key(node_id) {
            return Err(RegistryError::UnknownNode {
                node_id: node_id.to_string(),
            });
        }
        Ok(inner
            .agents
            .values()
            .filter(|a| a.node_id == node_id)
            .cloned()
            .collect())
    }

    /// All agents, most authoritative role first.
    pub fn list_agents(&self) -> RegistryResult<Vec<Agent>> {
        let inner = self.lock()?;
        let mut agents: Vec<Agent> = inner.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.role_rank.cmp(&b.role_rank).then_with(|| a.id.cmp(&b.id)));
        Ok(agents)
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    pub fn revision(&self) -> RegistryResult<u64> {
        Ok(self.lock()?.revision)
    }

    pub fn snapshot(&self) -> RegistryResult<RegistrySnapshot> {
        let inner = self.lock()?;
        Ok(RegistrySnapshot {
            revision: inner.revision,
            nodes: inner.nodes.values().cloned().collect(),
            agents: inner.agents.values().cloned().collect(),
        })
    }
}

fn restart(agent: &mut Agent) {
    agent.status = AgentStatus::Idle;
    agent.current_task = None;
    agent.started_at = Some(Utc::now());
    agent.restarts += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn registry_with(nodes: &[(&str, u32, NodeRole)]) -> NodeRegistry {
        let registry = NodeRegistry::new();
        for (id, score, role) in nodes {
            registry
                .register(NodeSpec::new(*id, *score, *role))
                .expect("register");
        }
        registry
    }

    fn bring_up(registry: &NodeRegistry, node_id: &str) {
        registry.start(node_id).expect("start");
        registry.mark_ready(node_id, Utc::now()).expect("ready");
    }

    #[test]
    fn test_concurrent_heartbeats_keep_newest() {
        let registry = Arc::new(registry_with(&[("htpc", 60, NodeRole::Worker)]));
        bring_up(&registry, "htpc");
        let base = Utc::now();

        let workers: Vec<_> = (0..4i64)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..50i64 {
                        let at = base + Duration::milliseconds(t * 50 + i);
                        let event = registry.heartbeat("htpc", at).expect("heartbeat");
                        assert!(matches!(event, RegistryEvent::Heartbeat { .. }));
                        registry.snapshot().expect("snapshot");
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker");
        }

        let node = registry.get_node("htpc").expect("node");
        assert_eq!(node.last_heartbeat, Some(base + Duration::milliseconds(199)));
    }

    #[test]
    fn test_register_is_idempotent_and_preserves_status() {
        let registry = registry_with(&[("htpc", 60, NodeRole::Worker)]);
        bring_up(&registry, "htpc");

        let event = registry
            .register(NodeSpec::new("htpc", 75, NodeRole::Worker))
            .expect("re-register");
        assert_eq!(
            event,
            RegistryEvent::Registered {
                node_id: "htpc".to_string(),
                created: false
            }
        );
        let node = registry.get_node("htpc").expect("node");
        assert_eq!(node.status, NodeStatus::Ready);
        assert_eq!(node.benchmark_score, 75);
    }

    #[test]
    fn test_second_orchestrator_rejected() {
        let registry = registry_with(&[("main", 130, NodeRole::Orchestrator)]);
        let err = registry
            .register(NodeSpec::new("deck", 40, NodeRole::Orchestrator))
            .unwrap_err();
        assert!(matches!(err, RegistryError::OrchestratorConflict { .. }));
        // Re-registering the holder itself is fine
        assert!(registry
            .register(NodeSpec::new("main", 130, NodeRole::Orchestrator))
            .is_ok());
    }

    #[test]
    fn test_start_semantics() {
        let registry = registry_with(&[("htpc", 60, NodeRole::Worker)]);
        assert_eq!(
            registry.start("htpc").expect("start").status(),
            Some(NodeStatus::Starting)
        );
        assert!(matches!(
            registry.start("htpc"),
            Err(RegistryError::AlreadyStarting { .. })
        ));
        registry.mark_ready("htpc", Utc::now()).expect("ready");
        assert_eq!(
            registry.start("htpc").expect("start"),
            RegistryEvent::Unchanged {
                node_id: "htpc".to_string(),
                status: NodeStatus::Ready
            }
        );
        assert!(matches!(
            registry.start("ghost"),
            Err(RegistryError::UnknownNode { .. })
        ));
    }

    #[test]
    fn test_mark_ready_from_unknown_is_invalid() {
        let registry = registry_with(&[("htpc", 60, NodeRole::Worker)]);
        let err = registry.mark_ready("htpc", Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::InvalidTransition {
                from: NodeStatus::Unknown,
                to: NodeStatus::Ready,
                ..
            }
        ));
    }

    #[test]
    fn test_offline_destroys_agents() {
        let registry = registry_with(&[("htpc", 60, NodeRole::Worker), ("main", 130, NodeRole::Orchestrator)]);
        bring_up(&registry, "htpc");
        registry.register_agent("coder-1", "htpc", "worker").expect("agent");
        registry.register_agent("coder-2", "htpc", "worker").expect("agent");
        registry.register_agent("lead", "main", "orchestrator").expect("agent");

        let event = registry.mark_offline("htpc", "operator stop").expect("offline");
        match event {
            RegistryEvent::Transitioned { agents_removed, to, .. } => {
                assert_eq!(to, NodeStatus::Offline);
                assert_eq!(agents_removed, vec!["coder-1".to_string(), "coder-2".to_string()]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(registry.agents_on_node("htpc").expect("agents").is_empty());
        assert_eq!(registry.list_agents().expect("agents").len(), 1);
    }

    #[test]
    fn test_error_recovery_paths() {
        let registry = registry_with(&[("htpc", 60, NodeRole::Worker)]);
        registry.start("htpc").expect("start");
        registry.mark_error("htpc", "model file missing").expect("error");
        let node = registry.get_node("htpc").expect("node");
        assert_eq!(node.status, NodeStatus::Error);
        assert_eq!(node.status_reason.as_deref(), Some("model file missing"));

        registry.start("htpc").expect("restart from error");
        registry.mark_error("htpc", "again").expect("error");
        registry.mark_offline("htpc", "stop").expect("stop from error");
        assert_eq!(registry.get_node("htpc").expect("node").status, NodeStatus::Offline);
    }

    #[test]
    fn test_routing_prefers_benchmark_then_id() {
        let registry = registry_with(&[
            ("a", 130, NodeRole::Worker),
            ("b", 60, NodeRole::Worker),
            ("c", 60, NodeRole::Relay),
        ]);
        bring_up(&registry, "a");
        bring_up(&registry, "b");
        assert_eq!(registry.select_for_routing(&[]).expect("route").id, "a");

        registry.mark_offline("a", "maintenance").expect("offline");
        assert_eq!(registry.select_for_routing(&[]).expect("route").id, "b");

        bring_up(&registry, "c");
        // b and c tie at 60; lowest id wins
        assert_eq!(registry.select_for_routing(&[]).expect("route").id, "b");
        assert_eq!(
            registry.select_for_routing(&[NodeRole::Relay]).expect("route").id,
            "c"
        );
    }

    #[test]
    fn test_routing_with_no_ready_node_fails() {
        let registry = registry_with(&[("a", 130, NodeRole::Worker)]);
        let err = registry.select_for_routing(&[NodeRole::Worker]).unwrap_err();
        assert_eq!(
            err,
            RegistryError::NoEligibleNode {
                roles: vec!["worker".to_string()]
            }
        );
    }

    #[test]
    fn test_sweep_uses_benchmark_tiers() {
        let registry = registry_with(&[("fast", 130, NodeRole::Worker), ("slow", 10, NodeRole::Worker)]);
        let t0 = Utc::now();
        registry.start("fast").expect("start");
        registry.mark_ready("fast", t0).expect("ready");
        registry.start("slow").expect("start");
        registry.mark_ready("slow", t0).expect("ready");

        let config = HeartbeatConfig::default();
        // 20s later: past the 15s tier, inside the 60s fallback
        let events = registry
            .sweep_stale(t0 + Duration::seconds(20), &config)
            .expect("sweep");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].node_id(), "fast");
        assert_eq!(registry.get_node("slow").expect("node").status, NodeStatus::Ready);

        registry.heartbeat("slow", t0 + Duration::seconds(50)).expect("heartbeat");
        let events = registry
            .sweep_stale(t0 + Duration::seconds(90), &config)
            .expect("sweep");
        assert!(events.is_empty());
    }

    #[test]
    fn test_agent_role_must_exist() {
        let registry = registry_with(&[("htpc", 60, NodeRole::Worker)]);
        registry.register_agent("a1", "htpc", "worker").expect("agent");
        assert!(matches!(
            registry.set_agent_role("a1", "overlord"),
            Err(RegistryError::UnknownRole { .. })
        ));
        let event = registry.set_agent_role("a1", "relay").expect("role");
        match event {
            RegistryEvent::AgentUpdated { agent } => assert_eq!(agent.role_rank, 1),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_revision_advances() {
        let registry = registry_with(&[("htpc", 60, NodeRole::Worker)]);
        let before = registry.snapshot().expect("snapshot");
        registry.start("htpc").expect("start");
        let after = registry.snapshot().expect("snapshot");
        assert!(after.revision > before.revision);
        assert_eq!(after.nodes[0].status, NodeStatus::Starting);
    }

    #[test]
    fn test_agent_stop_start_restart() {
        let registry = registry_with(&[("htpc", 60, NodeRole::Worker)]);
        bring_up(&registry, "htpc");
        registry.register_agent("coder-1", "htpc", "worker").expect("agent");
        registry
            .set_agent_status("coder-1", AgentStatus::Busy, Some("task-1".to_string()))
            .expect("busy");

        registry.stop_agent("coder-1").expect("stop");
        let agent = registry.get_agent("coder-1").expect("agent");
        assert_eq!(agent.status, AgentStatus::Stopped);
        assert_eq!(agent.current_task, None);

        registry.start_agent("coder-1").expect("start");
        assert_eq!(registry.get_agent("coder-1").expect("agent").status, AgentStatus::Idle);

        registry.restart_agent("coder-1").expect("restart");
        assert_eq!(registry.get_agent("coder-1").expect("agent").restarts, 1);
        assert!(matches!(
            registry.stop_agent("ghost"),
            Err(RegistryError::UnknownAgent { .. })
        ));
    }

    #[test]
    fn test_agent_needs_ready_node_to_run() {
        let registry = registry_with(&[("htpc", 60, NodeRole::Worker)]);
        registry.register_agent("coder-1", "htpc", "worker").expect("agent");
        registry.stop_agent("coder-1").expect("stop");

        let err = registry.start_agent("coder-1").unwrap_err();
        assert!(matches!(
            err,
            RegistryError::AgentNodeNotReady { status: NodeStatus::Unknown, .. }
        ));
        assert_eq!(registry.get_agent("coder-1").expect("agent").status, AgentStatus::Stopped);
    }

    #[test]
    fn test_configure_restarts_running_agent_only() {
        let registry = registry_with(&[("htpc", 60, NodeRole::Worker)]);
        bring_up(&registry, "htpc");
        registry.register_agent("coder-1", "htpc", "worker").expect("agent");
        registry.register_agent("coder-2", "htpc", "worker").expect("agent");
        registry.stop_agent("coder-2").expect("stop");

        let params = AgentParams::from([("context_size".to_string(), serde_json::json!(4096))]);
        registry.configure_agent("coder-1", params.clone()).expect("configure");
        registry.configure_agent("coder-2", params.clone()).expect("configure");

        let running = registry.get_agent("coder-1").expect("agent");
        assert_eq!(running.params, params);
        assert_eq!(running.restarts, 1);
        let stopped = registry.get_agent("coder-2").expect("agent");
        assert_eq!(stopped.params, params);
        assert_eq!(stopped.restarts, 0);
        assert_eq!(stopped.status, AgentStatus::Stopped);
    }
}
