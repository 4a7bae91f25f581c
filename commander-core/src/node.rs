//! Node records and the node lifecycle state machine.

use crate::{NodeId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Cluster role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Coordinates task dispatch. At most one per deployment.
    Orchestrator,
    /// Hosts the durable relay store.
    Relay,
    #[default]
    Worker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Orchestrator => "orchestrator",
            NodeRole::Relay => "relay",
            NodeRole::Worker => "worker",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = NodeRoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "orchestrator" => Ok(NodeRole::Orchestrator),
            "relay" => Ok(NodeRole::Relay),
            "worker" => Ok(NodeRole::Worker),
            _ => Err(NodeRoleParseError(s.to_string())),
        }
    }
}

/// Error when parsing an invalid node role string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRoleParseError(pub String);

impl fmt::Display for NodeRoleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid node role: {}", self.0)
    }
}

impl std::error::Error for NodeRoleParseError {}

/// Lifecycle status of a node.
///
/// ```text
/// UNKNOWN -> STARTING -> READY <-> OFFLINE
///               |          |
///               +-> ERROR <+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Defined in configuration but never contacted.
    #[default]
    Unknown,
    Starting,
    Ready,
    Offline,
    Error,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Unknown => "unknown",
            NodeStatus::Starting => "starting",
            NodeStatus::Ready => "ready",
            NodeStatus::Offline => "offline",
            NodeStatus::Error => "error",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Self-transitions are not transitions; callers handle them as no-ops.
    /// Besides the main cycle, a stop may cancel a start in flight
    /// (STARTING -> OFFLINE) or park a never-started node (UNKNOWN -> OFFLINE).
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (self, next),
            (Unknown, Starting)
                | (Offline, Starting)
                | (Error, Starting)
                | (Starting, Ready)
                | (Starting, Offline)
                | (Starting, Error)
                | (Ready, Offline)
                | (Ready, Error)
                | (Offline, Ready)
                | (Error, Offline)
                | (Unknown, Offline)
        )
    }

    /// Routing only ever considers READY nodes.
    pub fn is_routable(&self) -> bool {
        matches!(self, NodeStatus::Ready)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Engine settings applied on re-ignition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    pub context_size: u32,
    pub gpu_layers: u32,
    pub flash_attention: bool,
    /// Engine binary name or path.
    pub binary: String,
    /// Model reference, resolved against the node's model root when relative.
    pub model: String,
    #[serde(default)]
    pub extra_flags: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            context_size: 4096,
            gpu_layers: 999,
            flash_attention: true,
            binary: "llama-server".to_string(),
            model: String::new(),
            extra_flags: Vec::new(),
        }
    }
}

/// Static registration data for a node, as read from the node table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub display_name: String,
    /// `host:port` of the node's engine endpoint.
    pub network_address: String,
    /// Throughput rating in tokens/sec.
    pub benchmark_score: u32,
    pub role: NodeRole,
    pub enabled: bool,
    pub max_agents: u32,
    pub model_root: String,
    pub engine: EngineSettings,
}

impl NodeSpec {
    /// Minimal spec used by tests and ad-hoc registration.
    pub fn new(id: impl Into<String>, benchmark_score: u32, role: NodeRole) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            network_address: "127.0.0.1:8080".to_string(),
            id,
            benchmark_score,
            role,
            enabled: true,
            max_agents: 4,
            model_root: String::new(),
            engine: EngineSettings::default(),
        }
    }
}

/// A node as held by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub display_name: String,
    pub network_address: String,
    pub benchmark_score: u32,
    pub role: NodeRole,
    pub status: NodeStatus,
    pub configured_model: String,
    pub context_size: u32,
    pub gpu_layers: u32,
    pub flash_attention: bool,
    pub binary_name: String,
    pub model_root: String,
    pub enabled: bool,
    pub max_agents: u32,
    pub last_heartbeat: Option<Timestamp>,
    /// Reason for the last transition, or captured diagnostics on ERROR.
    pub status_reason: Option<String>,
}

impl Node {
    /// Build a fresh node in UNKNOWN status.
    pub fn from_spec(spec: NodeSpec) -> Self {
        let mut node = Self {
            id: spec.id.clone(),
            display_name: String::new(),
            network_address: String::new(),
            benchmark_score: 0,
            role: NodeRole::Worker,
            status: NodeStatus::Unknown,
            configured_model: String::new(),
            context_size: 0,
            gpu_layers: 0,
            flash_attention: false,
            binary_name: String::new(),
            model_root: String::new(),
            enabled: true,
            max_agents: 0,
            last_heartbeat: None,
            status_reason: None,
        };
        node.apply_spec(spec);
        node
    }

    /// Overwrite the mutable static fields. Identity and status are untouched.
    pub fn apply_spec(&mut self, spec: NodeSpec) {
        self.display_name = spec.display_name;
        self.network_address = spec.network_address;
        self.benchmark_score = spec.benchmark_score;
        self.role = spec.role;
        self.enabled = spec.enabled;
        self.max_agents = spec.max_agents;
        self.model_root = spec.model_root;
        self.apply_engine(&spec.engine);
    }

    /// Record engine settings after a re-ignition persisted them.
    pub fn apply_engine(&mut self, engine: &EngineSettings) {
        self.configured_model = engine.model.clone();
        self.context_size = engine.context_size;
        self.gpu_layers = engine.gpu_layers;
        self.flash_attention = engine.flash_attention;
        self.binary_name = engine.binary.clone();
    }

    /// Current engine settings as stored on the node.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            context_size: self.context_size,
            gpu_layers: self.gpu_layers,
            flash_attention: self.flash_attention,
            binary: self.binary_name.clone(),
            model: self.configured_model.clone(),
            extra_flags: Vec::new(),
        }
    }
}
