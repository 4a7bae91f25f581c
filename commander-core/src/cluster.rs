//! Persisted cluster configuration: the node table and the role table.
//!
//! Both files are YAML. Every struct rejects unknown fields, and `validate`
//! runs at load time so a malformed file never replaces a working config.

use crate::{ConfigError, EngineSettings, NodeRole, NodeSpec, RoleHierarchy};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

// ============================================================================
// NODE TABLE
// ============================================================================

/// Relay endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelaySection {
    #[serde(default = "default_relay_host")]
    pub host: String,
    #[serde(default = "default_relay_port")]
    pub port: u16,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
}

fn default_relay_host() -> String {
    "127.0.0.1".to_string()
}

fn default_relay_port() -> u16 {
    8001
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_connection_timeout() -> u64 {
    30
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            host: default_relay_host(),
            port: default_relay_port(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            connection_timeout_secs: default_connection_timeout(),
        }
    }
}

impl RelaySection {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Engine block of a node entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineEntry {
    pub binary: String,
    #[serde(default)]
    pub model_file: String,
    #[serde(default = "default_ctx")]
    pub ctx: u32,
    #[serde(default = "default_ngl")]
    pub ngl: u32,
    #[serde(default = "default_true")]
    pub fa: bool,
    #[serde(default)]
    pub extra_flags: Vec<String>,
}

fn default_ctx() -> u32 {
    4096
}

fn default_ngl() -> u32 {
    999
}

fn default_true() -> bool {
    true
}

fn default_max_agents() -> u32 {
    4
}

impl From<&EngineEntry> for EngineSettings {
    fn from(entry: &EngineEntry) -> Self {
        EngineSettings {
            context_size: entry.ctx,
            gpu_layers: entry.ngl,
            flash_attention: entry.fa,
            binary: entry.binary.clone(),
            model: entry.model_file.clone(),
            extra_flags: entry.extra_flags.clone(),
        }
    }
}

/// One row of the node table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub role: NodeRole,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_agents")]
    pub max_agents: u32,
    /// Tokens/sec baseline.
    #[serde(default)]
    pub tps_benchmark: u32,
    #[serde(default)]
    pub model_root: String,
    #[serde(default)]
    pub engine: Option<EngineEntry>,
}

impl NodeEntry {
    pub fn to_spec(&self) -> NodeSpec {
        NodeSpec {
            id: self.id.clone(),
            display_name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            network_address: format!("{}:{}", self.host, self.port),
            benchmark_score: self.tps_benchmark,
            role: self.role,
            enabled: self.enabled,
            max_agents: self.max_agents,
            model_root: self.model_root.clone(),
            engine: self.engine.as_ref().map(EngineSettings::from).unwrap_or_default(),
        }
    }
}

/// `cluster.yaml`: relay settings and the node table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
}

impl ClusterConfig {
    pub fn from_yaml(yaml: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: ClusterConfig = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let yaml = read_file(path)?;
        Self::from_yaml(&yaml, &path.display().to_string())
    }

    /// Reject duplicate ids, blank fields and a second orchestrator.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        let mut orchestrator: Option<&str> = None;
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "nodes[].id".to_string(),
                });
            }
            if !seen.insert(node.id.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "nodes[].id".to_string(),
                    value: node.id.clone(),
                    reason: "duplicate node id".to_string(),
                });
            }
            if node.host.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: format!("nodes.{}.host", node.id),
                });
            }
            if node.role == NodeRole::Orchestrator {
                if let Some(existing) = orchestrator {
                    return Err(ConfigError::InvalidValue {
                        field: format!("nodes.{}.role", node.id),
                        value: "orchestrator".to_string(),
                        reason: format!("orchestrator already assigned to {}", existing),
                    });
                }
                orchestrator = Some(node.id.as_str());
            }
            if let Some(engine) = &node.engine {
                if engine.binary.trim().is_empty() {
                    return Err(ConfigError::MissingRequired {
                        field: format!("nodes.{}.engine.binary", node.id),
                    });
                }
                if engine.ctx == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: format!("nodes.{}.engine.ctx", node.id),
                        value: "0".to_string(),
                        reason: "context size must be positive".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn node_specs(&self) -> Vec<NodeSpec> {
        self.nodes.iter().map(NodeEntry::to_spec).collect()
    }
}

// ============================================================================
// ROLE TABLE
// ============================================================================

/// One role definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Rank in the hierarchy; 0 is the most authoritative.
    pub priority: i32,
    #[serde(default)]
    pub can_delegate_to: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// `roles.yaml`: role id -> definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleTable {
    pub roles: BTreeMap<String, RoleEntry>,
}

impl RoleTable {
    pub fn from_yaml(yaml: &str, origin: &str) -> Result<Self, ConfigError> {
        let table: RoleTable = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            reason: e.to_string(),
        })?;
        table.validate()?;
        Ok(table)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let yaml = read_file(path)?;
        Self::from_yaml(&yaml, &path.display().to_string())
    }

    /// Ranks must form a strict order and delegation targets must exist.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.hierarchy()?;
        for (id, role) in &self.roles {
            for target in &role.can_delegate_to {
                if !self.roles.contains_key(target) {
                    return Err(ConfigError::InvalidValue {
                        field: format!("roles.{}.can_delegate_to", id),
                        value: target.clone(),
                        reason: "unknown role".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn hierarchy(&self) -> Result<RoleHierarchy, ConfigError> {
        RoleHierarchy::from_ranks(self.roles.iter().map(|(id, r)| (id.clone(), r.priority)))
    }

    pub fn has_permission(&self, role: &str, permission: &str) -> bool {
        self.roles
            .get(role)
            .is_some_and(|r| r.permissions.iter().any(|p| p == permission || p == "*"))
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}
