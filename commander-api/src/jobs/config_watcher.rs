//! Configuration Watcher Background Task
//!
//! Polls the modification times of `cluster.yaml` and `roles.yaml`. When a
//! file changes it is re-parsed and validated, then applied:
//!
//! - `roles.yaml`: the role hierarchy is replaced
//! - `cluster.yaml`: every node entry is registered (new nodes are added,
//!   existing nodes keep their status and get their static fields refreshed)
//!
//! A file that fails to parse or validate is logged and skipped; the
//! previously applied configuration stays active. Roles are applied before
//! the cluster so node entries are checked against the newest hierarchy.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use commander_agents::NodeRegistry;
use commander_core::{ClusterConfig, CommanderResult, NodeRole, RoleTable};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::ApiConfig;

#[derive(Debug, Clone)]
pub struct ConfigWatcherConfig {
    pub cluster_file: PathBuf,
    pub roles_file: PathBuf,
    pub poll_interval: Duration,
}

impl ConfigWatcherConfig {
    pub fn from_api_config(config: &ApiConfig) -> Self {
        Self {
            cluster_file: config.cluster_file(),
            roles_file: config.roles_file(),
            poll_interval: config.config_poll_interval,
        }
    }
}

#[derive(Debug, Default)]
pub struct ConfigWatcherMetrics {
    pub polls: AtomicU64,
    pub cluster_reloads: AtomicU64,
    pub roles_reloads: AtomicU64,
    /// Changed files that were rejected.
    pub rejected: AtomicU64,
}

impl ConfigWatcherMetrics {
    pub fn snapshot(&self) -> ConfigWatcherSnapshot {
        ConfigWatcherSnapshot {
            polls: self.polls.load(Ordering::Relaxed),
            cluster_reloads: self.cluster_reloads.load(Ordering::Relaxed),
            roles_reloads: self.roles_reloads.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigWatcherSnapshot {
    pub polls: u64,
    pub cluster_reloads: u64,
    pub roles_reloads: u64,
    pub rejected: u64,
}

/// Tracks the last seen modification time of each file.
pub struct ConfigWatcher {
    registry: Arc<NodeRegistry>,
    config: ConfigWatcherConfig,
    cluster_seen: Option<SystemTime>,
    roles_seen: Option<SystemTime>,
    metrics: Arc<ConfigWatcherMetrics>,
}

impl ConfigWatcher {
    pub fn new(registry: Arc<NodeRegistry>, config: ConfigWatcherConfig) -> Self {
        Self {
            registry,
            config,
            cluster_seen: None,
            roles_seen: None,
            metrics: Arc::new(ConfigWatcherMetrics::default()),
        }
    }

    pub fn metrics(&self) -> &Arc<ConfigWatcherMetrics> {
        &self.metrics
    }

    /// Check both files once and apply whichever changed.
    pub fn poll_once(&mut self) {
        self.metrics.polls.fetch_add(1, Ordering::Relaxed);

        if let Some(mtime) = changed_since(&self.config.roles_file, self.roles_seen) {
            // Remember the mtime even on failure so a broken file is reported once.
            self.roles_seen = Some(mtime);
            match self.apply_roles() {
                Ok(()) => {
                    self.metrics.roles_reloads.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        path = %self.config.roles_file.display(),
                        error = %e,
                        "Rejected role table, keeping previous roles"
                    );
                }
            }
        }

        if let Some(mtime) = changed_since(&self.config.cluster_file, self.cluster_seen) {
            self.cluster_seen = Some(mtime);
            match self.apply_cluster() {
                Ok(count) => {
                    self.metrics.cluster_reloads.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(nodes = count, "Cluster configuration applied");
                }
                Err(e) => {
                    self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        path = %self.config.cluster_file.display(),
                        error = %e,
                        "Rejected cluster configuration, keeping previous nodes"
                    );
                }
            }
        }
    }

    fn apply_roles(&self) -> CommanderResult<()> {
        let table = RoleTable::load(&self.config.roles_file)?;
        let hierarchy = table.hierarchy()?;
        tracing::info!(roles = ?hierarchy.ordered(), "Role table applied");
        self.registry.set_roles(hierarchy)?;
        Ok(())
    }

    /// Validate the whole file before touching the registry, so a rejected
    /// file applies nothing.
    fn apply_cluster(&self) -> CommanderResult<usize> {
        let cluster = ClusterConfig::load(&self.config.cluster_file)?;
        let mut specs = cluster.node_specs();
        // Demotions first, so a moved orchestrator role never overlaps.
        specs.sort_by_key(|spec| spec.role == NodeRole::Orchestrator);
        let count = specs.len();
        for spec in specs {
            self.registry.register(spec)?;
        }
        Ok(count)
    }
}

/// Modification time of `path` if it differs from `seen`; `None` when the
/// file is missing or unchanged.
fn changed_since(path: &Path, seen: Option<SystemTime>) -> Option<SystemTime> {
    let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    (seen != Some(mtime)).then_some(mtime)
}

pub async fn config_watcher_task(
    mut watcher: ConfigWatcher,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<ConfigWatcherMetrics> {
    let mut poll_interval = interval(watcher.config.poll_interval);
    poll_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        cluster_file = %watcher.config.cluster_file.display(),
        roles_file = %watcher.config.roles_file.display(),
        poll_interval_secs = watcher.config.poll_interval.as_secs(),
        "Config watcher started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Config watcher shutting down");
                    break;
                }
            }

            _ = poll_interval.tick() => {
                watcher.poll_once();
            }
        }
    }

    Arc::clone(&watcher.metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use commander_core::NodeStatus;
    use tempfile::TempDir;

    const ROLES: &str = r#"
roles:
  orchestrator:
    name: Orchestrator
    description: Plans and delegates
    priority: 0
    can_delegate_to: [worker]
    permissions: ["*"]
  worker:
    name: Worker
    description: Executes tasks
    priority: 2
    can_delegate_to: []
    permissions: [execute]
"#;

    const CLUSTER: &str = r#"
nodes:
  - id: main
    name: Main
    host: 192.168.1.10
    port: 8080
    role: orchestrator
    tps_benchmark: 60
  - id: htpc
    name: HTPC
    host: 192.168.1.20
    port: 8080
    role: worker
    tps_benchmark: 130
"#;

    fn watcher(dir: &TempDir) -> (Arc<NodeRegistry>, ConfigWatcher) {
        let registry = Arc::new(NodeRegistry::new());
        let config = ConfigWatcherConfig {
            cluster_file: dir.path().join("cluster.yaml"),
            roles_file: dir.path().join("roles.yaml"),
            poll_interval: Duration::from_millis(10),
        };
        (Arc::clone(&registry), ConfigWatcher::new(registry, config))
    }

    /// Rewrite a file and make sure its mtime moves forward.
    fn rewrite(path: &Path, contents: &str) {
        let before = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        loop {
            std::fs::write(path, contents).unwrap();
            let after = std::fs::metadata(path).and_then(|m| m.modified()).ok();
            if after != before {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_initial_poll_registers_nodes_and_roles() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("roles.yaml"), ROLES).unwrap();
        std::fs::write(dir.path().join("cluster.yaml"), CLUSTER).unwrap();
        let (registry, mut watcher) = watcher(&dir);

        watcher.poll_once();

        let nodes = registry.list_nodes().unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| n.status == NodeStatus::Unknown));
        assert_eq!(registry.roles().unwrap().rank("worker"), Some(2));
        let snapshot = watcher.metrics().snapshot();
        assert_eq!(snapshot.cluster_reloads, 1);
        assert_eq!(snapshot.roles_reloads, 1);
    }

    #[test]
    fn test_unchanged_files_are_not_reapplied() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("cluster.yaml"), CLUSTER).unwrap();
        let (_registry, mut watcher) = watcher(&dir);

        watcher.poll_once();
        watcher.poll_once();
        let snapshot = watcher.metrics().snapshot();
        assert_eq!(snapshot.polls, 2);
        assert_eq!(snapshot.cluster_reloads, 1);
    }

    #[test]
    fn test_invalid_cluster_keeps_previous_nodes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster.yaml");
        std::fs::write(&path, CLUSTER).unwrap();
        let (registry, mut watcher) = watcher(&dir);
        watcher.poll_once();

        // a second orchestrator is rejected by validation
        let broken = format!(
            "{CLUSTER}  - id: laptop\n    name: Laptop\n    host: 192.168.1.30\n    port: 8080\n    role: orchestrator\n    tps_benchmark: 10\n"
        );
        rewrite(&path, &broken);
        watcher.poll_once();

        assert_eq!(registry.list_nodes().unwrap().len(), 2);
        assert!(registry.get_node("laptop").is_err());
        assert_eq!(watcher.metrics().snapshot().rejected, 1);
    }

    #[test]
    fn test_orchestrator_can_move_between_nodes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster.yaml");
        std::fs::write(&path, CLUSTER).unwrap();
        let (registry, mut watcher) = watcher(&dir);
        watcher.poll_once();

        let swapped = CLUSTER
            .replace("role: orchestrator", "role: placeholder")
            .replace("role: worker", "role: orchestrator")
            .replace("role: placeholder", "role: worker");
        rewrite(&path, &swapped);
        watcher.poll_once();

        assert_eq!(registry.get_node("htpc").unwrap().role, NodeRole::Orchestrator);
        assert_eq!(registry.get_node("main").unwrap().role, NodeRole::Worker);
        assert_eq!(watcher.metrics().snapshot().rejected, 0);
    }

    #[test]
    fn test_missing_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let (registry, mut watcher) = watcher(&dir);
        watcher.poll_once();
        assert!(registry.list_nodes().unwrap().is_empty());
        assert_eq!(watcher.metrics().snapshot().rejected, 0);
    }
}
