//! Heartbeat Monitor Background Task
//!
//! Two duties on separate intervals:
//!
//! - sweep: READY nodes whose last heartbeat is older than their tier's
//!   timeout are forced OFFLINE, which also removes their agents
//! - announce: heartbeat for this process's own node, sent only while its
//!   engine is running. With a local store the heartbeat is written as an
//!   envelope, so it reaches the relay and keeps this node alive in every
//!   process watching the relay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use commander_agents::{EngineController, NodeRegistry};
use commander_core::{HeartbeatConfig, MessageEnvelope, NodeId, RegistryError};
use commander_storage::RelaySyncEngine;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::ApiConfig;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct HeartbeatMonitorConfig {
    pub heartbeat: HeartbeatConfig,
    pub local_node_id: NodeId,
    pub announce_interval: Duration,
}

impl HeartbeatMonitorConfig {
    pub fn from_api_config(config: &ApiConfig) -> Self {
        Self {
            heartbeat: config.heartbeat.clone(),
            local_node_id: config.local_node_id.clone(),
            announce_interval: config.heartbeat_interval,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct HeartbeatMonitorMetrics {
    pub sweeps: AtomicU64,
    pub nodes_timed_out: AtomicU64,
    pub heartbeats_sent: AtomicU64,
    pub heartbeats_skipped: AtomicU64,
    pub errors: AtomicU64,
}

impl HeartbeatMonitorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HeartbeatMonitorSnapshot {
        HeartbeatMonitorSnapshot {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            nodes_timed_out: self.nodes_timed_out.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeats_skipped: self.heartbeats_skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatMonitorSnapshot {
    pub sweeps: u64,
    pub nodes_timed_out: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_skipped: u64,
    pub errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

pub async fn heartbeat_monitor_task(
    registry: Arc<NodeRegistry>,
    controller: Arc<EngineController>,
    sync: Option<Arc<RelaySyncEngine>>,
    config: HeartbeatMonitorConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<HeartbeatMonitorMetrics> {
    let metrics = Arc::new(HeartbeatMonitorMetrics::new());

    let mut sweep_interval = interval(config.heartbeat.sweep_interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut announce_interval = interval(config.announce_interval);
    announce_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        sweep_interval_ms = config.heartbeat.sweep_interval.as_millis() as u64,
        fallback_timeout_secs = config.heartbeat.fallback_timeout.as_secs(),
        local_node_id = %config.local_node_id,
        "Heartbeat monitor started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Heartbeat monitor shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                sweep(&registry, &config.heartbeat, &metrics);
            }

            _ = announce_interval.tick() => {
                let engine_alive = controller.is_running(&config.local_node_id);
                announce(&registry, sync.as_deref(), &config.local_node_id, engine_alive, &metrics);
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        sweeps = snapshot.sweeps,
        nodes_timed_out = snapshot.nodes_timed_out,
        heartbeats_sent = snapshot.heartbeats_sent,
        "Heartbeat monitor completed"
    );

    metrics
}

/// One sweep. Returns the number of nodes forced OFFLINE.
pub fn sweep(
    registry: &NodeRegistry,
    config: &HeartbeatConfig,
    metrics: &HeartbeatMonitorMetrics,
) -> usize {
    metrics.sweeps.fetch_add(1, Ordering::Relaxed);
    match registry.sweep_stale(Utc::now(), config) {
        Ok(events) => {
            for event in &events {
                tracing::warn!(node_id = %event.node_id(), "Node missed heartbeat, marked offline");
            }
            metrics
                .nodes_timed_out
                .fetch_add(events.len() as u64, Ordering::Relaxed);
            events.len()
        }
        Err(e) => {
            tracing::error!(error = %e, "Heartbeat sweep failed");
            metrics.errors.fetch_add(1, Ordering::Relaxed);
            0
        }
    }
}

/// Heartbeat for the local node. Skipped while the node's engine is not
/// running, so a dead engine times out like any silent node. An
/// unregistered local node is skipped too.
pub fn announce(
    registry: &NodeRegistry,
    sync: Option<&RelaySyncEngine>,
    local_node_id: &str,
    engine_alive: bool,
    metrics: &HeartbeatMonitorMetrics,
) {
    if !engine_alive {
        tracing::trace!(node_id = %local_node_id, "Local engine not running, skipping heartbeat");
        metrics.heartbeats_skipped.fetch_add(1, Ordering::Relaxed);
        return;
    }
    match registry.heartbeat(local_node_id, Utc::now()) {
        Ok(_) => {}
        Err(RegistryError::UnknownNode { .. }) => {
            tracing::trace!(node_id = %local_node_id, "Local node not registered, skipping heartbeat");
            return;
        }
        Err(e) => {
            tracing::error!(node_id = %local_node_id, error = %e, "Failed to record heartbeat");
            metrics.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }

    if let Some(sync) = sync {
        let envelope = MessageEnvelope::heartbeat(local_node_id, "relay");
        if let Err(e) = sync.write(envelope) {
            tracing::error!(node_id = %local_node_id, error = %e, "Failed to write heartbeat");
            metrics.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }
    metrics.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use commander_core::{NodeRole, NodeSpec, NodeStatus};
    use commander_test_utils::fixtures::SyncHarness;

    fn ready_node(registry: &NodeRegistry, id: &str, score: u32, at: chrono::DateTime<Utc>) {
        registry.register(NodeSpec::new(id, score, NodeRole::Worker)).unwrap();
        registry.start(id).unwrap();
        registry.mark_ready(id, at).unwrap();
    }

    #[test]
    fn test_sweep_marks_silent_node_offline() {
        let registry = NodeRegistry::new();
        let long_ago = Utc::now() - chrono::Duration::seconds(120);
        ready_node(&registry, "laptop", 10, long_ago);
        ready_node(&registry, "htpc", 130, Utc::now());

        let metrics = HeartbeatMonitorMetrics::new();
        let config = HeartbeatConfig::default();
        assert_eq!(sweep(&registry, &config, &metrics), 1);

        assert_eq!(registry.get_node("laptop").unwrap().status, NodeStatus::Offline);
        assert_eq!(registry.get_node("htpc").unwrap().status, NodeStatus::Ready);
        assert_eq!(metrics.snapshot().nodes_timed_out, 1);
    }

    #[test]
    fn test_announce_keeps_local_node_alive() {
        let registry = NodeRegistry::new();
        let stale = Utc::now() - chrono::Duration::seconds(50);
        ready_node(&registry, "main", 130, stale);

        let metrics = HeartbeatMonitorMetrics::new();
        announce(&registry, None, "main", true, &metrics);
        assert_eq!(sweep(&registry, &HeartbeatConfig::default(), &metrics), 0);
        assert_eq!(registry.get_node("main").unwrap().status, NodeStatus::Ready);
        assert_eq!(metrics.snapshot().heartbeats_sent, 1);
    }

    #[test]
    fn test_announce_skips_unregistered_local_node() {
        let registry = NodeRegistry::new();
        let metrics = HeartbeatMonitorMetrics::new();
        announce(&registry, None, "main", true, &metrics);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.heartbeats_sent, 0);
        assert_eq!(snapshot.errors, 0);
    }

    #[test]
    fn test_dead_engine_gets_no_heartbeat_and_times_out() {
        let registry = NodeRegistry::new();
        let stale = Utc::now() - chrono::Duration::seconds(50);
        ready_node(&registry, "main", 130, stale);

        let harness = SyncHarness::new("main");
        let metrics = HeartbeatMonitorMetrics::new();
        announce(&registry, Some(&harness.engine), "main", false, &metrics);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.heartbeats_sent, 0);
        assert_eq!(snapshot.heartbeats_skipped, 1);
        assert_eq!(harness.engine.local().outbox_len().unwrap(), 0);
        assert_eq!(sweep(&registry, &HeartbeatConfig::default(), &metrics), 1);
        assert_eq!(registry.get_node("main").unwrap().status, NodeStatus::Offline);
    }
}
