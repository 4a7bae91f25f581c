//! State broadcaster.
//!
//! Keeps the last emitted view of the registry and the envelope stream, and
//! turns changes into frames on a `tokio::sync::broadcast` channel:
//!
//! - a new subscriber gets a full snapshot of exactly the last emitted state
//! - everyone else gets diffs: changed/removed nodes and agents, and the
//!   envelopes written since the previous frame
//!
//! Diff frames are numbered under the state lock, so every subscriber
//! observes consecutive sequences. Snapshot frames carry the sequence of
//! the last diff they include and never advance the counter.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use commander_agents::NodeRegistry;
use commander_core::{Agent, AgentId, BroadcastConfig, CommanderResult, Node, NodeId};
use commander_storage::{order_key, OutboxStats, RelaySyncEngine};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

use crate::events::{MessagesData, StateData, StreamFrame};
use crate::telemetry::metrics::metrics;

/// Envelopes carried by one `new_messages` frame at most; the rest follow
/// on the next tick.
const MAX_ENVELOPES_PER_FRAME: usize = 500;

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct BroadcastMetrics {
    pub ticks: AtomicU64,
    pub frames_sent: AtomicU64,
    pub snapshots_sent: AtomicU64,
    pub subscribers_dropped: AtomicU64,
}

impl BroadcastMetrics {
    pub fn snapshot(&self) -> BroadcastMetricsSnapshot {
        BroadcastMetricsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            snapshots_sent: self.snapshots_sent.load(Ordering::Relaxed),
            subscribers_dropped: self.subscribers_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastMetricsSnapshot {
    pub ticks: u64,
    pub frames_sent: u64,
    pub snapshots_sent: u64,
    pub subscribers_dropped: u64,
}

/// What one tick emitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub state_frame: bool,
    pub envelopes: usize,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        !self.state_frame && self.envelopes == 0
    }
}

// ============================================================================
// BROADCASTER
// ============================================================================

#[derive(Debug, Default)]
struct LastEmitted {
    nodes: BTreeMap<NodeId, Node>,
    agents: BTreeMap<AgentId, Agent>,
    outbox: Option<OutboxStats>,
    /// Order key of the newest envelope already announced.
    cursor: Option<String>,
    /// Set once the cursor has been positioned at the store head.
    primed: bool,
}

/// A new stream subscription.
pub struct Subscription {
    /// Full snapshot: a `state_update` frame, then a `new_messages` frame
    /// with recent envelopes when this process hosts a local store.
    pub snapshot: Vec<StreamFrame>,
    pub receiver: broadcast::Receiver<Arc<StreamFrame>>,
}

pub struct Broadcaster {
    tx: broadcast::Sender<Arc<StreamFrame>>,
    sequence: AtomicU64,
    last: Mutex<LastEmitted>,
    registry: Arc<NodeRegistry>,
    sync: Option<Arc<RelaySyncEngine>>,
    config: BroadcastConfig,
    metrics: Arc<BroadcastMetrics>,
}

impl Broadcaster {
    pub fn new(
        registry: Arc<NodeRegistry>,
        sync: Option<Arc<RelaySyncEngine>>,
        config: BroadcastConfig,
    ) -> Self {
        let (tx, _rx) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            tx,
            sequence: AtomicU64::new(0),
            last: Mutex::new(LastEmitted::default()),
            registry,
            sync,
            config,
            metrics: Arc::new(BroadcastMetrics::default()),
        }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn sync(&self) -> Option<&Arc<RelaySyncEngine>> {
        self.sync.as_ref()
    }

    pub fn metrics(&self) -> &Arc<BroadcastMetrics> {
        &self.metrics
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Record a subscriber disconnected for lagging.
    pub fn record_dropped(&self) {
        self.metrics.subscribers_dropped.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = metrics() {
            m.subscriber_dropped();
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    fn emit(&self, frame: StreamFrame) {
        if let Some(m) = metrics() {
            m.record_frame(frame.kind.as_str());
        }
        self.metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
        // No receivers is fine; the frame is simply dropped.
        let _ = self.tx.send(Arc::new(frame));
    }

    /// Join the stream.
    ///
    /// Pending changes are flushed to existing subscribers first, so the
    /// returned snapshot equals the last emitted state and the receiver's
    /// next frame is a diff against it.
    pub async fn subscribe(&self) -> CommanderResult<Subscription> {
        let mut last = self.last.lock().await;
        self.flush(&mut last)?;

        let receiver = self.tx.subscribe();
        let snapshot = self.snapshot_frames(&last)?;
        self.metrics.snapshots_sent.fetch_add(1, Ordering::Relaxed);
        Ok(Subscription { snapshot, receiver })
    }

    /// Emit whatever changed since the last frame.
    pub async fn tick(&self) -> CommanderResult<TickReport> {
        self.metrics.ticks.fetch_add(1, Ordering::Relaxed);
        let mut last = self.last.lock().await;
        self.flush(&mut last)
    }

    fn snapshot_frames(&self, last: &LastEmitted) -> CommanderResult<Vec<StreamFrame>> {
        let state = StateData {
            full: true,
            nodes: last.nodes.values().cloned().collect(),
            agents: last.agents.values().cloned().collect(),
            removed_nodes: Vec::new(),
            removed_agents: Vec::new(),
            outbox: last.outbox.clone(),
        };
        let sequence = self.current_sequence();
        let mut frames = vec![StreamFrame::state(sequence, Utc::now(), state)];

        if let Some(sync) = &self.sync {
            let (recent, _) = sync.local().recent(self.config.recent_envelopes)?;
            // Anything past the cursor arrives in the next diff.
            let envelopes = match &last.cursor {
                Some(cursor) => recent
                    .into_iter()
                    .filter(|e| order_key(e).as_str() <= cursor.as_str())
                    .collect(),
                None => Vec::new(),
            };
            frames.push(StreamFrame::messages(
                sequence,
                Utc::now(),
                MessagesData {
                    full: true,
                    envelopes,
                },
            ));
        }
        Ok(frames)
    }

    fn flush(&self, last: &mut LastEmitted) -> CommanderResult<TickReport> {
        let mut report = TickReport::default();

        let snapshot = self.registry.snapshot()?;
        let outbox = match &self.sync {
            Some(sync) => Some(sync.local().outbox_stats()?),
            None => None,
        };
        if let (Some(sync), Some(stats), Some(m)) = (&self.sync, &outbox, metrics()) {
            m.record_sync(stats, &sync.metrics().snapshot());
        }

        let nodes: BTreeMap<NodeId, Node> = snapshot
            .nodes
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();
        let agents: BTreeMap<AgentId, Agent> = snapshot
            .agents
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect();

        let changed_nodes = changed(&last.nodes, &nodes);
        let removed_nodes = removed(&last.nodes, &nodes);
        let changed_agents = changed(&last.agents, &agents);
        let removed_agents = removed(&last.agents, &agents);
        let outbox_changed = outbox != last.outbox;

        if let Some(m) = metrics() {
            for node in &changed_nodes {
                let prev = last.nodes.get(&node.id).map(|n| n.status);
                if prev != Some(node.status) {
                    m.record_node_transition(node.status.as_str());
                }
            }
        }

        if !changed_nodes.is_empty()
            || !removed_nodes.is_empty()
            || !changed_agents.is_empty()
            || !removed_agents.is_empty()
            || outbox_changed
        {
            let state = StateData {
                full: false,
                nodes: changed_nodes,
                agents: changed_agents,
                removed_nodes,
                removed_agents,
                outbox: outbox.clone(),
            };
            self.emit(StreamFrame::state(self.next_sequence(), Utc::now(), state));
            report.state_frame = true;
        }
        last.nodes = nodes;
        last.agents = agents;
        last.outbox = outbox;

        if let Some(sync) = &self.sync {
            if !last.primed {
                // History before startup belongs to snapshots, not diffs.
                let (_, newest) = sync.local().recent(1)?;
                last.cursor = newest;
                last.primed = true;
            }
            let fresh = sync
                .local()
                .since(last.cursor.as_deref(), MAX_ENVELOPES_PER_FRAME)?;
            if let Some((key, _)) = fresh.last() {
                last.cursor = Some(key.clone());
                let envelopes: Vec<_> = fresh.into_iter().map(|(_, e)| e).collect();
                report.envelopes = envelopes.len();
                self.emit(StreamFrame::messages(
                    self.next_sequence(),
                    Utc::now(),
                    MessagesData {
                        full: false,
                        envelopes,
                    },
                ));
            }
        }

        Ok(report)
    }
}

fn changed<K: Ord + Clone, V: Clone + PartialEq>(
    before: &BTreeMap<K, V>,
    after: &BTreeMap<K, V>,
) -> Vec<V> {
    after
        .iter()
        .filter(|(k, v)| before.get(*k) != Some(*v))
        .map(|(_, v)| v.clone())
        .collect()
}

fn removed<K: Ord + Clone, V>(before: &BTreeMap<K, V>, after: &BTreeMap<K, V>) -> Vec<K> {
    before
        .keys()
        .filter(|k| !after.contains_key(*k))
        .cloned()
        .collect()
}
