//! COMMANDER Test Utilities
//!
//! Shared test infrastructure for the COMMANDER workspace:
//! - Proptest generators for envelopes, nodes and configuration
//! - Fixtures for registries and sync harnesses
//! - Assertions on the error taxonomy

// Re-export the in-process relay from its source crate
pub use commander_storage::MockRelayTransport;

pub use commander_core::{
    CommanderError, CommanderResult, EnvelopeQuery, MessageEnvelope, MessageType, Node, NodeId,
    NodeRole, NodeSpec, NodeStatus, RegistryError, RetryConfig, SyncConfig, Timestamp,
    ValidationError,
};

use std::time::Duration;

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for COMMANDER types.

    use super::*;
    use proptest::prelude::*;

    /// Node ids shaped like the ones in `cluster.yaml`.
    pub fn arb_node_id() -> impl Strategy<Value = NodeId> {
        "[a-z][a-z0-9-]{0,11}"
    }

    pub fn arb_task_id() -> impl Strategy<Value = String> {
        "task-[0-9a-f]{1,8}"
    }

    pub fn arb_node_role() -> impl Strategy<Value = NodeRole> {
        prop_oneof![
            Just(NodeRole::Orchestrator),
            Just(NodeRole::Relay),
            Just(NodeRole::Worker),
        ]
    }

    pub fn arb_node_status() -> impl Strategy<Value = NodeStatus> {
        prop_oneof![
            Just(NodeStatus::Unknown),
            Just(NodeStatus::Starting),
            Just(NodeStatus::Ready),
            Just(NodeStatus::Offline),
            Just(NodeStatus::Error),
        ]
    }

    pub fn arb_message_type() -> impl Strategy<Value = MessageType> {
        prop_oneof![
            Just(MessageType::Command),
            Just(MessageType::Response),
            Just(MessageType::Query),
            Just(MessageType::Event),
            Just(MessageType::Error),
            Just(MessageType::Heartbeat),
        ]
    }

    pub fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..512)
    }

    /// Priority inside the default hierarchy bounds (0..=2).
    pub fn arb_priority() -> impl Strategy<Value = i32> {
        0i32..=2
    }

    /// A well-formed envelope: its hash matches its content.
    pub fn arb_envelope() -> impl Strategy<Value = MessageEnvelope> {
        (
            arb_node_id(),
            arb_node_id(),
            prop::option::of(arb_task_id()),
            arb_priority(),
            arb_message_type(),
            arb_payload(),
        )
            .prop_map(|(sender, recipient, task_id, priority, kind, payload)| {
                let mut builder = MessageEnvelope::builder(sender, recipient, kind)
                    .priority(priority)
                    .payload(payload);
                if let Some(task_id) = task_id {
                    builder = builder.task_id(task_id);
                }
                builder.build()
            })
    }

    pub fn arb_retry_config() -> impl Strategy<Value = RetryConfig> {
        (0u32..10, 1u64..1000, 1000u64..60000, 1.0f32..4.0).prop_map(
            |(max_retries, initial_ms, max_ms, multiplier)| RetryConfig {
                max_retries,
                initial_backoff: Duration::from_millis(initial_ms),
                max_backoff: Duration::from_millis(max_ms),
                backoff_multiplier: multiplier,
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;
    use chrono::Utc;
    use commander_agents::NodeRegistry;
    use commander_storage::{LocalStore, RelayStore, RelaySyncEngine};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Sync settings with millisecond timeouts and backoff, for tests that
    /// wait on retries.
    pub fn fast_sync_config() -> SyncConfig {
        SyncConfig {
            push_timeout: Duration::from_millis(50),
            batch_timeout: Duration::from_millis(200),
            query_timeout: Duration::from_millis(200),
            batch_size: 100,
            upload_interval: Duration::from_millis(20),
            retry: RetryConfig {
                max_retries: 3,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(40),
                backoff_multiplier: 2.0,
            },
            ..SyncConfig::default()
        }
    }

    /// A node's sync engine wired to an in-process relay.
    pub struct SyncHarness {
        pub dir: TempDir,
        pub relay: Arc<MockRelayTransport>,
        pub engine: Arc<RelaySyncEngine>,
    }

    impl SyncHarness {
        pub fn new(node_id: &str) -> Self {
            Self::with_config(node_id, fast_sync_config())
        }

        pub fn with_config(node_id: &str, config: SyncConfig) -> Self {
            let dir = TempDir::new().unwrap_or_else(|e| panic!("tempdir: {e}"));
            let local = Arc::new(
                LocalStore::open(dir.path().join("local"), 32)
                    .unwrap_or_else(|e| panic!("local store: {e}")),
            );
            let relay_store = Arc::new(
                RelayStore::open(dir.path().join("relay"), 32)
                    .unwrap_or_else(|e| panic!("relay store: {e}")),
            );
            let relay = Arc::new(MockRelayTransport::new(relay_store));
            let engine = Arc::new(RelaySyncEngine::new(node_id, local, relay.clone(), config));
            Self { dir, relay, engine }
        }

        pub fn relay_store(&self) -> &Arc<RelayStore> {
            self.relay.store()
        }
    }

    /// Event envelope whose payload is `n`, so envelopes differ by `n` only.
    pub fn numbered_envelope(sender: &str, n: u32) -> MessageEnvelope {
        MessageEnvelope::builder(sender, "relay", MessageType::Event)
            .task_id("task-1")
            .payload(n.to_be_bytes().to_vec())
            .build()
    }

    /// Command envelope with a JSON body.
    pub fn command_envelope(sender: &str, recipient: &str, task_id: &str) -> MessageEnvelope {
        MessageEnvelope::builder(sender, recipient, MessageType::Command)
            .task_id(task_id)
            .json_payload(&serde_json::json!({ "command": "summarize", "params": {} }))
            .build()
    }

    /// Register a node and drive it to READY with a fresh heartbeat.
    pub fn ready_node(registry: &NodeRegistry, id: &str, score: u32, role: NodeRole) {
        registry
            .register(NodeSpec::new(id, score, role))
            .unwrap_or_else(|e| panic!("register {id}: {e}"));
        registry
            .start(id)
            .unwrap_or_else(|e| panic!("start {id}: {e}"));
        registry
            .mark_ready(id, Utc::now())
            .unwrap_or_else(|e| panic!("ready {id}: {e}"));
    }

    /// Two READY workers: `htpc` (130 tok/s) and `laptop` (60 tok/s), plus
    /// the orchestrator `main`.
    pub fn two_worker_registry() -> NodeRegistry {
        let registry = NodeRegistry::new();
        ready_node(&registry, "main", 40, NodeRole::Orchestrator);
        ready_node(&registry, "htpc", 130, NodeRole::Worker);
        ready_node(&registry, "laptop", 60, NodeRole::Worker);
        registry
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on the COMMANDER error taxonomy.

    use super::*;

    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &CommanderResult<T>) {
        match result {
            Err(CommanderError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_unknown_node<T: std::fmt::Debug>(result: &CommanderResult<T>, node_id: &str) {
        match result {
            Err(CommanderError::Registry(RegistryError::UnknownNode { node_id: id })) => {
                assert_eq!(id, node_id, "Wrong node id in UnknownNode error");
            }
            other => panic!("Expected UnknownNode for {node_id}, got: {:?}", other),
        }
    }

    /// Envelopes are in creation order, as relay queries return them.
    #[track_caller]
    pub fn assert_creation_order(envelopes: &[MessageEnvelope]) {
        for pair in envelopes.windows(2) {
            assert!(
                (pair[0].created_at, pair[0].id) <= (pair[1].created_at, pair[1].id),
                "Envelope {} precedes {} but was created later",
                pair[0].id,
                pair[1].id
            );
        }
    }
}
