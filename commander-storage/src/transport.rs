//! Relay transport abstraction.
//!
//! The sync engine talks to the relay only through [`RelayTransport`]. The
//! HTTP client lives in commander-api; [`EmbeddedRelay`] serves a relay store
//! hosted in the same process.

use std::sync::Arc;

use async_trait::async_trait;
use commander_core::{BatchAck, DeliveryError, EnvelopeQuery, MessageEnvelope, RelayBatch};

use crate::relay_store::{RelayInsert, RelayPage, RelayStore};

/// Outcome of pushing a single envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Stored,
    /// The relay already had this content hash.
    Duplicate,
}

/// Network seam between a node and the relay.
///
/// Implementations do not apply timeouts themselves; the sync engine wraps
/// every call in one.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Push one envelope (`POST /relay/immediate`).
    async fn push(&self, envelope: &MessageEnvelope) -> Result<PushOutcome, DeliveryError>;

    /// Push a batch (`POST /relay/batch`).
    async fn push_batch(&self, batch: &RelayBatch) -> Result<BatchAck, DeliveryError>;

    /// Query the relay (`GET /relay/query`).
    async fn query(&self, query: &EnvelopeQuery) -> Result<RelayPage, DeliveryError>;

    /// Fetch one envelope by content hash.
    async fn fetch(&self, content_hash: &str) -> Result<Option<MessageEnvelope>, DeliveryError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), DeliveryError>;
}

/// Relay store hosted in this process.
pub struct EmbeddedRelay {
    store: Arc<RelayStore>,
}

impl EmbeddedRelay {
    pub fn new(store: Arc<RelayStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<RelayStore> {
        &self.store
    }
}

fn storage_failure(e: commander_core::StorageError) -> DeliveryError {
    DeliveryError::Transient {
        reason: e.to_string(),
    }
}

#[async_trait]
impl RelayTransport for EmbeddedRelay {
    async fn push(&self, envelope: &MessageEnvelope) -> Result<PushOutcome, DeliveryError> {
        match self.store.insert(envelope).map_err(storage_failure)? {
            RelayInsert::Stored => Ok(PushOutcome::Stored),
            RelayInsert::Duplicate => Ok(PushOutcome::Duplicate),
        }
    }

    async fn push_batch(&self, batch: &RelayBatch) -> Result<BatchAck, DeliveryError> {
        self.store.insert_batch(batch).map_err(storage_failure)
    }

    async fn query(&self, query: &EnvelopeQuery) -> Result<RelayPage, DeliveryError> {
        self.store.query(query).map_err(storage_failure)
    }

    async fn fetch(&self, content_hash: &str) -> Result<Option<MessageEnvelope>, DeliveryError> {
        self.store.get(content_hash).map_err(storage_failure)
    }

    async fn ping(&self) -> Result<(), DeliveryError> {
        self.store.count().map(|_| ()).map_err(storage_failure)
    }
}
