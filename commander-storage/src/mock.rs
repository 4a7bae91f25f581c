//! In-process relay transport with a switchable outage, for tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use commander_core::{BatchAck, DeliveryError, EnvelopeQuery, MessageEnvelope, RelayBatch};

use crate::relay_store::{RelayPage, RelayStore};
use crate::transport::{EmbeddedRelay, PushOutcome, RelayTransport};

/// Wraps an [`EmbeddedRelay`]; while marked down every call fails with a
/// transient error, while rejecting every push is refused with a 422, and an
/// optional delay simulates a slow link.
pub struct MockRelayTransport {
    inner: EmbeddedRelay,
    available: AtomicBool,
    rejecting: AtomicBool,
    delay_ms: AtomicU64,
    pushes: AtomicU64,
    batches: AtomicU64,
}

impl MockRelayTransport {
    pub fn new(store: Arc<RelayStore>) -> Self {
        Self {
            inner: EmbeddedRelay::new(store),
            available: AtomicBool::new(true),
            rejecting: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            pushes: AtomicU64::new(0),
            batches: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Refuse pushes as a relay that answers but rejects the payload.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Single-envelope pushes attempted.
    pub fn push_attempts(&self) -> u64 {
        self.pushes.load(Ordering::SeqCst)
    }

    /// Batch pushes attempted.
    pub fn batch_attempts(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<RelayStore> {
        self.inner.store()
    }

    async fn gate(&self) -> Result<(), DeliveryError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DeliveryError::Transient {
                reason: "relay unreachable".to_string(),
            })
        }
    }

    fn check_rejecting(&self) -> Result<(), DeliveryError> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(DeliveryError::Rejected {
                status: 422,
                message: "payload refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RelayTransport for MockRelayTransport {
    async fn push(&self, envelope: &MessageEnvelope) -> Result<PushOutcome, DeliveryError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        self.check_rejecting()?;
        self.inner.push(envelope).await
    }

    async fn push_batch(&self, batch: &RelayBatch) -> Result<BatchAck, DeliveryError> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        self.check_rejecting()?;
        self.inner.push_batch(batch).await
    }

    async fn query(&self, query: &EnvelopeQuery) -> Result<RelayPage, DeliveryError> {
        self.gate().await?;
        self.inner.query(query).await
    }

    async fn fetch(&self, content_hash: &str) -> Result<Option<MessageEnvelope>, DeliveryError> {
        self.gate().await?;
        self.inner.fetch(content_hash).await
    }

    async fn ping(&self) -> Result<(), DeliveryError> {
        self.gate().await?;
        self.inner.ping().await
    }
}
