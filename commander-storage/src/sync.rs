//! Relay sync engine: local-first dual write with a durable outbox.
//!
//! # Write path
//! 1. Synchronous LMDB write keyed by content hash, outbox record included
//! 2. Fire-and-forget push to the relay on a spawned task, bounded by a timeout
//! 3. Ack clears the outbox record; failure hands it to the uploader
//!
//! The caller returns after step 1 and never waits on the network.
//!
//! # Retries
//! Outages and timeouts retry with capped backoff until the relay is back.
//! Only explicit relay rejections spend the retry budget; a record rejected
//! `max_retries` times is flagged failed and holds back its node's later
//! records until replayed.
//!
//! # Read path
//! 1. Local store
//! 2. Relay on a local miss, then cache the result locally

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use commander_core::{
    CommanderResult, DeliveryError, EnvelopeQuery, HealthCheck, MessageEnvelope, NodeId,
    RelayBatch, SyncConfig, ValidationError,
};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use uuid::Uuid;

use crate::local_store::{FailureKind, InsertOutcome, LocalStore, OutboxStats};
use crate::transport::RelayTransport;

/// Outbox size above which the outbox health check reports degraded.
const OUTBOX_BACKLOG_WARN: u64 = 500;

// ============================================================================
// METRICS
// ============================================================================

/// Counters for sync activity since startup.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub writes: AtomicU64,
    pub duplicates: AtomicU64,
    pub pushes_ok: AtomicU64,
    pub push_failures: AtomicU64,
    pub batches_ok: AtomicU64,
    pub batch_failures: AtomicU64,
    /// Records rejected until their retry budget ran out.
    pub records_failed: AtomicU64,
    pub remote_reads: AtomicU64,
}

impl SyncMetrics {
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            writes: self.writes.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            pushes_ok: self.pushes_ok.load(Ordering::Relaxed),
            push_failures: self.push_failures.load(Ordering::Relaxed),
            batches_ok: self.batches_ok.load(Ordering::Relaxed),
            batch_failures: self.batch_failures.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            remote_reads: self.remote_reads.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SyncMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncMetricsSnapshot {
    pub writes: u64,
    pub duplicates: u64,
    pub pushes_ok: u64,
    pub push_failures: u64,
    pub batches_ok: u64,
    pub batch_failures: u64,
    pub records_failed: u64,
    pub remote_reads: u64,
}

// ============================================================================
// RESULTS
// ============================================================================

/// Result of a local write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Durable locally; relay delivery is under way.
    Stored { content_hash: String },
    /// Already stored; nothing changed.
    Duplicate { content_hash: String },
}

impl WriteOutcome {
    pub fn content_hash(&self) -> &str {
        match self {
            WriteOutcome::Stored { content_hash } | WriteOutcome::Duplicate { content_hash } => {
                content_hash
            }
        }
    }
}

/// Result of one uploaded batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub node_id: NodeId,
    pub size: usize,
    pub delivered: bool,
    /// Set when a rejection exhausted the retry budget of some records.
    pub permanent: Option<DeliveryError>,
}

/// Aggregate of an upload pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadReport {
    pub batches: usize,
    pub delivered: usize,
    pub retried: usize,
    pub permanent: Vec<DeliveryError>,
}

/// Sync engine statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub node_id: NodeId,
    pub local_envelopes: u64,
    pub outbox: OutboxStats,
    /// Age in milliseconds of the oldest pending outbox record.
    pub outbox_lag_ms: Option<i64>,
    pub metrics: SyncMetricsSnapshot,
}

// ============================================================================
// ENGINE
// ============================================================================

/// Local-first dual-write engine for one node.
pub struct RelaySyncEngine {
    node_id: NodeId,
    local: Arc<LocalStore>,
    transport: Arc<dyn RelayTransport>,
    config: SyncConfig,
    metrics: Arc<SyncMetrics>,
    changes: watch::Sender<u64>,
    upload_wake: Arc<Notify>,
}

impl RelaySyncEngine {
    pub fn new(
        node_id: impl Into<String>,
        local: Arc<LocalStore>,
        transport: Arc<dyn RelayTransport>,
        config: SyncConfig,
    ) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            node_id: node_id.into(),
            local,
            transport,
            config,
            metrics: Arc::new(SyncMetrics::default()),
            changes,
            upload_wake: Arc::new(Notify::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    /// Ticks whenever a new envelope lands in the local store.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Notified when a fresh push fails and the uploader should run early.
    pub fn upload_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.upload_wake)
    }

    fn bump_changes(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Write an envelope locally and start relay delivery.
    ///
    /// Returns once the local write is durable. A duplicate content hash is a
    /// successful no-op. Remote failures never surface here; they land in the
    /// outbox.
    pub fn write(&self, envelope: MessageEnvelope) -> CommanderResult<WriteOutcome> {
        let actual = envelope.compute_hash();
        if actual != envelope.content_hash {
            return Err(ValidationError::ContentHashMismatch {
                expected: envelope.content_hash.clone(),
                actual,
            }
            .into());
        }

        let runtime = tokio::runtime::Handle::try_current().ok();
        let now = Utc::now();
        // Keep the uploader off the record while the immediate push is in flight.
        let first_attempt_at = match runtime {
            Some(_) => {
                now + chrono::Duration::from_std(self.config.push_timeout * 2)
                    .unwrap_or_else(|_| chrono::Duration::seconds(4))
            }
            None => now,
        };

        let content_hash = envelope.content_hash.clone();
        let order_key = match self
            .local
            .insert_local(&self.node_id, &envelope, first_attempt_at)?
        {
            InsertOutcome::Duplicate => {
                self.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(content_hash = %content_hash, "Duplicate envelope ignored");
                return Ok(WriteOutcome::Duplicate { content_hash });
            }
            InsertOutcome::Inserted { order_key } => order_key,
        };

        self.metrics.writes.fetch_add(1, Ordering::Relaxed);
        self.bump_changes();

        if let Some(handle) = runtime {
            let local = Arc::clone(&self.local);
            let transport = Arc::clone(&self.transport);
            let metrics = Arc::clone(&self.metrics);
            let wake = Arc::clone(&self.upload_wake);
            let push_timeout = self.config.push_timeout;
            handle.spawn(async move {
                let reason = match timeout(push_timeout, transport.push(&envelope)).await {
                    Ok(Ok(_)) => {
                        metrics.pushes_ok.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = local.ack(&[order_key]) {
                            tracing::error!(error = %e, "Failed to mark envelope synced");
                        }
                        return;
                    }
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => format!("push timed out after {}ms", push_timeout.as_millis()),
                };
                metrics.push_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    content_hash = %envelope.content_hash,
                    reason = %reason,
                    "Immediate push failed, deferring to outbox"
                );
                if let Err(e) = local.release_for_upload(&order_key, &reason) {
                    tracing::error!(error = %e, "Failed to release outbox record");
                }
                wake.notify_one();
            });
        }

        Ok(WriteOutcome::Stored { content_hash })
    }

    /// Upload one batch of due outbox records.
    ///
    /// Returns `None` when nothing is due.
    pub async fn upload_batch(&self) -> CommanderResult<Option<BatchReport>> {
        let now = Utc::now();
        let due = self.local.due_outbox(now, self.config.batch_size)?;
        let Some((_, first)) = due.first() else {
            return Ok(None);
        };
        let node_id = first.node_id.clone();
        let (keys, envelopes): (Vec<String>, Vec<MessageEnvelope>) = due
            .into_iter()
            .filter(|(_, r)| r.node_id == node_id)
            .map(|(k, r)| (k, r.payload))
            .unzip();

        let batch = RelayBatch {
            batch_id: Uuid::now_v7(),
            node_id: node_id.clone(),
            envelopes,
        };
        let size = keys.len();
        self.local.mark_sending(&keys, batch.batch_id)?;

        let result = timeout(self.config.batch_timeout, self.transport.push_batch(&batch)).await;
        let (reason, kind) = match result {
            Ok(Ok(ack)) => {
                self.local.ack(&keys)?;
                self.metrics.batches_ok.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    batch_id = %batch.batch_id,
                    node_id = %node_id,
                    accepted = ack.accepted,
                    duplicates = ack.duplicates,
                    replayed = ack.replayed,
                    "Outbox batch delivered"
                );
                return Ok(Some(BatchReport {
                    batch_id: batch.batch_id,
                    node_id,
                    size,
                    delivered: true,
                    permanent: None,
                }));
            }
            Ok(Err(e)) => {
                let kind = if e.is_retryable() {
                    FailureKind::Transient
                } else {
                    FailureKind::Rejected
                };
                (e.to_string(), kind)
            }
            Err(_) => (
                format!(
                    "batch timed out after {}ms",
                    self.config.batch_timeout.as_millis()
                ),
                FailureKind::Transient,
            ),
        };

        self.metrics.batch_failures.fetch_add(1, Ordering::Relaxed);
        let failures =
            self.local
                .record_failure(&keys, &reason, kind, &self.config.retry, Utc::now())?;
        let exhausted: Vec<_> = failures.iter().filter(|f| f.exhausted).collect();
        let permanent = if exhausted.is_empty() {
            tracing::warn!(
                batch_id = %batch.batch_id,
                node_id = %node_id,
                size,
                kind = ?kind,
                reason = %reason,
                "Outbox batch failed, will retry"
            );
            None
        } else {
            self.metrics
                .records_failed
                .fetch_add(exhausted.len() as u64, Ordering::Relaxed);
            let attempts = exhausted.iter().map(|f| f.retry_count).max().unwrap_or(0);
            tracing::error!(
                batch_id = %batch.batch_id,
                node_id = %node_id,
                failed_records = exhausted.len(),
                attempts,
                reason = %reason,
                "Outbox retry budget exhausted, records retained for replay"
            );
            Some(DeliveryError::Permanent {
                batch_id: batch.batch_id,
                attempts,
                reason,
            })
        };

        Ok(Some(BatchReport {
            batch_id: batch.batch_id,
            node_id,
            size,
            delivered: false,
            permanent,
        }))
    }

    /// Upload due batches until the outbox has nothing due, a batch fails,
    /// or `max_batches` have been sent.
    pub async fn upload_pass(&self, max_batches: usize) -> CommanderResult<UploadReport> {
        let mut report = UploadReport::default();
        while report.batches < max_batches {
            let Some(batch) = self.upload_batch().await? else {
                break;
            };
            report.batches += 1;
            if batch.delivered {
                report.delivered += batch.size;
                continue;
            }
            report.retried += batch.size;
            if let Some(err) = batch.permanent {
                report.permanent.push(err);
            }
            break;
        }
        Ok(report)
    }

    /// Read one envelope, local first, falling back to the relay.
    pub async fn read(&self, content_hash: &str) -> CommanderResult<Option<MessageEnvelope>> {
        if let Some(record) = self.local.get(content_hash)? {
            return Ok(Some(record.envelope));
        }
        self.metrics.remote_reads.fetch_add(1, Ordering::Relaxed);
        let fetched = match timeout(self.config.query_timeout, self.transport.fetch(content_hash)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DeliveryError::Transient {
                    reason: "relay read timed out".to_string(),
                }
                .into())
            }
        };
        if let Some(envelope) = &fetched {
            if self.local.cache_remote(std::slice::from_ref(envelope))? > 0 {
                self.bump_changes();
            }
        }
        Ok(fetched)
    }

    /// Query envelopes, local first. A local miss is answered by the relay
    /// and the results are cached.
    pub async fn query(&self, query: &EnvelopeQuery) -> CommanderResult<Vec<MessageEnvelope>> {
        let local = self.local.query(query)?;
        if !local.is_empty() {
            return Ok(local);
        }
        self.metrics.remote_reads.fetch_add(1, Ordering::Relaxed);
        let page = match timeout(self.config.query_timeout, self.transport.query(query)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DeliveryError::Transient {
                    reason: "relay query timed out".to_string(),
                }
                .into())
            }
        };
        if self.local.cache_remote(&page.envelopes)? > 0 {
            self.bump_changes();
        }
        Ok(page.envelopes)
    }

    /// Return failed outbox records to pending for another round.
    pub fn replay_failed(&self) -> CommanderResult<usize> {
        let count = self.local.replay_failed()?;
        if count > 0 {
            tracing::info!(records = count, "Failed outbox records queued for replay");
            self.upload_wake.notify_one();
        }
        Ok(count)
    }

    /// Drop synced envelopes older than the retention window.
    pub fn prune(&self) -> CommanderResult<usize> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(30));
        Ok(self.local.prune_synced(Utc::now() - retention)?)
    }

    pub fn stats(&self) -> CommanderResult<SyncStats> {
        let outbox = self.local.outbox_stats()?;
        let outbox_lag_ms = outbox
            .oldest_pending
            .map(|t| (Utc::now() - t).num_milliseconds().max(0));
        Ok(SyncStats {
            node_id: self.node_id.clone(),
            local_envelopes: self.local.envelope_count()?,
            outbox,
            outbox_lag_ms,
            metrics: self.metrics.snapshot(),
        })
    }

    /// Component checks for the local store, relay reachability and outbox.
    pub async fn health(&self) -> Vec<HealthCheck> {
        let mut checks = Vec::with_capacity(3);

        match self.local.envelope_count() {
            Ok(count) => checks.push(
                HealthCheck::healthy("local_store").with_detail("envelopes", count.into()),
            ),
            Err(e) => checks.push(HealthCheck::unhealthy("local_store", e.to_string())),
        }

        match timeout(self.config.push_timeout, self.transport.ping()).await {
            Ok(Ok(())) => checks.push(HealthCheck::healthy("relay")),
            Ok(Err(e)) => checks.push(HealthCheck::degraded("relay", e.to_string())),
            Err(_) => checks.push(HealthCheck::degraded("relay", "ping timed out")),
        }

        match self.local.outbox_stats() {
            Ok(stats) => {
                let check = if stats.failed > 0 {
                    HealthCheck::degraded(
                        "outbox",
                        format!("{} records exhausted retries", stats.failed),
                    )
                } else if stats.pending > OUTBOX_BACKLOG_WARN {
                    HealthCheck::degraded("outbox", format!("{} records pending", stats.pending))
                } else {
                    HealthCheck::healthy("outbox")
                };
                checks.push(
                    check
                        .with_detail("pending", stats.pending.into())
                        .with_detail("failed", stats.failed.into()),
                );
            }
            Err(e) => checks.push(HealthCheck::unhealthy("outbox", e.to_string())),
        }

        checks
    }
}
