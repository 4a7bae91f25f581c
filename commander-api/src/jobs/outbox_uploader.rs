//! Outbox Uploader Background Task
//!
//! Drains the durable outbox to the relay. Each pass uploads due batches
//! until the outbox has nothing due, a batch fails, or the pass limit is
//! reached. A pass is triggered by:
//!
//! - the upload interval
//! - the sync engine's upload signal (an immediate push just failed)
//!
//! Synced records older than the retention window are pruned on a slower
//! interval. On shutdown the in-flight pass completes before the task exits,
//! so no batch is left half acknowledged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use commander_storage::RelaySyncEngine;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::ApiConfig;
use crate::constants::{DEFAULT_PRUNE_INTERVAL_SECS, DEFAULT_UPLOAD_MAX_BATCHES};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct OutboxUploaderConfig {
    /// How often to poll the outbox when nothing signals.
    pub upload_interval: Duration,
    /// Batches per pass at most.
    pub max_batches: usize,
    pub prune_interval: Duration,
}

impl Default for OutboxUploaderConfig {
    fn default() -> Self {
        Self {
            upload_interval: Duration::from_secs(5),
            max_batches: DEFAULT_UPLOAD_MAX_BATCHES,
            prune_interval: Duration::from_secs(DEFAULT_PRUNE_INTERVAL_SECS),
        }
    }
}

impl OutboxUploaderConfig {
    pub fn from_api_config(config: &ApiConfig) -> Self {
        Self {
            upload_interval: config.sync.upload_interval,
            max_batches: config.upload_max_batches.max(1),
            prune_interval: config.prune_interval,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct OutboxUploaderMetrics {
    pub passes: AtomicU64,
    pub batches: AtomicU64,
    pub envelopes_delivered: AtomicU64,
    pub envelopes_retried: AtomicU64,
    /// Records that exhausted their retry budget.
    pub permanent_failures: AtomicU64,
    pub envelopes_pruned: AtomicU64,
    pub errors: AtomicU64,
}

impl OutboxUploaderMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> OutboxUploaderSnapshot {
        OutboxUploaderSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            envelopes_delivered: self.envelopes_delivered.load(Ordering::Relaxed),
            envelopes_retried: self.envelopes_retried.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            envelopes_pruned: self.envelopes_pruned.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboxUploaderSnapshot {
    pub passes: u64,
    pub batches: u64,
    pub envelopes_delivered: u64,
    pub envelopes_retried: u64,
    pub permanent_failures: u64,
    pub envelopes_pruned: u64,
    pub errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Runs until the shutdown signal is received; returns the task's metrics.
pub async fn outbox_uploader_task(
    sync: Arc<RelaySyncEngine>,
    config: OutboxUploaderConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<OutboxUploaderMetrics> {
    let metrics = Arc::new(OutboxUploaderMetrics::new());
    let wake = sync.upload_signal();

    let mut upload_interval = interval(config.upload_interval);
    upload_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut prune_interval = interval(config.prune_interval);
    prune_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        node_id = %sync.node_id(),
        upload_interval_ms = config.upload_interval.as_millis() as u64,
        max_batches = config.max_batches,
        "Outbox uploader started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Outbox uploader shutting down");
                    break;
                }
            }

            _ = upload_interval.tick() => {
                upload_pass(&sync, &config, &metrics).await;
            }

            _ = wake.notified() => {
                upload_pass(&sync, &config, &metrics).await;
            }

            _ = prune_interval.tick() => {
                prune(&sync, &metrics);
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        passes = snapshot.passes,
        batches = snapshot.batches,
        delivered = snapshot.envelopes_delivered,
        retried = snapshot.envelopes_retried,
        permanent_failures = snapshot.permanent_failures,
        "Outbox uploader completed"
    );

    metrics
}

/// One upload pass. Public so callers (and tests) can drain on demand.
pub async fn upload_pass(
    sync: &RelaySyncEngine,
    config: &OutboxUploaderConfig,
    metrics: &OutboxUploaderMetrics,
) {
    metrics.passes.fetch_add(1, Ordering::Relaxed);
    match sync.upload_pass(config.max_batches).await {
        Ok(report) => {
            metrics.batches.fetch_add(report.batches as u64, Ordering::Relaxed);
            metrics
                .envelopes_delivered
                .fetch_add(report.delivered as u64, Ordering::Relaxed);
            metrics
                .envelopes_retried
                .fetch_add(report.retried as u64, Ordering::Relaxed);
            metrics
                .permanent_failures
                .fetch_add(report.permanent.len() as u64, Ordering::Relaxed);

            for err in &report.permanent {
                tracing::error!(error = %err, "Outbox records exhausted retries");
            }
            if report.batches > 0 {
                tracing::debug!(
                    batches = report.batches,
                    delivered = report.delivered,
                    retried = report.retried,
                    "Outbox upload pass completed"
                );
            } else {
                tracing::trace!("Outbox upload pass found nothing due");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Outbox upload pass failed");
            metrics.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn prune(sync: &RelaySyncEngine, metrics: &OutboxUploaderMetrics) {
    match sync.prune() {
        Ok(0) => {}
        Ok(count) => {
            metrics
                .envelopes_pruned
                .fetch_add(count as u64, Ordering::Relaxed);
            tracing::info!(envelopes = count, "Pruned synced envelopes");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to prune local store");
            metrics.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commander_test_utils::fixtures::{numbered_envelope, SyncHarness};

    #[tokio::test]
    async fn test_pass_drains_outbox_after_relay_recovers() {
        let h = SyncHarness::new("main");
        h.relay.set_available(false);

        for i in 0..5u32 {
            h.engine.write(numbered_envelope("main", i)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.relay_store().count().unwrap(), 0);

        h.relay.set_available(true);
        let config = OutboxUploaderConfig::default();
        let metrics = OutboxUploaderMetrics::new();
        for _ in 0..50 {
            upload_pass(&h.engine, &config, &metrics).await;
            if h.engine.stats().unwrap().outbox.total() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(h.engine.stats().unwrap().outbox.total(), 0);
        assert_eq!(h.relay_store().count().unwrap(), 5);
        let snapshot = metrics.snapshot();
        assert!(snapshot.passes >= 1);
        assert_eq!(snapshot.envelopes_delivered, 5);
        assert_eq!(snapshot.errors, 0);
    }

    #[tokio::test]
    async fn test_task_exits_on_shutdown() {
        let h = SyncHarness::new("main");
        let (tx, rx) = watch::channel(false);
        let config = OutboxUploaderConfig {
            upload_interval: Duration::from_millis(10),
            ..OutboxUploaderConfig::default()
        };
        let handle = tokio::spawn(outbox_uploader_task(Arc::clone(&h.engine), config, rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let metrics = handle.await.unwrap();
        assert!(metrics.snapshot().passes >= 1);
    }
}
