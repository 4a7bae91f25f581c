//! Broadcaster Background Task
//!
//! Drives [`Broadcaster::tick`] on the broadcast interval, and immediately
//! when the registry reports a significant change or the local store gains
//! envelopes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::broadcast::Broadcaster;

#[derive(Debug, Default)]
pub struct BroadcastLoopMetrics {
    pub interval_ticks: AtomicU64,
    pub signalled_ticks: AtomicU64,
    pub errors: AtomicU64,
}

impl BroadcastLoopMetrics {
    pub fn snapshot(&self) -> BroadcastLoopSnapshot {
        BroadcastLoopSnapshot {
            interval_ticks: self.interval_ticks.load(Ordering::Relaxed),
            signalled_ticks: self.signalled_ticks.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastLoopSnapshot {
    pub interval_ticks: u64,
    pub signalled_ticks: u64,
    pub errors: u64,
}

pub async fn broadcast_task(
    broadcaster: Arc<Broadcaster>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<BroadcastLoopMetrics> {
    let metrics = Arc::new(BroadcastLoopMetrics::default());
    let registry_changed = broadcaster.registry().change_signal();
    let mut store_changes = broadcaster.sync().map(|s| s.subscribe_changes());

    let mut tick_interval = interval(broadcaster.config().interval);
    tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_ms = broadcaster.config().interval.as_millis() as u64,
        capacity = broadcaster.config().channel_capacity,
        "Broadcaster started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Broadcaster shutting down");
                    break;
                }
            }

            _ = tick_interval.tick() => {
                metrics.interval_ticks.fetch_add(1, Ordering::Relaxed);
                tick(&broadcaster, &metrics).await;
            }

            _ = registry_changed.notified() => {
                metrics.signalled_ticks.fetch_add(1, Ordering::Relaxed);
                tick(&broadcaster, &metrics).await;
            }

            changed = store_changed(&mut store_changes) => {
                if changed {
                    metrics.signalled_ticks.fetch_add(1, Ordering::Relaxed);
                    tick(&broadcaster, &metrics).await;
                } else {
                    // sender gone; stop watching
                    store_changes = None;
                }
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        interval_ticks = snapshot.interval_ticks,
        signalled_ticks = snapshot.signalled_ticks,
        errors = snapshot.errors,
        "Broadcaster completed"
    );
    metrics
}

/// Resolves when the store reports a change; never resolves without a store.
async fn store_changed(rx: &mut Option<watch::Receiver<u64>>) -> bool {
    match rx {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

async fn tick(broadcaster: &Broadcaster, metrics: &BroadcastLoopMetrics) {
    match broadcaster.tick().await {
        Ok(report) if !report.is_empty() => {
            tracing::trace!(
                state_frame = report.state_frame,
                envelopes = report.envelopes,
                "Broadcast tick emitted"
            );
        }
        Ok(_) => {}
        Err(e) => {
            tracing::error!(error = %e, "Broadcast tick failed");
            metrics.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}
