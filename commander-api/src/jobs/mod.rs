//! Background Jobs
//!
//! One tokio task per background responsibility:
//!
//! - `outbox_uploader`: drains the durable outbox to the relay
//! - `heartbeat_monitor`: forces silent nodes OFFLINE, announces this node
//! - `broadcast_loop`: drives the state broadcaster
//! - `config_watcher`: hot-reloads `cluster.yaml` and `roles.yaml`
//!
//! Every task takes a `watch::Receiver<bool>` and exits once it reads
//! `true`, returning its metrics.
//!
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let handles = jobs::spawn_all(&state, watcher, shutdown_rx);
//! // ...
//! let _ = shutdown_tx.send(true);
//! handles.join().await;
//! ```

pub mod broadcast_loop;
pub mod config_watcher;
pub mod heartbeat_monitor;
pub mod outbox_uploader;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::state::AppState;

pub use broadcast_loop::{broadcast_task, BroadcastLoopMetrics};
pub use config_watcher::{config_watcher_task, ConfigWatcher, ConfigWatcherConfig, ConfigWatcherMetrics};
pub use heartbeat_monitor::{heartbeat_monitor_task, HeartbeatMonitorConfig, HeartbeatMonitorMetrics};
pub use outbox_uploader::{outbox_uploader_task, OutboxUploaderConfig, OutboxUploaderMetrics};

/// Handles of the spawned background tasks.
pub struct JobHandles {
    pub outbox_uploader: Option<JoinHandle<Arc<OutboxUploaderMetrics>>>,
    pub heartbeat_monitor: JoinHandle<Arc<HeartbeatMonitorMetrics>>,
    pub broadcaster: JoinHandle<Arc<BroadcastLoopMetrics>>,
    pub config_watcher: JoinHandle<Arc<ConfigWatcherMetrics>>,
}

impl JobHandles {
    /// Wait for every task to finish after shutdown was signalled.
    pub async fn join(self) {
        if let Some(uploader) = self.outbox_uploader {
            log_join("outbox_uploader", uploader.await.map(|_| ()));
        }
        log_join("heartbeat_monitor", self.heartbeat_monitor.await.map(|_| ()));
        log_join("broadcaster", self.broadcaster.await.map(|_| ()));
        log_join("config_watcher", self.config_watcher.await.map(|_| ()));
    }
}

fn log_join(job: &str, result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::error!(job = job, error = %e, "Background job panicked");
    }
}

/// Spawn every background task for `state`. The uploader only runs when
/// this process hosts a local store.
pub fn spawn_all(
    state: &AppState,
    watcher: ConfigWatcher,
    shutdown_rx: watch::Receiver<bool>,
) -> JobHandles {
    let outbox_uploader = state.sync.as_ref().map(|sync| {
        tokio::spawn(outbox_uploader_task(
            Arc::clone(sync),
            OutboxUploaderConfig::from_api_config(&state.config),
            shutdown_rx.clone(),
        ))
    });

    let heartbeat_monitor = tokio::spawn(heartbeat_monitor_task(
        Arc::clone(&state.registry),
        Arc::clone(&state.controller),
        state.sync.clone(),
        HeartbeatMonitorConfig::from_api_config(&state.config),
        shutdown_rx.clone(),
    ));

    let broadcaster = tokio::spawn(broadcast_task(
        Arc::clone(&state.broadcaster),
        shutdown_rx.clone(),
    ));

    let config_watcher = tokio::spawn(config_watcher_task(watcher, shutdown_rx));

    JobHandles {
        outbox_uploader,
        heartbeat_monitor,
        broadcaster,
        config_watcher,
    }
}
