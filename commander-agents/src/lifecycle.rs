//! Engine lifecycle controller.
//!
//! Each node gets one long-lived executor task, created on first use. Requests
//! replace the node's *desired state* in a `watch` channel, so requests that
//! arrive while a re-ignition is in flight coalesce: the executor applies only
//! the latest one once the current re-ignition finishes. Executors of
//! different nodes run concurrently.
//!
//! A re-ignition runs these steps:
//! 1. Stop the running engine (graceful, force kill after the grace period)
//! 2. Persist the new settings
//! 3. Spawn the engine with translated flags
//! 4. Await readiness up to the ready timeout
//! 5. Mark the node READY, or ERROR with captured diagnostics
//!
//! After READY the executor keeps watching the engine. An engine that exits
//! on its own moves the node to ERROR with the exit diagnostics.
//!
//! Only the node this process runs on is managed here. Requests for any
//! other node fail with [`LifecycleError::NotLocal`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use commander_core::{
    CommanderResult, EngineSettings, LifecycleConfig, LifecycleError, Node, NodeId, NodeStatus,
    RegistryError, ValidationError,
};
use dashmap::{DashMap, DashSet};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::registry::{NodeRegistry, RegistryEvent};

// ============================================================================
// SEAMS
// ============================================================================

/// A running engine process.
#[async_trait]
pub trait EngineHandle: Send {
    /// Wait until the engine reports ready, it exits, or `timeout` elapses.
    async fn wait_ready(&mut self, timeout: Duration) -> Result<(), LifecycleError>;

    /// Ask the engine to exit; force kill it after `grace`.
    async fn stop(&mut self, grace: Duration) -> Result<(), LifecycleError>;

    /// Resolves once the engine has exited on its own. Must be cancel safe.
    async fn exited(&mut self) -> LifecycleError;

    /// Recent process output.
    fn diagnostics(&self) -> String;
}

/// Starts engine processes for nodes.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn spawn(
        &self,
        node: &Node,
        settings: &EngineSettings,
    ) -> Result<Box<dyn EngineHandle>, LifecycleError>;
}

/// Durable per-node engine settings.
#[async_trait]
pub trait EngineConfigStore: Send + Sync {
    async fn persist(&self, node_id: &str, settings: &EngineSettings) -> Result<(), LifecycleError>;

    async fn load(&self, node_id: &str) -> Result<Option<EngineSettings>, LifecycleError>;
}

// ============================================================================
// EXECUTOR
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum DesiredState {
    Idle,
    Run(EngineSettings),
    Stop,
}

struct Executor {
    desired: watch::Sender<DesiredState>,
    task: JoinHandle<()>,
}

/// Everything an executor needs to apply a desired state.
struct Ignition {
    registry: Arc<NodeRegistry>,
    launcher: Arc<dyn EngineLauncher>,
    config_store: Arc<dyn EngineConfigStore>,
    config: LifecycleConfig,
    applied: DashMap<NodeId, EngineSettings>,
    /// Nodes whose engine reached READY and has not exited since.
    running: DashSet<NodeId>,
}

impl Ignition {
    async fn run(
        self: Arc<Self>,
        node_id: NodeId,
        mut desired: watch::Receiver<DesiredState>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut engine: Option<Box<dyn EngineHandle>> = None;
        loop {
            tokio::select! {
                changed = desired.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = desired.borrow_and_update().clone();
                    match next {
                        DesiredState::Run(settings) => self.ignite(&node_id, &mut engine, settings).await,
                        DesiredState::Stop => self.halt(&node_id, &mut engine, "stopped").await,
                        DesiredState::Idle => {}
                    }
                }
                exit = engine_exit(&mut engine) => {
                    engine = None;
                    self.running.remove(&node_id);
                    self.fail(&node_id, &exit);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if engine.is_some() {
            self.halt(&node_id, &mut engine, "controller shutdown").await;
        }
        tracing::debug!(node_id = %node_id, "Lifecycle executor exited");
    }

    async fn ignite(
        &self,
        node_id: &str,
        engine: &mut Option<Box<dyn EngineHandle>>,
        settings: EngineSettings,
    ) {
        let started = Instant::now();
        tracing::info!(
            node_id = %node_id,
            context_size = settings.context_size,
            gpu_layers = settings.gpu_layers,
            flash_attention = settings.flash_attention,
            "Re-ignition started"
        );

        if let Some(mut running) = engine.take() {
            self.running.remove(node_id);
            if let Err(e) = running.stop(self.config.stop_grace).await {
                tracing::warn!(node_id = %node_id, error = %e, "Engine stop failed");
            }
        }

        if let Err(e) = self.ensure_starting(node_id) {
            tracing::error!(node_id = %node_id, error = %e, "Cannot move node to starting");
            return;
        }

        if let Err(e) = self.config_store.persist(node_id, &settings).await {
            self.fail(node_id, &e);
            return;
        }

        let node = match self.registry.get_node(node_id) {
            Ok(node) => node,
            Err(e) => {
                tracing::error!(node_id = %node_id, error = %e, "Node vanished during re-ignition");
                return;
            }
        };

        let mut handle = match self.launcher.spawn(&node, &settings).await {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(node_id, &e);
                return;
            }
        };

        match handle.wait_ready(self.config.ready_timeout).await {
            Ok(()) => {
                if let Err(e) = self.registry.record_engine(node_id, &settings) {
                    tracing::warn!(node_id = %node_id, error = %e, "Failed to record engine settings");
                }
                self.applied.insert(node_id.to_string(), settings);
                self.running.insert(node_id.to_string());
                if let Err(e) = self.registry.mark_ready(node_id, Utc::now()) {
                    tracing::error!(node_id = %node_id, error = %e, "Failed to mark node ready");
                }
                *engine = Some(handle);
                tracing::info!(
                    node_id = %node_id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Re-ignition completed"
                );
            }
            Err(e) => {
                if let Err(stop_err) = handle.stop(self.config.stop_grace).await {
                    tracing::warn!(node_id = %node_id, error = %stop_err, "Engine stop failed");
                }
                self.fail(node_id, &e);
            }
        }
    }

    async fn halt(&self, node_id: &str, engine: &mut Option<Box<dyn EngineHandle>>, reason: &str) {
        self.running.remove(node_id);
        if let Some(mut running) = engine.take() {
            if let Err(e) = running.stop(self.config.stop_grace).await {
                tracing::warn!(node_id = %node_id, error = %e, "Engine stop failed");
            }
        }
        if let Err(e) = self.registry.mark_offline(node_id, reason) {
            tracing::warn!(node_id = %node_id, error = %e, "Failed to mark node offline");
        }
    }

    /// Put the node in STARTING. A READY node passes through OFFLINE first.
    fn ensure_starting(&self, node_id: &str) -> Result<(), RegistryError> {
        if self.registry.get_node(node_id)?.status == NodeStatus::Ready {
            self.registry.mark_offline(node_id, "re-ignition")?;
        }
        match self.registry.start(node_id) {
            Ok(_) | Err(RegistryError::AlreadyStarting { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn fail(&self, node_id: &str, error: &LifecycleError) {
        let diagnostics = match error.diagnostics() {
            Some(output) if !output.is_empty() => format!("{error}\n{output}"),
            _ => error.to_string(),
        };
        tracing::error!(node_id = %node_id, error = %error, "Re-ignition failed");
        if let Err(e) = self.registry.mark_error(node_id, diagnostics) {
            tracing::error!(node_id = %node_id, error = %e, "Failed to mark node error");
        }
    }
}

/// Pending forever while no engine runs, so the select arm stays idle.
async fn engine_exit(engine: &mut Option<Box<dyn EngineHandle>>) -> LifecycleError {
    match engine {
        Some(handle) => handle.exited().await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// CONTROLLER
// ============================================================================

/// Serializes engine re-ignitions per node.
pub struct EngineController {
    ignition: Arc<Ignition>,
    local_node_id: NodeId,
    executors: DashMap<NodeId, Executor>,
    shutdown: watch::Sender<bool>,
}

impl EngineController {
    pub fn new(
        local_node_id: impl Into<NodeId>,
        registry: Arc<NodeRegistry>,
        launcher: Arc<dyn EngineLauncher>,
        config_store: Arc<dyn EngineConfigStore>,
        config: LifecycleConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            ignition: Arc::new(Ignition {
                registry,
                launcher,
                config_store,
                config,
                applied: DashMap::new(),
                running: DashSet::new(),
            }),
            local_node_id: local_node_id.into(),
            executors: DashMap::new(),
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.ignition.registry
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    /// Whether the node's engine reached READY and is still running.
    pub fn is_running(&self, node_id: &str) -> bool {
        self.ignition.running.contains(node_id)
    }

    /// Start a node's engine with its last applied (or persisted, or
    /// registered) settings. A READY node is left alone.
    pub async fn request_start(&self, node_id: &str) -> CommanderResult<NodeStatus> {
        let node = self.ignition.registry.get_node(node_id)?;
        self.ensure_local(node_id)?;
        self.ensure_open(node_id)?;
        if let RegistryEvent::Unchanged { status, .. } = self.ignition.registry.start(node_id)? {
            return Ok(status);
        }

        let settings = match self.applied_config(node_id) {
            Some(settings) => settings,
            None => match self.ignition.config_store.load(node_id).await {
                Ok(Some(settings)) => settings,
                Ok(None) => node.engine_settings(),
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "Falling back to registered engine settings");
                    node.engine_settings()
                }
            },
        };
        self.dispatch_or_revert(node_id, DesiredState::Run(settings))?;
        Ok(NodeStatus::Starting)
    }

    /// Stop a node's engine and mark it OFFLINE.
    pub async fn request_stop(&self, node_id: &str) -> CommanderResult<NodeStatus> {
        self.ignition.registry.get_node(node_id)?;
        self.ensure_local(node_id)?;
        self.dispatch(node_id, DesiredState::Stop)?;
        Ok(NodeStatus::Offline)
    }

    /// Re-ignite a node with new settings. Requests issued while a
    /// re-ignition runs collapse into the latest one.
    pub async fn request_reconfigure(
        &self,
        node_id: &str,
        settings: EngineSettings,
    ) -> CommanderResult<NodeStatus> {
        validate_settings(&settings)?;
        let node = self.ignition.registry.get_node(node_id)?;
        self.ensure_local(node_id)?;
        self.ensure_open(node_id)?;
        if node.status == NodeStatus::Ready {
            self.dispatch(node_id, DesiredState::Run(settings))?;
            return Ok(NodeStatus::Starting);
        }
        match self.ignition.registry.start(node_id) {
            Ok(_) | Err(RegistryError::AlreadyStarting { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        self.dispatch_or_revert(node_id, DesiredState::Run(settings))?;
        Ok(NodeStatus::Starting)
    }

    /// Settings of the last successful re-ignition.
    pub fn applied_config(&self, node_id: &str) -> Option<EngineSettings> {
        self.ignition.applied.get(node_id).map(|s| s.value().clone())
    }

    /// Stop every executor, letting in-flight re-ignitions finish first.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let node_ids: Vec<NodeId> = self.executors.iter().map(|e| e.key().clone()).collect();
        for node_id in node_ids {
            if let Some((_, executor)) = self.executors.remove(&node_id) {
                if let Err(e) = executor.task.await {
                    tracing::error!(node_id = %node_id, error = %e, "Lifecycle executor panicked");
                }
            }
        }
        tracing::info!("Lifecycle controller stopped");
    }

    fn ensure_local(&self, node_id: &str) -> Result<(), LifecycleError> {
        if node_id == self.local_node_id {
            return Ok(());
        }
        tracing::warn!(
            node_id = %node_id,
            local_node_id = %self.local_node_id,
            "Refusing to manage a remote node's engine"
        );
        Err(LifecycleError::NotLocal {
            node_id: node_id.to_string(),
            local_node_id: self.local_node_id.clone(),
        })
    }

    fn ensure_open(&self, node_id: &str) -> Result<(), LifecycleError> {
        if *self.shutdown.borrow() {
            return Err(LifecycleError::ExecutorClosed {
                node_id: node_id.to_string(),
            });
        }
        Ok(())
    }

    /// Dispatch after the node was moved to STARTING. If no executor takes
    /// the request the node goes back to OFFLINE instead of staying STARTING.
    fn dispatch_or_revert(&self, node_id: &str, state: DesiredState) -> Result<(), LifecycleError> {
        let result = self.dispatch(node_id, state);
        if result.is_err() {
            if let Err(e) = self.ignition.registry.mark_offline(node_id, "start not dispatched") {
                tracing::warn!(node_id = %node_id, error = %e, "Failed to revert node after dispatch error");
            }
        }
        result
    }

    fn dispatch(&self, node_id: &str, state: DesiredState) -> Result<(), LifecycleError> {
        self.ensure_open(node_id)?;
        let executor = self
            .executors
            .entry(node_id.to_string())
            .or_insert_with(|| self.spawn_executor(node_id));
        executor
            .desired
            .send(state)
            .map_err(|_| LifecycleError::ExecutorClosed {
                node_id: node_id.to_string(),
            })
    }

    fn spawn_executor(&self, node_id: &str) -> Executor {
        let (desired, rx) = watch::channel(DesiredState::Idle);
        let task = tokio::spawn(Arc::clone(&self.ignition).run(
            node_id.to_string(),
            rx,
            self.shutdown.subscribe(),
        ));
        tracing::debug!(node_id = %node_id, "Lifecycle executor spawned");
        Executor { desired, task }
    }
}

fn validate_settings(settings: &EngineSettings) -> Result<(), ValidationError> {
    if settings.context_size == 0 {
        return Err(ValidationError::InvalidValue {
            field: "context_size".to_string(),
            reason: "must be positive".to_string(),
        });
    }
    if settings.binary.trim().is_empty() {
        return Err(ValidationError::RequiredFieldMissing {
            field: "binary".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use commander_core::{NodeRole, NodeSpec};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeLauncher {
        spawned: Mutex<Vec<EngineSettings>>,
        ready_delay: Duration,
        fail_ready: bool,
        /// Signalled to make the running engine exit on its own.
        crash: Arc<tokio::sync::Notify>,
    }

    struct FakeHandle {
        ready_delay: Duration,
        fail_ready: bool,
        crash: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl EngineHandle for FakeHandle {
        async fn wait_ready(&mut self, _timeout: Duration) -> Result<(), LifecycleError> {
            tokio::time::sleep(self.ready_delay).await;
            if self.fail_ready {
                return Err(LifecycleError::ProcessExited {
                    node_id: "htpc".to_string(),
                    code: Some(1),
                    diagnostics: self.diagnostics(),
                });
            }
            Ok(())
        }

        async fn stop(&mut self, _grace: Duration) -> Result<(), LifecycleError> {
            Ok(())
        }

        async fn exited(&mut self) -> LifecycleError {
            self.crash.notified().await;
            LifecycleError::ProcessExited {
                node_id: "htpc".to_string(),
                code: Some(139),
                diagnostics: "segmentation fault in ggml_cuda".to_string(),
            }
        }

        fn diagnostics(&self) -> String {
            "error: failed to load model".to_string()
        }
    }

    #[async_trait]
    impl EngineLauncher for FakeLauncher {
        async fn spawn(
            &self,
            _node: &Node,
            settings: &EngineSettings,
        ) -> Result<Box<dyn EngineHandle>, LifecycleError> {
            self.spawned
                .lock()
                .expect("spawn log")
                .push(settings.clone());
            Ok(Box::new(FakeHandle {
                ready_delay: self.ready_delay,
                fail_ready: self.fail_ready,
                crash: Arc::clone(&self.crash),
            }))
        }
    }

    #[derive(Default)]
    struct MemoryConfigStore {
        saved: DashMap<NodeId, EngineSettings>,
    }

    #[async_trait]
    impl EngineConfigStore for MemoryConfigStore {
        async fn persist(&self, node_id: &str, settings: &EngineSettings) -> Result<(), LifecycleError> {
            self.saved.insert(node_id.to_string(), settings.clone());
            Ok(())
        }

        async fn load(&self, node_id: &str) -> Result<Option<EngineSettings>, LifecycleError> {
            Ok(self.saved.get(node_id).map(|s| s.value().clone()))
        }
    }

    fn settings(context_size: u32) -> EngineSettings {
        EngineSettings {
            context_size,
            model: "qwen.gguf".to_string(),
            ..EngineSettings::default()
        }
    }

    fn controller(launcher: Arc<FakeLauncher>) -> (EngineController, Arc<MemoryConfigStore>) {
        let registry = Arc::new(NodeRegistry::new());
        registry
            .register(NodeSpec::new("htpc", 60, NodeRole::Worker))
            .expect("register");
        registry
            .register(NodeSpec::new("laptop", 40, NodeRole::Worker))
            .expect("register");
        let store = Arc::new(MemoryConfigStore::default());
        let controller = EngineController::new(
            "htpc",
            registry,
            launcher,
            store.clone(),
            LifecycleConfig {
                stop_grace: Duration::from_millis(10),
                ready_timeout: Duration::from_secs(1),
                ..LifecycleConfig::default()
            },
        );
        (controller, store)
    }

    async fn wait_for_status(controller: &EngineController, status: NodeStatus) {
        for _ in 0..200 {
            if controller.registry().get_node("htpc").expect("node").status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node never reached {status}");
    }

    #[tokio::test]
    async fn test_start_reaches_ready() {
        let launcher = Arc::new(FakeLauncher::default());
        let (controller, store) = controller(launcher.clone());

        let target = controller.request_start("htpc").await.expect("start");
        assert_eq!(target, NodeStatus::Starting);
        wait_for_status(&controller, NodeStatus::Ready).await;

        assert_eq!(launcher.spawned.lock().expect("log").len(), 1);
        assert!(store.saved.contains_key("htpc"));
        assert!(controller.applied_config("htpc").is_some());

        // Already READY: no second spawn
        assert_eq!(controller.request_start("htpc").await.expect("start"), NodeStatus::Ready);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_during_ignition_is_applied_after() {
        let launcher = Arc::new(FakeLauncher {
            ready_delay: Duration::from_millis(100),
            ..FakeLauncher::default()
        });
        let (controller, _store) = controller(launcher.clone());

        controller
            .request_reconfigure("htpc", settings(4096))
            .await
            .expect("r1");
        tokio::time::sleep(Duration::from_millis(30)).await;
        controller
            .request_reconfigure("htpc", settings(8192))
            .await
            .expect("r2");

        for _ in 0..200 {
            if controller.applied_config("htpc").map(|s| s.context_size) == Some(8192) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(controller.applied_config("htpc"), Some(settings(8192)));
        wait_for_status(&controller, NodeStatus::Ready).await;
        let spawned: Vec<u32> = launcher
            .spawned
            .lock()
            .expect("log")
            .iter()
            .map(|s| s.context_size)
            .collect();
        assert_eq!(spawned, vec![4096, 8192]);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_queued_requests_coalesce_to_latest() {
        let launcher = Arc::new(FakeLauncher {
            ready_delay: Duration::from_millis(100),
            ..FakeLauncher::default()
        });
        let (controller, _store) = controller(launcher.clone());

        controller.request_reconfigure("htpc", settings(2048)).await.expect("r1");
        tokio::time::sleep(Duration::from_millis(30)).await;
        controller.request_reconfigure("htpc", settings(4096)).await.expect("r2");
        controller.request_reconfigure("htpc", settings(16384)).await.expect("r3");

        for _ in 0..200 {
            if controller.applied_config("htpc").map(|s| s.context_size) == Some(16384) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let spawned: Vec<u32> = launcher
            .spawned
            .lock()
            .expect("log")
            .iter()
            .map(|s| s.context_size)
            .collect();
        assert_eq!(spawned, vec![2048, 16384]);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_ignition_marks_error_with_diagnostics() {
        let launcher = Arc::new(FakeLauncher {
            fail_ready: true,
            ..FakeLauncher::default()
        });
        let (controller, _store) = controller(launcher);

        controller.request_start("htpc").await.expect("start");
        wait_for_status(&controller, NodeStatus::Error).await;
        let node = controller.registry().get_node("htpc").expect("node");
        let reason = node.status_reason.unwrap_or_default();
        assert!(reason.contains("failed to load model"));
        assert!(controller.applied_config("htpc").is_none());
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_marks_offline() {
        let launcher = Arc::new(FakeLauncher::default());
        let (controller, _store) = controller(launcher);
        controller.request_start("htpc").await.expect("start");
        wait_for_status(&controller, NodeStatus::Ready).await;

        assert_eq!(controller.request_stop("htpc").await.expect("stop"), NodeStatus::Offline);
        wait_for_status(&controller, NodeStatus::Offline).await;
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected() {
        let (controller, _store) = controller(Arc::new(FakeLauncher::default()));
        let err = controller
            .request_reconfigure("htpc", settings(0))
            .await
            .unwrap_err();
        assert!(matches!(err, commander_core::CommanderError::Validation(_)));
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_fail() {
        let (controller, _store) = controller(Arc::new(FakeLauncher::default()));
        controller.shutdown().await;
        assert!(controller.request_stop("htpc").await.is_err());
    }

    #[tokio::test]
    async fn test_engine_exit_after_ready_marks_error() {
        let launcher = Arc::new(FakeLauncher::default());
        let (controller, _store) = controller(launcher.clone());
        controller.request_start("htpc").await.expect("start");
        wait_for_status(&controller, NodeStatus::Ready).await;
        assert!(controller.is_running("htpc"));

        launcher.crash.notify_one();
        wait_for_status(&controller, NodeStatus::Error).await;
        assert!(!controller.is_running("htpc"));
        let reason = controller
            .registry()
            .get_node("htpc")
            .expect("node")
            .status_reason
            .unwrap_or_default();
        assert!(reason.contains("segmentation fault"));

        // A new start spawns a fresh engine
        controller.request_start("htpc").await.expect("restart");
        wait_for_status(&controller, NodeStatus::Ready).await;
        assert_eq!(launcher.spawned.lock().expect("log").len(), 2);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_clears_running_engine() {
        let (controller, _store) = controller(Arc::new(FakeLauncher::default()));
        controller.request_start("htpc").await.expect("start");
        wait_for_status(&controller, NodeStatus::Ready).await;
        controller.request_stop("htpc").await.expect("stop");
        wait_for_status(&controller, NodeStatus::Offline).await;
        assert!(!controller.is_running("htpc"));
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_node_is_never_launched_locally() {
        let launcher = Arc::new(FakeLauncher::default());
        let (controller, _store) = controller(launcher.clone());

        let err = controller.request_start("laptop").await.unwrap_err();
        assert!(matches!(
            err,
            commander_core::CommanderError::Lifecycle(LifecycleError::NotLocal { ref node_id, .. })
                if node_id == "laptop"
        ));
        assert!(controller.request_stop("laptop").await.is_err());
        assert!(controller.request_reconfigure("laptop", settings(4096)).await.is_err());
        let laptop = controller.registry().get_node("laptop").expect("node");
        assert_eq!(laptop.status, NodeStatus::Unknown);
        assert!(launcher.spawned.lock().expect("log").is_empty());

        // The local node still launches
        controller.request_start("htpc").await.expect("start");
        wait_for_status(&controller, NodeStatus::Ready).await;
        assert_eq!(launcher.spawned.lock().expect("log").len(), 1);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_start_leaves_node_status_alone() {
        let (controller, _store) = controller(Arc::new(FakeLauncher::default()));
        controller.shutdown().await;

        assert!(controller.request_start("htpc").await.is_err());
        assert!(controller.request_reconfigure("htpc", settings(4096)).await.is_err());
        let node = controller.registry().get_node("htpc").expect("node");
        assert_eq!(node.status, NodeStatus::Unknown);
    }
}
