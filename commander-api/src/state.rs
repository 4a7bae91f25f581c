//! Shared application state for Axum routers.

use std::sync::Arc;
use std::time::Instant;

use commander_agents::{EngineController, FileConfigStore, NodeRegistry, ProcessLauncher, TaskBoard};
use commander_core::{CommanderResult, RoleTable};
use commander_storage::{EmbeddedRelay, LocalStore, RelayStore, RelaySyncEngine, RelayTransport};

use crate::broadcast::Broadcaster;
use crate::client::HttpRelayTransport;
use crate::config::ApiConfig;
use crate::error::{ApiError, ApiResult};

/// Application-wide state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ApiConfig>,
    pub registry: Arc<NodeRegistry>,
    pub controller: Arc<EngineController>,
    pub tasks: Arc<TaskBoard>,
    /// Local store and relay sync; present when this process is a node.
    pub sync: Option<Arc<RelaySyncEngine>>,
    /// Relay store; present when this process hosts the relay.
    pub relay: Option<Arc<RelayStore>>,
    pub broadcaster: Arc<Broadcaster>,
    pub start_time: Instant,
}

crate::impl_from_ref!(Arc<ApiConfig>, config);
crate::impl_from_ref!(Arc<NodeRegistry>, registry);
crate::impl_from_ref!(Arc<EngineController>, controller);
crate::impl_from_ref!(Arc<TaskBoard>, tasks);
crate::impl_from_ref!(Arc<Broadcaster>, broadcaster);
crate::impl_from_ref!(Instant, start_time);

impl AppState {
    /// Assemble state from already-built components.
    pub fn new(
        config: ApiConfig,
        registry: Arc<NodeRegistry>,
        controller: Arc<EngineController>,
        sync: Option<Arc<RelaySyncEngine>>,
        relay: Option<Arc<RelayStore>>,
    ) -> Self {
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::clone(&registry),
            sync.clone(),
            config.broadcast.clone(),
        ));
        Self {
            config: Arc::new(config),
            registry,
            controller,
            tasks: Arc::new(TaskBoard::new()),
            sync,
            relay,
            broadcaster,
            start_time: Instant::now(),
        }
    }

    /// Open stores and build every component from configuration.
    ///
    /// Nodes are not registered here; the config watcher's first pass does
    /// that.
    pub fn open(config: ApiConfig) -> CommanderResult<Self> {
        config.validate()?;

        let relay = if config.relay_mode.hosts_relay() || config.relay_url.is_none() {
            let path = config.relay_store_path();
            std::fs::create_dir_all(&path).map_err(|e| commander_core::StorageError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            Some(Arc::new(RelayStore::open(&path, config.map_size_mb)?))
        } else {
            None
        };

        let sync = if config.relay_mode.hosts_node() {
            let path = config.local_store_path();
            std::fs::create_dir_all(&path).map_err(|e| commander_core::StorageError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            let local = Arc::new(LocalStore::open(&path, config.map_size_mb)?);
            let transport: Arc<dyn RelayTransport> = match (&config.relay_url, &relay) {
                (Some(url), _) => Arc::new(HttpRelayTransport::new(url.clone())?),
                (None, Some(store)) => Arc::new(EmbeddedRelay::new(Arc::clone(store))),
                (None, None) => {
                    return Err(commander_core::ConfigError::MissingRequired {
                        field: "COMMANDER_RELAY_URL".to_string(),
                    }
                    .into())
                }
            };
            tracing::info!(
                node_id = %config.local_node_id,
                relay = config.relay_url.as_deref().unwrap_or("embedded"),
                "Relay sync engine ready"
            );
            Some(Arc::new(RelaySyncEngine::new(
                config.local_node_id.clone(),
                local,
                transport,
                config.sync.clone(),
            )))
        } else {
            None
        };

        let roles_file = config.roles_file();
        let registry = if roles_file.exists() {
            let roles = RoleTable::load(&roles_file)?;
            Arc::new(NodeRegistry::with_roles(roles.hierarchy()?))
        } else {
            Arc::new(NodeRegistry::new())
        };

        let controller = Arc::new(EngineController::new(
            config.local_node_id.clone(),
            Arc::clone(&registry),
            Arc::new(ProcessLauncher::new(&config.lifecycle)),
            Arc::new(FileConfigStore::new(config.engine_config_dir())),
            config.lifecycle.clone(),
        ));

        Ok(Self::new(config, registry, controller, sync, relay))
    }

    pub fn require_sync(&self) -> ApiResult<&Arc<RelaySyncEngine>> {
        self.sync.as_ref().ok_or_else(|| {
            ApiError::service_unavailable("This process does not host a local store")
        })
    }

    pub fn require_relay(&self) -> ApiResult<&Arc<RelayStore>> {
        self.relay
            .as_ref()
            .ok_or_else(|| ApiError::service_unavailable("This process does not host the relay"))
    }
}
