//! API Configuration Module
//!
//! Server, storage and background-job settings for a COMMANDER process.
//! Loaded from `COMMANDER_*` environment variables with development
//! defaults; the tuning sub-configs come from commander-core.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use commander_core::{
    BroadcastConfig, CommanderResult, ConfigError, HeartbeatConfig, LifecycleConfig, RetryConfig,
    SyncConfig,
};

use crate::constants::{
    CLUSTER_FILE, DEFAULT_BIND_ADDR, DEFAULT_BROADCAST_INTERVAL_MS, DEFAULT_CONFIG_DIR,
    DEFAULT_CONFIG_POLL_INTERVAL_SECS, DEFAULT_CORS_MAX_AGE_SECS, DEFAULT_DATA_DIR,
    DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_LOCAL_NODE_ID, DEFAULT_MAP_SIZE_MB, DEFAULT_PORT,
    DEFAULT_PRUNE_INTERVAL_SECS, DEFAULT_UPLOAD_MAX_BATCHES, ENGINE_CONFIG_DIR, ROLES_FILE,
};

// ============================================================================
// RELAY MODE
// ============================================================================

/// Which halves of the system this process hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayMode {
    /// Local store and sync engine; pushes to a relay.
    Node,
    /// Relay store and the `/relay/*` endpoints only.
    Relay,
    /// Both, the single-host deployment.
    #[default]
    Both,
}

impl RelayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayMode::Node => "node",
            RelayMode::Relay => "relay",
            RelayMode::Both => "both",
        }
    }

    pub fn hosts_relay(&self) -> bool {
        matches!(self, RelayMode::Relay | RelayMode::Both)
    }

    pub fn hosts_node(&self) -> bool {
        matches!(self, RelayMode::Node | RelayMode::Both)
    }
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelayMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "node" => Ok(RelayMode::Node),
            "relay" => Ok(RelayMode::Relay),
            "both" => Ok(RelayMode::Both),
            other => Err(ConfigError::InvalidValue {
                field: "COMMANDER_RELAY_MODE".to_string(),
                value: other.to_string(),
                reason: "expected node, relay or both".to_string(),
            }),
        }
    }
}

// ============================================================================
// API CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct ApiConfig {
    // ========================================================================
    // Server
    // ========================================================================
    pub bind_addr: String,
    pub port: u16,
    /// Id of the node this process runs on; the sync engine writes as it.
    pub local_node_id: String,
    pub relay_mode: RelayMode,
    /// Remote relay base URL. `None` means push to the embedded relay store.
    pub relay_url: Option<String>,

    // ========================================================================
    // CORS
    // ========================================================================
    /// Allowed origins. Empty means allow all (dev mode).
    pub cors_origins: Vec<String>,
    pub cors_allow_credentials: bool,
    pub cors_max_age_secs: u64,

    // ========================================================================
    // Storage
    // ========================================================================
    /// Holds the `local/` and `relay/` LMDB environments.
    pub data_dir: PathBuf,
    /// Holds `cluster.yaml`, `roles.yaml` and persisted engine settings.
    pub config_dir: PathBuf,
    pub map_size_mb: usize,

    // ========================================================================
    // Background jobs
    // ========================================================================
    pub config_poll_interval: Duration,
    pub upload_max_batches: usize,
    pub prune_interval: Duration,
    /// Interval between heartbeats for `local_node_id`.
    pub heartbeat_interval: Duration,

    pub sync: SyncConfig,
    pub heartbeat: HeartbeatConfig,
    pub lifecycle: LifecycleConfig,
    pub broadcast: BroadcastConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            port: DEFAULT_PORT,
            local_node_id: DEFAULT_LOCAL_NODE_ID.to_string(),
            relay_mode: RelayMode::default(),
            relay_url: None,
            cors_origins: Vec::new(),
            cors_allow_credentials: false,
            cors_max_age_secs: DEFAULT_CORS_MAX_AGE_SECS,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            map_size_mb: DEFAULT_MAP_SIZE_MB,
            config_poll_interval: Duration::from_secs(DEFAULT_CONFIG_POLL_INTERVAL_SECS),
            upload_max_batches: DEFAULT_UPLOAD_MAX_BATCHES,
            prune_interval: Duration::from_secs(DEFAULT_PRUNE_INTERVAL_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            sync: SyncConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            lifecycle: LifecycleConfig::default(),
            broadcast: BroadcastConfig {
                interval: Duration::from_millis(DEFAULT_BROADCAST_INTERVAL_MS),
                ..BroadcastConfig::default()
            },
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl ApiConfig {
    /// Create ApiConfig from environment variables.
    ///
    /// Environment variables:
    /// - `COMMANDER_BIND_ADDR`: Listen address (default: 0.0.0.0)
    /// - `COMMANDER_PORT`: Listen port (default: 8001)
    /// - `COMMANDER_DATA_DIR`: LMDB directory (default: ./data)
    /// - `COMMANDER_LOCAL_NODE_ID`: Node id of this process (default: main)
    /// - `COMMANDER_RELAY_URL`: Remote relay base URL (default: embedded relay)
    /// - `COMMANDER_CONFIG_DIR`: Directory with cluster.yaml / roles.yaml (default: ./config)
    /// - `COMMANDER_CORS_ORIGINS`: Comma-separated allowed origins (empty = allow all)
    /// - `COMMANDER_BROADCAST_INTERVAL_MS`: State broadcast interval (default: 2000)
    /// - `COMMANDER_RELAY_MODE`: node, relay or both (default: both)
    ///
    /// Values that fail to parse fall back to their defaults, except the relay
    /// mode, which is an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let cors_origins = std::env::var("COMMANDER_CORS_ORIGINS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let relay_mode = match env_string("COMMANDER_RELAY_MODE") {
            Some(mode) => mode.parse()?,
            None => defaults.relay_mode,
        };

        let broadcast_interval = env_parse::<u64>("COMMANDER_BROADCAST_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.broadcast.interval);

        Ok(Self {
            bind_addr: env_string("COMMANDER_BIND_ADDR").unwrap_or(defaults.bind_addr),
            port: env_parse("COMMANDER_PORT").unwrap_or(defaults.port),
            local_node_id: env_string("COMMANDER_LOCAL_NODE_ID")
                .unwrap_or(defaults.local_node_id),
            relay_mode,
            relay_url: env_string("COMMANDER_RELAY_URL").map(|u| u.trim_end_matches('/').to_string()),
            cors_origins,
            cors_allow_credentials: std::env::var("COMMANDER_CORS_ALLOW_CREDENTIALS")
                .ok()
                .map(|s| s.to_lowercase() == "true")
                .unwrap_or(false),
            data_dir: env_string("COMMANDER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            config_dir: env_string("COMMANDER_CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_dir),
            map_size_mb: env_parse("COMMANDER_MAP_SIZE_MB").unwrap_or(defaults.map_size_mb),
            broadcast: BroadcastConfig {
                interval: broadcast_interval,
                ..defaults.broadcast
            },
            ..defaults
        })
    }

    /// Development preset: fast loops, short timeouts.
    pub fn development() -> Self {
        Self {
            config_poll_interval: Duration::from_secs(2),
            sync: SyncConfig {
                upload_interval: Duration::from_secs(1),
                retry: RetryConfig {
                    max_retries: 3,
                    initial_backoff: Duration::from_millis(500),
                    max_backoff: Duration::from_secs(10),
                    backoff_multiplier: 2.0,
                },
                ..SyncConfig::default()
            },
            lifecycle: LifecycleConfig {
                stop_grace: Duration::from_secs(3),
                ready_timeout: Duration::from_secs(60),
                ..LifecycleConfig::default()
            },
            broadcast: BroadcastConfig {
                interval: Duration::from_millis(500),
                ..BroadcastConfig::default()
            },
            ..Self::default()
        }
    }

    /// Production preset: patient retries, strict CORS expected.
    pub fn production() -> Self {
        Self {
            sync: SyncConfig {
                retry: RetryConfig {
                    max_retries: 10,
                    initial_backoff: Duration::from_secs(2),
                    max_backoff: Duration::from_secs(300),
                    backoff_multiplier: 2.0,
                },
                ..SyncConfig::default()
            },
            lifecycle: LifecycleConfig {
                ready_timeout: Duration::from_secs(300),
                ..LifecycleConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> CommanderResult<()> {
        if self.local_node_id.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "COMMANDER_LOCAL_NODE_ID".to_string(),
            }
            .into());
        }
        if self.relay_mode == RelayMode::Node && self.relay_url.is_none() {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "COMMANDER_RELAY_MODE=node".to_string(),
                option_b: "missing COMMANDER_RELAY_URL".to_string(),
            }
            .into());
        }
        if let Some(url) = &self.relay_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::InvalidValue {
                    field: "COMMANDER_RELAY_URL".to_string(),
                    value: url.clone(),
                    reason: "must be an http(s) URL".to_string(),
                }
                .into());
            }
        }
        if self.broadcast.interval.is_zero() || self.broadcast.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "COMMANDER_BROADCAST_INTERVAL_MS".to_string(),
                value: self.broadcast.interval.as_millis().to_string(),
                reason: "broadcast interval and capacity must be positive".to_string(),
            }
            .into());
        }
        if self.map_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "COMMANDER_MAP_SIZE_MB".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }
        self.sync.validate()
    }

    /// Check if running in production mode (strict CORS).
    pub fn is_production(&self) -> bool {
        !self.cors_origins.is_empty()
    }

    /// Check if a given origin is allowed.
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        if self.cors_origins.is_empty() {
            return true;
        }

        self.cors_origins.iter().any(|allowed| {
            if allowed == origin {
                return true;
            }
            // Wildcard subdomains: *.lan.example
            if let Some(pattern) = allowed.strip_prefix("*.") {
                let host = origin
                    .strip_prefix("https://")
                    .or_else(|| origin.strip_prefix("http://"));
                if let Some(host) = host {
                    return host.ends_with(&format!(".{pattern}")) || host == pattern;
                }
            }
            false
        })
    }

    pub fn cluster_file(&self) -> PathBuf {
        self.config_dir.join(CLUSTER_FILE)
    }

    pub fn roles_file(&self) -> PathBuf {
        self.config_dir.join(ROLES_FILE)
    }

    pub fn engine_config_dir(&self) -> PathBuf {
        self.config_dir.join(ENGINE_CONFIG_DIR)
    }

    pub fn local_store_path(&self) -> PathBuf {
        self.data_dir.join("local")
    }

    pub fn relay_store_path(&self) -> PathBuf {
        self.data_dir.join("relay")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ApiConfig::default();
        assert_eq!(config.port, 8001);
        assert_eq!(config.local_node_id, "main");
        assert_eq!(config.relay_mode, RelayMode::Both);
        assert!(config.relay_url.is_none());
        assert!(config.cors_origins.is_empty());
        assert_eq!(config.broadcast.interval, Duration::from_millis(2000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_validate() {
        assert!(ApiConfig::development().validate().is_ok());
        assert!(ApiConfig::production().validate().is_ok());
        assert!(
            ApiConfig::development().sync.retry.max_retries
                < ApiConfig::production().sync.retry.max_retries
        );
    }

    #[test]
    fn test_relay_mode_parse() {
        assert_eq!("node".parse::<RelayMode>().ok(), Some(RelayMode::Node));
        assert_eq!(" Relay ".parse::<RelayMode>().ok(), Some(RelayMode::Relay));
        assert_eq!("BOTH".parse::<RelayMode>().ok(), Some(RelayMode::Both));
        assert!("mesh".parse::<RelayMode>().is_err());

        assert!(RelayMode::Both.hosts_node() && RelayMode::Both.hosts_relay());
        assert!(!RelayMode::Relay.hosts_node());
        assert!(!RelayMode::Node.hosts_relay());
    }

    #[test]
    fn test_node_mode_requires_relay_url() {
        let mut config = ApiConfig {
            relay_mode: RelayMode::Node,
            ..ApiConfig::default()
        };
        assert!(config.validate().is_err());

        config.relay_url = Some("http://192.168.1.10:8001".to_string());
        assert!(config.validate().is_ok());

        config.relay_url = Some("ftp://relay".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_broadcast_interval_rejected() {
        let config = ApiConfig {
            broadcast: BroadcastConfig {
                interval: Duration::ZERO,
                ..BroadcastConfig::default()
            },
            ..ApiConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_origin_allowed_dev_mode() {
        let config = ApiConfig::default();
        assert!(!config.is_production());
        assert!(config.is_origin_allowed("http://localhost:3000"));
    }

    #[test]
    fn test_origin_allowed_production() {
        let config = ApiConfig {
            cors_origins: vec![
                "http://dashboard.lan".to_string(),
                "*.fleet.lan".to_string(),
            ],
            ..ApiConfig::default()
        };
        assert!(config.is_production());
        assert!(config.is_origin_allowed("http://dashboard.lan"));
        assert!(config.is_origin_allowed("http://htpc.fleet.lan"));
        assert!(config.is_origin_allowed("https://fleet.lan"));
        assert!(!config.is_origin_allowed("http://evilfleet.lan"));
        assert!(!config.is_origin_allowed("http://other.lan"));
    }

    #[test]
    fn test_paths() {
        let config = ApiConfig {
            data_dir: PathBuf::from("/var/lib/commander"),
            config_dir: PathBuf::from("/etc/commander"),
            ..ApiConfig::default()
        };
        assert_eq!(config.cluster_file(), PathBuf::from("/etc/commander/cluster.yaml"));
        assert_eq!(config.roles_file(), PathBuf::from("/etc/commander/roles.yaml"));
        assert_eq!(config.local_store_path(), PathBuf::from("/var/lib/commander/local"));
        assert_eq!(config.relay_store_path(), PathBuf::from("/var/lib/commander/relay"));
    }
}
