//! Constants for COMMANDER API
//!
//! Default values for configuration read from the environment.

// ============================================================================
// SERVER
// ============================================================================

/// Default bind address
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";

/// Default HTTP port (the relay port of the node table)
pub const DEFAULT_PORT: u16 = 8001;

/// Default id of the node this process runs on
pub const DEFAULT_LOCAL_NODE_ID: &str = "main";

/// Default CORS max age in seconds (24 hours)
pub const DEFAULT_CORS_MAX_AGE_SECS: u64 = 86400;

// ============================================================================
// STORAGE
// ============================================================================

/// Default data directory holding the LMDB environments
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Default directory holding cluster.yaml and roles.yaml
pub const DEFAULT_CONFIG_DIR: &str = "./config";

/// Default LMDB map size in megabytes
pub const DEFAULT_MAP_SIZE_MB: usize = 1024;

pub const CLUSTER_FILE: &str = "cluster.yaml";
pub const ROLES_FILE: &str = "roles.yaml";

/// Subdirectory of the config dir holding persisted engine settings
pub const ENGINE_CONFIG_DIR: &str = "engines";

// ============================================================================
// BACKGROUND JOBS
// ============================================================================

/// Default state broadcast interval in milliseconds
pub const DEFAULT_BROADCAST_INTERVAL_MS: u64 = 2000;

/// Default config file poll interval in seconds
pub const DEFAULT_CONFIG_POLL_INTERVAL_SECS: u64 = 5;

/// Maximum batches the uploader sends per wakeup
pub const DEFAULT_UPLOAD_MAX_BATCHES: usize = 10;

/// How often synced envelopes past retention are pruned
pub const DEFAULT_PRUNE_INTERVAL_SECS: u64 = 3600;

/// How often this process announces its own node as alive
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5;

// ============================================================================
// PAGINATION
// ============================================================================

/// Default page size for relay queries
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Maximum page size for relay queries
pub const MAX_QUERY_LIMIT: usize = 1000;

// ============================================================================
// CONTEXT
// ============================================================================

/// Token budget of a context window when the caller names none
pub const DEFAULT_CONTEXT_TOKENS: usize = 8000;

/// Largest token budget a context window may ask for
pub const MAX_CONTEXT_TOKENS: usize = 128_000;
