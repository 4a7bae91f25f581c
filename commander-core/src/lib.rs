//! COMMANDER Core - Domain Types
//!
//! Data structures and pure logic shared by every other crate: the message
//! envelope protocol, the role hierarchy, node/agent/task records, the error
//! taxonomy and typed configuration. No I/O beyond config-file loading.

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod agent;
pub mod cluster;
pub mod config;
pub mod envelope;
pub mod error;
pub mod health;
pub mod node;
pub mod outbox;
pub mod role;
pub mod task;

pub use agent::*;
pub use cluster::*;
pub use config::*;
pub use envelope::*;
pub use error::*;
pub use health::*;
pub use node::*;
pub use outbox::*;
pub use role::*;
pub use task::*;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Node identifier as declared in the cluster table (e.g. `"main"`, `"htpc"`).
pub type NodeId = String;

/// Agent identifier as declared in the agent table.
pub type AgentId = String;

/// Task identifier shared by every envelope that belongs to the task.
pub type TaskId = String;

/// Envelope identifier using UUIDv7 for timestamp-sortable IDs.
pub type EnvelopeId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 identifier (timestamp-sortable).
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}
