//! COMMANDER Storage - Relay Sync Engine
//!
//! Local-first persistence for message envelopes:
//!
//! - [`LocalStore`]: per-node LMDB store with a durable outbox
//! - [`RelayStore`]: the central relay's LMDB store
//! - [`RelayTransport`]: the network seam between them
//! - [`RelaySyncEngine`]: dual write, outbox upload and local-first reads
//! - [`ContextWindow`]: a task's recent envelopes as token-bounded text

pub mod context;
pub mod lmdb;
pub mod local_store;
pub mod mock;
pub mod relay_store;
pub mod sync;
pub mod transport;

pub use context::{build_context, context_line, ContextWindow, CHARS_PER_TOKEN};
pub use lmdb::{order_key, DEFAULT_MAP_SIZE_MB};
pub use local_store::{AttemptFailure, FailureKind, InsertOutcome, LocalRecord, LocalStore, OutboxStats, SyncState};
pub use mock::MockRelayTransport;
pub use relay_store::{RelayInsert, RelayPage, RelayRecord, RelayStore};
pub use sync::{
    BatchReport, RelaySyncEngine, SyncMetrics, SyncMetricsSnapshot, SyncStats, UploadReport,
    WriteOutcome,
};
pub use transport::{EmbeddedRelay, PushOutcome, RelayTransport};
