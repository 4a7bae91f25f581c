//! COMMANDER API - REST/WebSocket Layer
//!
//! HTTP surface of the cluster: relay endpoints for envelope sync, node and
//! agent control, local message writes, health and metrics, and the `/ws`
//! state stream. Also hosts the background jobs and the HTTP relay client
//! used by nodes that push to a remote relay.

pub mod broadcast;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod jobs;
pub mod macros;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod ws;

pub use broadcast::{Broadcaster, Subscription, TickReport};
pub use client::HttpRelayTransport;
pub use config::{ApiConfig, RelayMode};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use events::{ClientMessage, FrameKind, ServerNotice, StreamFrame};
pub use routes::create_router;
pub use state::AppState;
