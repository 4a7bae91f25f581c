//! COMMANDER Agents - Node Coordination
//!
//! Provides the coordination layer for a fleet of compute nodes:
//! - Node registry with the lifecycle state machine and routing
//! - Agent table bound to nodes and roles, with agent start/stop/restart
//! - Task board with dependency-gated dispatch
//! - Heartbeat staleness sweep
//! - Engine lifecycle controller with per-node coalescing executors

pub mod config_store;
pub mod lifecycle;
pub mod process;
pub mod registry;
pub mod tasks;

pub use config_store::FileConfigStore;
pub use lifecycle::{EngineConfigStore, EngineController, EngineHandle, EngineLauncher};
pub use process::{engine_args, ProcessLauncher};
pub use registry::{NodeRegistry, RegistryEvent, RegistryResult, RegistrySnapshot};
pub use tasks::TaskBoard;
