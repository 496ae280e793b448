//! Engine wiring for skiff
//!
//! Pulls the protocol crates together into one runnable engine: peer
//! registry, reconciler, transfer manager, relay, connection driving,
//! events for an embedding UI, and explicit start/stop lifecycle.

pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod repository;

pub use config::{EngineConfig, SyncProfile};
pub use engine::Engine;
pub use errors::{EngineError, Result};
pub use events::EngineEvent;
pub use repository::{FolderRepository, MemoryRepository};
