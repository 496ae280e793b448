//! Known-peer registry for skiff
//!
//! Tracks every peer this node has ever heard of, merges peer-list gossip
//! from multiple sources without flapping connected peers, and answers
//! node-list requests with bounded, filtered slices of the registry.

pub mod registry;

pub use registry::{NodeRegistry, PeerState, RegistryConfig};
