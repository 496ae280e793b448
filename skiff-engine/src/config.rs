//! Engine configuration
//!
//! All static limits live here as plain values; how they get loaded from
//! disk is a collaborator's concern.

use std::net::SocketAddr;

use skiff_net::NetConfig;
use skiff_nodes::RegistryConfig;
use skiff_transfer::TransferConfig;

/// Per-folder synchronization behavior, a user-issued intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncProfile {
    /// Fetch whatever peers announce as newer.
    #[default]
    AutoDownload,
    /// Track remote listings, download only on explicit request.
    ManualDownload,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Stable id of this node.
    pub node_id: String,
    pub nick: String,
    /// Where to accept peers; None runs connect-only.
    pub bind_addr: Option<SocketAddr>,
    pub supernode: bool,
    pub program_version: String,
    /// Item cap for split list messages (file lists, node lists, deltas).
    pub max_items_per_message: usize,
    pub net: NetConfig,
    pub transfer: TransferConfig,
    pub registry: RegistryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            nick: String::new(),
            bind_addr: Some("0.0.0.0:9941".parse().expect("static addr")),
            supernode: false,
            program_version: env!("CARGO_PKG_VERSION").to_string(),
            max_items_per_message: 500,
            net: NetConfig::default(),
            transfer: TransferConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(node_id: impl Into<String>, nick: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            nick: nick.into(),
            ..Self::default()
        }
    }

    pub fn bind_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn supernode(mut self, supernode: bool) -> Self {
        self.supernode = supernode;
        self
    }

    pub fn max_items_per_message(mut self, max: usize) -> Self {
        self.max_items_per_message = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_identity_fields() {
        let config = EngineConfig::new("node-1", "alice")
            .supernode(true)
            .bind_addr(None)
            .max_items_per_message(100);

        assert_eq!(config.node_id, "node-1");
        assert_eq!(config.nick, "alice");
        assert!(config.supernode);
        assert!(config.bind_addr.is_none());
        assert_eq!(config.max_items_per_message, 100);
    }
}
