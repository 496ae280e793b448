//! The node registry
//!
//! Entries are never removed, only go stale; reachability flows from the
//! connection layer, gossip only ever improves what we know.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use tracing::{debug, trace};

use skiff_proto::{NodeId, NodeInfo, NodeListCriteria};

/// Connection state of a known peer, as this node sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    #[default]
    Offline,
    Connecting,
    Online,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Peers unseen for longer than this are left out of broadcasts
    /// (supernodes and connected peers always make the cut).
    pub max_offline: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_offline: Duration::hours(12),
        }
    }
}

#[derive(Debug)]
struct NodeEntry {
    info: NodeInfo,
    state: PeerState,
}

/// All peers this node knows about, keyed by stable id.
pub struct NodeRegistry {
    self_node: NodeInfo,
    config: RegistryConfig,
    nodes: HashMap<NodeId, NodeEntry>,
}

impl NodeRegistry {
    pub fn new(self_node: NodeInfo, config: RegistryConfig) -> Self {
        Self {
            self_node,
            config,
            nodes: HashMap::new(),
        }
    }

    pub fn self_node(&self) -> &NodeInfo {
        &self.self_node
    }

    /// Merge gossip into the registry. An incoming record replaces a stored
    /// one only when strictly newer by last-seen; a connected peer is never
    /// demoted by a stale broadcast.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = NodeInfo>) -> usize {
        let mut updated = 0;
        for info in incoming {
            if info.id == self.self_node.id || !info.is_valid() {
                continue;
            }
            match self.nodes.get_mut(&info.id) {
                None => {
                    trace!(peer = %info.id, nick = %info.nick, "new peer learned");
                    self.nodes.insert(
                        info.id.clone(),
                        NodeEntry {
                            info,
                            state: PeerState::Offline,
                        },
                    );
                    updated += 1;
                }
                Some(entry) => {
                    if info.last_seen > entry.info.last_seen {
                        entry.info = info;
                        updated += 1;
                    }
                }
            }
        }
        if updated > 0 {
            debug!(updated, total = self.nodes.len(), "registry merged");
        }
        updated
    }

    /// Reachability updates from the connection layer. Connecting or
    /// connected peers also refresh their last-seen stamp.
    pub fn set_state(&mut self, id: &NodeId, state: PeerState) {
        if let Some(entry) = self.nodes.get_mut(id) {
            entry.state = state;
            if state != PeerState::Offline {
                entry.info.last_seen = Utc::now();
            }
        }
    }

    /// Record a peer we are directly talking to; the live connection is the
    /// best possible information about it.
    pub fn peer_connected(&mut self, mut info: NodeInfo) {
        info.last_seen = Utc::now();
        self.nodes.insert(
            info.id.clone(),
            NodeEntry {
                info,
                state: PeerState::Online,
            },
        );
    }

    pub fn peer_disconnected(&mut self, id: &NodeId) {
        self.set_state(id, PeerState::Offline);
    }

    pub fn state(&self, id: &NodeId) -> PeerState {
        self.nodes.get(id).map(|e| e.state).unwrap_or_default()
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeInfo> {
        self.nodes.get(id).map(|e| &e.info)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|e| e.state == PeerState::Online)
            .count()
    }

    /// Peers with a valid identity, regardless of reachability.
    pub fn valid_nodes(&self) -> Vec<NodeInfo> {
        self.nodes
            .values()
            .map(|e| e.info.clone())
            .filter(NodeInfo::is_valid)
            .collect()
    }

    /// Answer a node-list request.
    pub fn request_list(&self, criteria: &NodeListCriteria) -> Vec<NodeInfo> {
        match criteria {
            NodeListCriteria::All => self.broadcast_candidates(),
            NodeListCriteria::OnlineSupernodes => self
                .nodes
                .values()
                .filter(|e| e.info.supernode && e.state == PeerState::Online)
                .map(|e| e.info.clone())
                .collect(),
            NodeListCriteria::Explicit { ids } => ids
                .iter()
                .filter_map(|id| {
                    if *id == self.self_node.id {
                        Some(self.self_node.clone())
                    } else {
                        self.get(id).cloned()
                    }
                })
                .collect(),
        }
    }

    /// Peers worth telling others about. Included when the local node is a
    /// supernode, or the candidate is a supernode, currently connected, or
    /// seen within the offline window. Long-dead ordinary peers stay out.
    pub fn broadcast_candidates(&self) -> Vec<NodeInfo> {
        let cutoff = Utc::now() - self.config.max_offline;
        let mut result: Vec<NodeInfo> = self
            .nodes
            .values()
            .filter(|entry| {
                self.self_node.supernode
                    || entry.info.supernode
                    || entry.state == PeerState::Online
                    || entry.info.last_seen > cutoff
            })
            .map(|entry| entry.info.clone())
            .collect();
        result.push(self.self_node.clone());
        result
    }

    /// Case-insensitive substring search over nickname and id, excluding
    /// the searching peer itself.
    pub fn search(&self, pattern: &str, asked_by: &NodeId) -> Vec<NodeInfo> {
        let needle = pattern.to_lowercase();
        self.nodes
            .values()
            .filter(|entry| entry.info.id != *asked_by)
            .filter(|entry| {
                entry.info.nick.to_lowercase().contains(&needle)
                    || entry.info.id.as_str().to_lowercase().contains(&needle)
            })
            .map(|entry| entry.info.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, nick: &str) -> NodeInfo {
        NodeInfo::new(id, nick)
    }

    fn registry() -> NodeRegistry {
        NodeRegistry::new(node("self", "me"), RegistryConfig::default())
    }

    #[test]
    fn merge_keeps_newest_by_last_seen() {
        let mut registry = registry();

        let mut old = node("peer-1", "old-nick");
        old.last_seen = Utc::now() - Duration::hours(2);
        let mut new = node("peer-1", "new-nick");
        new.last_seen = Utc::now();

        registry.merge([new.clone()]);
        let replaced = registry.merge([old]);

        assert_eq!(replaced, 0);
        assert_eq!(registry.get(&new.id).unwrap().nick, "new-nick");
    }

    #[test]
    fn merge_ignores_self_and_invalid() {
        let mut registry = registry();
        let merged = registry.merge([node("self", "me"), node("", "anonymous")]);
        assert_eq!(merged, 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_broadcast_does_not_demote_connected_peer() {
        let mut registry = registry();
        registry.peer_connected(node("peer-1", "alice"));
        assert_eq!(registry.state(&NodeId::new("peer-1")), PeerState::Online);

        let mut stale = node("peer-1", "alice");
        stale.last_seen = Utc::now() - Duration::days(3);
        registry.merge([stale]);

        assert_eq!(registry.state(&NodeId::new("peer-1")), PeerState::Online);
    }

    #[test]
    fn broadcast_filters_long_dead_peers() {
        let mut registry = registry();

        let mut dead = node("dead", "dead-nick");
        dead.last_seen = Utc::now() - Duration::days(30);
        let mut dead_super = node("dead-super", "super-nick");
        dead_super.last_seen = Utc::now() - Duration::days(30);
        dead_super.supernode = true;
        let fresh = node("fresh", "fresh-nick");

        registry.merge([dead, dead_super, fresh]);
        registry.peer_connected(node("online", "online-nick"));

        let ids: Vec<String> = registry
            .broadcast_candidates()
            .into_iter()
            .map(|n| n.id.as_str().to_string())
            .collect();

        assert!(!ids.contains(&"dead".to_string()));
        assert!(ids.contains(&"dead-super".to_string()));
        assert!(ids.contains(&"fresh".to_string()));
        assert!(ids.contains(&"online".to_string()));
        // The answering node always lists itself.
        assert!(ids.contains(&"self".to_string()));
    }

    #[test]
    fn local_supernode_broadcasts_everything() {
        let mut self_node = node("self", "me");
        self_node.supernode = true;
        let mut registry = NodeRegistry::new(self_node, RegistryConfig::default());

        let mut dead = node("dead", "dead-nick");
        dead.last_seen = Utc::now() - Duration::days(365);
        registry.merge([dead]);

        let candidates = registry.broadcast_candidates();
        assert!(candidates.iter().any(|n| n.id.as_str() == "dead"));
    }

    #[test]
    fn request_list_criteria() {
        let mut registry = registry();
        let mut supernode = node("super", "super-nick");
        supernode.supernode = true;
        registry.merge([supernode.clone(), node("plain", "plain-nick")]);
        registry.peer_connected(supernode);

        let online_supers = registry.request_list(&NodeListCriteria::OnlineSupernodes);
        assert_eq!(online_supers.len(), 1);
        assert_eq!(online_supers[0].id.as_str(), "super");

        let explicit = registry.request_list(&NodeListCriteria::Explicit {
            ids: vec![NodeId::new("plain"), NodeId::new("unknown"), NodeId::new("self")],
        });
        let ids: Vec<&str> = explicit.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["plain", "self"]);
    }

    #[test]
    fn search_matches_nick_and_id_case_insensitively() {
        let mut registry = registry();
        registry.merge([node("peer-alpha", "Alice"), node("peer-beta", "bob")]);

        let asker = NodeId::new("peer-beta");
        let hits = registry.search("ali", &asker);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].nick, "Alice");

        // The asker never appears in its own results.
        assert!(registry.search("beta", &asker).is_empty());
        assert_eq!(registry.search("PEER", &NodeId::new("other")).len(), 2);
    }
}
