//! # Cluster Node/Site State Tracking
//!
//! Process-wide map from node id to that node's last-known full state
//! snapshot, kept approximately consistent via full-snapshot gossip. Every
//! node maintains its own independently-converging copy; there is no
//! authoritative owner.
//!
//! Consistency contract: per-entry mutation is safe under concurrency, but
//! there is no cross-entry transactionality — a reader can observe a
//! partially-updated view spanning two different events.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Lifecycle state of one site on one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SiteState {
    Stopped,
    Starting,
    Started,
    Stopping,
    Deleted,
}

impl fmt::Display for SiteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SiteState::Stopped => "STOPPED",
            SiteState::Starting => "STARTING",
            SiteState::Started => "STARTED",
            SiteState::Stopping => "STOPPING",
            SiteState::Deleted => "DELETED",
        };
        f.write_str(name)
    }
}

/// Point-in-time memory usage of a node process
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
}

impl MemorySnapshot {
    /// Capture the current process memory usage. Falls back to zeroes on
    /// platforms without `/proc`.
    pub fn capture() -> Self {
        Self::from_statm(&std::fs::read_to_string("/proc/self/statm").unwrap_or_default())
    }

    fn from_statm(statm: &str) -> Self {
        let page_size = 4096u64;
        let mut fields = statm.split_whitespace();
        let virtual_pages: u64 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        let resident_pages: u64 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        Self {
            resident_bytes: resident_pages * page_size,
            virtual_bytes: virtual_pages * page_size,
        }
    }
}

/// Full state snapshot of one node, broadcast via gossip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: String,
    /// Capture time, unix epoch milliseconds
    pub timestamp_ms: u64,
    pub memory: MemorySnapshot,
    /// Captured runtime facts (os, arch, cpu count)
    pub system_properties: HashMap<String, String>,
    /// Captured process environment variables
    pub environment: HashMap<String, String>,
    /// Site name to lifecycle state, as seen by this node
    pub site_states: HashMap<String, SiteState>,
}

impl NodeState {
    /// Capture a full snapshot of the local node.
    pub fn capture(node_id: &str, site_states: HashMap<String, SiteState>) -> Self {
        let mut system_properties = HashMap::new();
        system_properties.insert("os.name".to_string(), std::env::consts::OS.to_string());
        system_properties.insert("os.arch".to_string(), std::env::consts::ARCH.to_string());
        system_properties.insert(
            "host.cpus".to_string(),
            std::thread::available_parallelism()
                .map(|n| n.get().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
        );

        Self {
            node_id: node_id.to_string(),
            timestamp_ms: unix_millis(),
            memory: MemorySnapshot::capture(),
            system_properties,
            environment: std::env::vars().collect(),
            site_states,
        }
    }

    /// Empty placeholder for a node referenced before its first gossip
    /// broadcast arrived.
    fn placeholder(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            timestamp_ms: unix_millis(),
            memory: MemorySnapshot::default(),
            system_properties: HashMap::new(),
            environment: HashMap::new(),
            site_states: HashMap::new(),
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Process-wide cluster state map, node id -> last-known snapshot
#[derive(Debug, Default)]
pub struct ClusterState {
    nodes: DashMap<String, NodeState>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace (not merge) a node's entry with a freshly received snapshot.
    pub fn put_node(&self, state: NodeState) {
        debug!(node = %state.node_id, sites = state.site_states.len(), "storing node state snapshot");
        self.nodes.insert(state.node_id.clone(), state);
    }

    /// Mutate the currently stored snapshot of `node_id` in place: set the
    /// site's state, or drop the site key entirely when it was deleted. The
    /// entry is lazily materialized on first reference.
    pub fn apply_site_state(&self, node_id: &str, site_name: &str, state: SiteState) {
        let mut entry = self
            .nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeState::placeholder(node_id));
        if state == SiteState::Deleted {
            entry.site_states.remove(site_name);
        } else {
            entry.site_states.insert(site_name.to_string(), state);
        }
    }

    /// Remove a node's entry entirely (shutdown notification).
    pub fn remove_node(&self, node_id: &str) -> bool {
        self.nodes.remove(node_id).is_some()
    }

    /// Drop a site from every known node's snapshot (site deletion teardown).
    pub fn forget_site(&self, site_name: &str) {
        for mut entry in self.nodes.iter_mut() {
            entry.site_states.remove(site_name);
        }
    }

    /// Number of currently known nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of nodes reporting the site as started.
    pub fn started_count(&self, site_name: &str) -> usize {
        self.nodes
            .iter()
            .filter(|entry| entry.site_states.get(site_name) == Some(&SiteState::Started))
            .count()
    }

    /// The stored state of one site on one node, if known.
    pub fn site_state(&self, node_id: &str, site_name: &str) -> Option<SiteState> {
        self.nodes
            .get(node_id)
            .and_then(|entry| entry.site_states.get(site_name).copied())
    }

    /// Clone of one node's full snapshot.
    pub fn node(&self, node_id: &str) -> Option<NodeState> {
        self.nodes.get(node_id).map(|entry| entry.clone())
    }

    /// Ids of all currently known nodes.
    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(node: &str, sites: &[(&str, SiteState)]) -> NodeState {
        NodeState::capture(
            node,
            sites
                .iter()
                .map(|(name, state)| (name.to_string(), *state))
                .collect(),
        )
    }

    #[test]
    fn test_snapshot_replaces_wholesale() {
        let cluster = ClusterState::new();
        cluster.put_node(snapshot("a", &[("foo", SiteState::Started), ("bar", SiteState::Started)]));
        cluster.put_node(snapshot("a", &[("foo", SiteState::Stopping)]));

        let stored = cluster.node("a").unwrap();
        assert_eq!(stored.site_states.len(), 1);
        assert_eq!(stored.site_states.get("foo"), Some(&SiteState::Stopping));
        assert!(!stored.site_states.contains_key("bar"));
    }

    #[test]
    fn test_in_place_mutation_lost_after_replace() {
        let cluster = ClusterState::new();
        cluster.put_node(snapshot("a", &[("foo", SiteState::Starting)]));
        cluster.apply_site_state("a", "foo", SiteState::Started);
        assert_eq!(cluster.site_state("a", "foo"), Some(SiteState::Started));

        // a later full broadcast replaces the mutated snapshot entirely
        cluster.put_node(snapshot("a", &[("foo", SiteState::Starting)]));
        assert_eq!(cluster.site_state("a", "foo"), Some(SiteState::Starting));
    }

    #[test]
    fn test_entry_lazily_materialized() {
        let cluster = ClusterState::new();
        cluster.apply_site_state("never-seen", "foo", SiteState::Started);
        assert_eq!(cluster.node_count(), 1);
        assert_eq!(cluster.site_state("never-seen", "foo"), Some(SiteState::Started));
    }

    #[test]
    fn test_deleted_removes_site_key() {
        let cluster = ClusterState::new();
        cluster.put_node(snapshot("a", &[("foo", SiteState::Started)]));
        cluster.apply_site_state("a", "foo", SiteState::Deleted);
        assert!(cluster.node("a").unwrap().site_states.is_empty());
    }

    #[test]
    fn test_shutdown_removes_node() {
        let cluster = ClusterState::new();
        cluster.put_node(snapshot("a", &[]));
        cluster.put_node(snapshot("b", &[]));
        assert!(cluster.remove_node("a"));
        assert!(!cluster.remove_node("a"));
        assert_eq!(cluster.node_ids(), vec!["b".to_string()]);
    }

    #[test]
    fn test_started_count() {
        let cluster = ClusterState::new();
        cluster.put_node(snapshot("a", &[("foo", SiteState::Started)]));
        cluster.put_node(snapshot("b", &[("foo", SiteState::Starting)]));
        cluster.put_node(snapshot("c", &[("foo", SiteState::Started), ("bar", SiteState::Started)]));
        assert_eq!(cluster.started_count("foo"), 2);
        assert_eq!(cluster.started_count("bar"), 1);
        assert_eq!(cluster.started_count("baz"), 0);
    }

    #[test]
    fn test_forget_site_prunes_all_entries() {
        let cluster = ClusterState::new();
        cluster.put_node(snapshot("a", &[("foo", SiteState::Started)]));
        cluster.put_node(snapshot("b", &[("foo", SiteState::Stopped), ("bar", SiteState::Started)]));
        cluster.forget_site("foo");
        assert!(cluster.node("a").unwrap().site_states.is_empty());
        assert_eq!(cluster.node("b").unwrap().site_states.len(), 1);
    }

    #[test]
    fn test_memory_snapshot_parsing() {
        let snap = MemorySnapshot::from_statm("1000 250 30 5 0 400 0");
        assert_eq!(snap.virtual_bytes, 1000 * 4096);
        assert_eq!(snap.resident_bytes, 250 * 4096);

        let empty = MemorySnapshot::from_statm("");
        assert_eq!(empty.resident_bytes, 0);
    }
}
