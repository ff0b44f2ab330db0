//! Cluster-wide state tracking and quorum-aware reload coordination

pub mod quorum;
pub mod state;

pub use quorum::{await_site_quorum, jittered_delay, min_active_nodes, QuorumOutcome};
pub use state::{ClusterState, MemorySnapshot, NodeState, SiteState};
