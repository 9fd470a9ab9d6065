//! Shared identifiers and status snapshots.

use serde::{Deserialize, Serialize};

use crate::metrics::MetricsSnapshot;

/// Unique identifier for a cluster node.
pub type NodeId = u64;

/// Raft term number: a logical clock epoch, monotonically increasing.
pub type Term = u64;

/// Position in the replicated log. 1-based; 0 means "no entries".
pub type LogIndex = u64;

/// Role of a node in the consensus protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Static peer addressing from configuration. The node set is fixed at
/// startup; there is no dynamic membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    pub id: NodeId,
    pub address: String,
}

/// Health classification assigned by the failure detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerHealth {
    Alive,
    Suspected,
    Failed,
    /// Not registered with the detector.
    Unknown,
}

impl std::fmt::Display for PeerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerHealth::Alive => write!(f, "alive"),
            PeerHealth::Suspected => write!(f, "suspected"),
            PeerHealth::Failed => write!(f, "failed"),
            PeerHealth::Unknown => write!(f, "unknown"),
        }
    }
}

/// Snapshot of consensus state, cached by the node so status queries do
/// not cross into the consensus actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftStatus {
    pub node_id: NodeId,
    pub role: RaftRole,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub log_len: u64,
}

impl RaftStatus {
    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    pub fn initial(node_id: NodeId) -> Self {
        Self {
            node_id,
            role: RaftRole::Follower,
            term: 0,
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
            log_len: 0,
        }
    }
}

/// Connectivity and health of one peer, as reported by `Node::status`.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub id: NodeId,
    pub address: String,
    pub connected: bool,
    pub health: PeerHealth,
}

/// Aggregate cluster health from the failure detector's point of view.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterHealth {
    pub total_peers: usize,
    pub alive: usize,
    pub suspected: usize,
    pub failed: usize,
}

impl ClusterHealth {
    /// True when no peer is suspected or failed.
    pub fn all_alive(&self) -> bool {
        self.suspected == 0 && self.failed == 0
    }
}

/// Full node status snapshot, the surface consumed by admin layers.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub address: String,
    pub running: bool,
    pub raft: RaftStatus,
    pub peers: Vec<PeerStatus>,
    pub cluster_health: ClusterHealth,
    pub metrics: MetricsSnapshot,
}
