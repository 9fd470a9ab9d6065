//! Observer seams for consensus and failure-detector notifications.
//!
//! Implementors register with the node before startup. Notifications
//! run on the notifying task, so implementations must stay short and
//! never block.

use crate::raft::log::LogEntry;
use crate::types::{NodeId, RaftRole, Term};

/// Notified when the local node's consensus role changes.
pub trait StateChangeObserver: Send + Sync {
    fn role_changed(&self, node_id: NodeId, role: RaftRole, term: Term);
}

/// Notified after a committed entry has been applied locally.
pub trait CommitObserver: Send + Sync {
    fn entry_committed(&self, entry: &LogEntry);
}

/// Notified on failure-detector state transitions. Invocations are
/// best-effort; the monitor loop never depends on their outcome.
pub trait PeerHealthObserver: Send + Sync {
    fn peer_suspected(&self, peer: NodeId, phi: f64);
    fn peer_failed(&self, peer: NodeId, phi: f64);
    fn peer_recovered(&self, peer: NodeId);
}
