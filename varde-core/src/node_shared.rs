//! State shared between the node's background tasks and applications.
//!
//! `SharedNodeState` is the one handle applications hold. It caches the
//! latest consensus status so leadership checks never cross into the
//! consensus actor, and it fronts the transport so callers address
//! peers by node id rather than socket address.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::config::Config;
use crate::error::{VardeError, VardeResult};
use crate::failure_detector::FailureDetector;
use crate::metrics::Metrics;
use crate::observer::{CommitObserver, StateChangeObserver};
use crate::raft::command::Command;
use crate::raft::log::LogEntry;
use crate::raft::core::ProposalRequest;
use crate::raft::messages::RaftRpc;
use crate::transport::message::{Envelope, Payload};
use crate::transport::peer::PeerConnector;
use crate::types::{ClusterHealth, LogIndex, NodeId, PeerStatus, RaftRole, RaftStatus, Term};

pub struct SharedNodeState {
    config: Config,
    addresses: HashMap<NodeId, String>,
    metrics: Arc<Metrics>,
    connector: PeerConnector,
    detector: Arc<FailureDetector>,
    raft_status: RwLock<RaftStatus>,
    proposal_tx: mpsc::UnboundedSender<ProposalRequest>,
    role_observers: RwLock<Vec<Arc<dyn StateChangeObserver>>>,
    commit_observers: RwLock<Vec<Arc<dyn CommitObserver>>>,
}

impl SharedNodeState {
    pub(crate) fn new(
        config: Config,
        proposal_tx: mpsc::UnboundedSender<ProposalRequest>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let connector = PeerConnector::new(config.transport.clone(), metrics.clone());
        let detector = Arc::new(FailureDetector::new(
            config.detector.clone(),
            metrics.clone(),
        ));
        let addresses: HashMap<NodeId, String> = config
            .peers
            .iter()
            .map(|peer| (peer.id, peer.address.clone()))
            .collect();
        for peer in &config.peers {
            detector.register_peer(peer.id);
        }
        let node_id = config.node.id;
        Self {
            config,
            addresses,
            metrics,
            connector,
            detector,
            raft_status: RwLock::new(RaftStatus::initial(node_id)),
            proposal_tx,
            role_observers: RwLock::new(Vec::new()),
            commit_observers: RwLock::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn detector(&self) -> &Arc<FailureDetector> {
        &self.detector
    }

    pub fn raft_status(&self) -> RaftStatus {
        self.raft_status.read().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.raft_status.read().is_leader()
    }

    pub(crate) fn update_raft_status(&self, status: RaftStatus) {
        self.metrics.set_gauge("raft_term", status.term as i64);
        self.metrics
            .set_gauge("raft_commit_index", status.commit_index as i64);
        self.metrics
            .set_gauge("raft_is_leader", i64::from(status.is_leader()));
        *self.raft_status.write() = status;
    }

    pub fn add_role_observer(&self, observer: Arc<dyn StateChangeObserver>) {
        self.role_observers.write().push(observer);
    }

    pub(crate) fn notify_role_change(&self, role: RaftRole, term: Term) {
        for observer in self.role_observers.read().iter() {
            observer.role_changed(self.node_id(), role, term);
        }
    }

    pub fn add_commit_observer(&self, observer: Arc<dyn CommitObserver>) {
        self.commit_observers.write().push(observer);
    }

    pub(crate) fn notify_commit(&self, entry: &LogEntry) {
        for observer in self.commit_observers.read().iter() {
            observer.entry_committed(entry);
        }
    }

    /// Submits a command to the replicated log.
    ///
    /// Resolves with the assigned log index once the entry is appended
    /// locally and replication has started. Commit and apply happen
    /// later; callers that need the effect poll their application's
    /// state. Fails fast with `NotLeader` on followers.
    pub async fn submit_command(&self, command: Command) -> VardeResult<LogIndex> {
        {
            let status = self.raft_status.read();
            if !status.is_leader() {
                return Err(VardeError::NotLeader {
                    leader_hint: status.leader_id,
                });
            }
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.proposal_tx
            .send(ProposalRequest {
                command,
                reply: reply_tx,
            })
            .map_err(|_| VardeError::ChannelClosed {
                channel: "proposals".to_string(),
            })?;
        reply_rx.await.map_err(|_| VardeError::ChannelClosed {
            channel: "proposal reply".to_string(),
        })?
    }

    pub fn peer_address(&self, peer: NodeId) -> Option<&str> {
        self.addresses.get(&peer).map(String::as_str)
    }

    /// Queues a payload for one peer. Best effort; the transport owns
    /// retries and buffering.
    pub fn send_to(&self, peer: NodeId, payload: Payload) {
        let Some(address) = self.addresses.get(&peer) else {
            warn!(peer, "dropping message to unknown peer");
            return;
        };
        let term = self.raft_status.read().term;
        let envelope = Envelope::new(self.node_id(), peer, term, payload);
        self.connector.send(address, envelope);
    }

    /// Queues a payload for every configured peer.
    pub fn broadcast(&self, payload: Payload) {
        for peer in self.addresses.keys() {
            self.send_to(*peer, payload.clone());
        }
    }

    pub(crate) fn send_raft_message(&self, peer: NodeId, rpc: RaftRpc) {
        self.metrics.incr("raft_messages_sent");
        self.send_to(peer, Payload::from(rpc));
    }

    pub fn cluster_health(&self) -> ClusterHealth {
        self.detector.cluster_health()
    }

    pub fn peer_statuses(&self) -> Vec<PeerStatus> {
        self.config
            .peers
            .iter()
            .map(|peer| PeerStatus {
                id: peer.id,
                address: peer.address.clone(),
                connected: self.connector.is_connected(&peer.address),
                health: self.detector.health(peer.id),
            })
            .collect()
    }

    pub(crate) fn connector(&self) -> &PeerConnector {
        &self.connector
    }
}
