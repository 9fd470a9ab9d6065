//! Consensus actor.
//!
//! `RaftManager` owns the [`RaftState`] and is the only task that
//! touches it. Everything else communicates through channels: inbound
//! RPCs and proposals flow in, committed entries flow out to the apply
//! loop, and outbound RPCs go straight to the transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::VardeResult;
use crate::node_shared::SharedNodeState;
use crate::raft::command::Command;
use crate::raft::log::LogEntry;
use crate::raft::messages::{Outbound, RaftRpc};
use crate::raft::state::RaftState;
use crate::types::{LogIndex, RaftRole, RaftStatus};

/// A command submission awaiting its log index.
pub struct ProposalRequest {
    pub command: Command,
    pub reply: oneshot::Sender<VardeResult<LogIndex>>,
}

pub struct RaftManager {
    state: RaftState,
    shared: Arc<SharedNodeState>,
    message_rx: mpsc::UnboundedReceiver<RaftRpc>,
    proposal_rx: mpsc::UnboundedReceiver<ProposalRequest>,
    apply_tx: mpsc::UnboundedSender<LogEntry>,
    shutdown: watch::Receiver<bool>,
    last_role: RaftRole,
    tick_interval: Duration,
}

impl RaftManager {
    pub fn new(
        state: RaftState,
        shared: Arc<SharedNodeState>,
        message_rx: mpsc::UnboundedReceiver<RaftRpc>,
        proposal_rx: mpsc::UnboundedReceiver<ProposalRequest>,
        apply_tx: mpsc::UnboundedSender<LogEntry>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let tick_interval = shared.config().raft.tick_interval;
        Self {
            state,
            shared,
            message_rx,
            proposal_rx,
            apply_tx,
            shutdown,
            last_role: RaftRole::Follower,
            tick_interval,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(node_id = self.state.node_id(), "consensus actor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outbound = self.state.tick(Instant::now());
                    self.after_step(outbound);
                }
                message = self.message_rx.recv() => match message {
                    Some(rpc) => {
                        self.shared.metrics().incr("raft_messages_received");
                        let outbound = self.state.handle_message(rpc, Instant::now());
                        self.after_step(outbound);
                    }
                    None => break,
                },
                proposal = self.proposal_rx.recv() => match proposal {
                    Some(request) => self.handle_proposal(request),
                    None => break,
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!(node_id = self.state.node_id(), "consensus actor shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn handle_proposal(&mut self, request: ProposalRequest) {
        let kind = request.command.kind();
        let now_ms = Utc::now().timestamp_millis();
        match self.state.propose(request.command, Instant::now(), now_ms) {
            Ok((index, outbound)) => {
                self.shared.metrics().incr("raft_proposals_accepted");
                debug!(kind, index, "proposal appended");
                let _ = request.reply.send(Ok(index));
                self.after_step(outbound);
            }
            Err(err) => {
                self.shared.metrics().incr("raft_proposals_rejected");
                let _ = request.reply.send(Err(err));
            }
        }
    }

    /// Ships outbound RPCs, drains newly committed entries to the apply
    /// loop, and refreshes the cached status.
    fn after_step(&mut self, outbound: Vec<Outbound>) {
        for entry in self.state.take_committed() {
            self.shared.metrics().incr("raft_entries_committed");
            if self.apply_tx.send(entry).is_err() {
                warn!("apply channel closed, committed entry not applied");
            }
        }
        for (peer, rpc) in outbound {
            self.shared.send_raft_message(peer, rpc);
        }
        self.publish_status();
    }

    fn publish_status(&mut self) {
        let role = self.state.role();
        self.shared.update_raft_status(RaftStatus {
            node_id: self.state.node_id(),
            role,
            term: self.state.current_term(),
            leader_id: self.state.leader_id(),
            commit_index: self.state.commit_index(),
            last_applied: self.state.last_applied(),
            log_len: self.state.log_len() as u64,
        });
        if role != self.last_role {
            info!(
                node_id = self.state.node_id(),
                role = %role,
                term = self.state.current_term(),
                "role changed"
            );
            self.shared.metrics().incr("raft_role_changes");
            self.shared
                .notify_role_change(role, self.state.current_term());
            self.last_role = role;
        }
    }
}
