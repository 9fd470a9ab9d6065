//! Consensus RPC payloads.

use serde::{Deserialize, Serialize};

use crate::raft::log::LogEntry;
use crate::types::{LogIndex, NodeId, Term};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
    pub voter_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
    pub follower_id: NodeId,
    /// Highest index the follower now matches, meaningful when success.
    pub match_index: LogIndex,
}

/// All consensus traffic between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RaftRpc {
    RequestVote(RequestVoteArgs),
    VoteResponse(RequestVoteReply),
    AppendEntries(AppendEntriesArgs),
    AppendEntriesResponse(AppendEntriesReply),
}

impl RaftRpc {
    pub fn term(&self) -> Term {
        match self {
            RaftRpc::RequestVote(a) => a.term,
            RaftRpc::VoteResponse(r) => r.term,
            RaftRpc::AppendEntries(a) => a.term,
            RaftRpc::AppendEntriesResponse(r) => r.term,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RaftRpc::RequestVote(_) => "request_vote",
            RaftRpc::VoteResponse(_) => "vote_response",
            RaftRpc::AppendEntries(_) => "append_entries",
            RaftRpc::AppendEntriesResponse(_) => "append_entries_response",
        }
    }
}

/// A message the state machine wants delivered to a peer.
pub type Outbound = (NodeId, RaftRpc);
