//! Wire message types.
//!
//! Everything that crosses the network travels inside an [`Envelope`].
//! Consensus traffic wraps the raft RPC types; the remaining variants
//! carry failure detector beacons and cache coherence traffic, which
//! bypass the replicated log.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::raft::messages::{
    AppendEntriesArgs, AppendEntriesReply, RaftRpc, RequestVoteArgs, RequestVoteReply,
};
use crate::types::{NodeId, Term};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    RequestVote(RequestVoteArgs),
    VoteResponse(RequestVoteReply),
    AppendEntries(AppendEntriesArgs),
    AppendEntriesResponse(AppendEntriesReply),
    /// Failure detector beacon, sent on its own cadence.
    Heartbeat,
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
    /// Ask peers for their copy of a cache line.
    CacheGet {
        key: String,
    },
    /// Answer to `CacheGet`.
    CacheUpdate {
        key: String,
        value: String,
        version: u64,
    },
    /// Tell peers their copy of a line is out of date.
    CacheInvalidate {
        key: String,
        version: u64,
    },
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::RequestVote(_) => "request_vote",
            Payload::VoteResponse(_) => "vote_response",
            Payload::AppendEntries(_) => "append_entries",
            Payload::AppendEntriesResponse(_) => "append_entries_response",
            Payload::Heartbeat => "heartbeat",
            Payload::Ping { .. } => "ping",
            Payload::Pong { .. } => "pong",
            Payload::CacheGet { .. } => "cache_get",
            Payload::CacheUpdate { .. } => "cache_update",
            Payload::CacheInvalidate { .. } => "cache_invalidate",
        }
    }

    /// Consensus payloads route to the raft manager, everything else
    /// to the detector or the application.
    pub fn into_raft(self) -> Result<RaftRpc, Payload> {
        match self {
            Payload::RequestVote(args) => Ok(RaftRpc::RequestVote(args)),
            Payload::VoteResponse(reply) => Ok(RaftRpc::VoteResponse(reply)),
            Payload::AppendEntries(args) => Ok(RaftRpc::AppendEntries(args)),
            Payload::AppendEntriesResponse(reply) => Ok(RaftRpc::AppendEntriesResponse(reply)),
            other => Err(other),
        }
    }
}

impl From<RaftRpc> for Payload {
    fn from(rpc: RaftRpc) -> Self {
        match rpc {
            RaftRpc::RequestVote(args) => Payload::RequestVote(args),
            RaftRpc::VoteResponse(reply) => Payload::VoteResponse(reply),
            RaftRpc::AppendEntries(args) => Payload::AppendEntries(args),
            RaftRpc::AppendEntriesResponse(reply) => Payload::AppendEntriesResponse(reply),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub sender: NodeId,
    pub receiver: NodeId,
    /// Sender's raft term at send time, for quick staleness checks in logs.
    pub term: Term,
    pub sent_at_ms: i64,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(sender: NodeId, receiver: NodeId, term: Term, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            receiver,
            term,
            sent_at_ms: Utc::now().timestamp_millis(),
            payload,
        }
    }
}
