//! Raft consensus: log, pure state machine, and the actor around it.

pub mod command;
pub mod core;
pub mod log;
pub mod messages;
pub mod state;

pub use command::{Command, LockMode, QueueMessage};
pub use self::core::{ProposalRequest, RaftManager};
pub use log::{LogEntry, RaftLog};
pub use messages::{
    AppendEntriesArgs, AppendEntriesReply, Outbound, RaftRpc, RequestVoteArgs, RequestVoteReply,
};
pub use state::RaftState;
