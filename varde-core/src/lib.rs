//! Replicated state machine platform.
//!
//! varde-core provides a raft consensus core, a phi-accrual failure
//! detector, and a TCP message transport, wired together by a [`Node`]
//! that fans committed log entries out to attached [`Application`]s.
//! Applications live in separate crates and talk to the node through
//! [`SharedNodeState`]: submit a command, then observe the effect once
//! the entry commits and applies locally.

pub mod config;
pub mod error;
pub mod failure_detector;
pub mod metrics;
pub mod node;
pub mod node_shared;
pub mod observer;
pub mod raft;
pub mod transport;
pub mod types;

pub use config::Config;
pub use error::{VardeError, VardeResult};
pub use failure_detector::FailureDetector;
pub use metrics::{Metrics, MetricsSnapshot};
pub use node::{Application, Node};
pub use node_shared::SharedNodeState;
pub use observer::{CommitObserver, PeerHealthObserver, StateChangeObserver};
pub use raft::{Command, LockMode, LogEntry, QueueMessage, RaftState};
pub use transport::{Envelope, Payload};
pub use types::{
    ClusterHealth, LogIndex, NodeId, NodeStatus, PeerHealth, PeerSpec, PeerStatus, RaftRole,
    RaftStatus, Term,
};
