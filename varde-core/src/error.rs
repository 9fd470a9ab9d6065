//! Error types for the varde workspace.
//!
//! One enum covers every layer. Variants carry enough structure to tell
//! an operator what failed and where, without stringly-typed matching.

use std::time::Duration;

use thiserror::Error;

use crate::types::NodeId;

#[derive(Error, Debug)]
pub enum VardeError {
    /// The operation requires the leader and this node is not it.
    /// `leader_hint` is the last leader this node heard from, if any.
    #[error("not the leader (last known leader: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("operation timed out: {operation} after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("I/O error during {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error during {operation}: {source}")]
    Serialization {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("transport error to {address}: {details}")]
    Transport { address: String, details: String },

    /// A violation of the wire framing or message contract.
    #[error("protocol violation: {details}")]
    Protocol { details: String },

    /// An internal channel was closed while the node was still running.
    #[error("channel closed: {channel}")]
    ChannelClosed { channel: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("not found: {resource}")]
    NotFound { resource: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

pub type VardeResult<T> = Result<T, VardeError>;
