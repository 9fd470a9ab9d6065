//! Replicated commands.
//!
//! Commands are the only payloads that travel through the log. Each
//! application matches the variants it owns during apply and ignores
//! the rest, so mixed-application clusters stay well-defined.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lock sharing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Shared => write!(f, "shared"),
            LockMode::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// A message held by the partitioned queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: Uuid,
    pub queue: String,
    pub payload: String,
    /// Fixed hash bucket, derived from the queue name at enqueue time.
    pub partition: u32,
    pub enqueued_at_ms: i64,
    pub retry_count: u32,
    pub delivered: bool,
}

/// Every operation that mutates replicated state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    AcquireLock {
        resource: String,
        requester: String,
        mode: LockMode,
        timeout_ms: u64,
        requested_at_ms: i64,
    },
    ReleaseLock {
        resource: String,
        holder: String,
    },
    CancelLockRequest {
        resource: String,
        requester: String,
    },
    Enqueue {
        message: QueueMessage,
    },
    MarkDelivered {
        message_id: Uuid,
        consumer: String,
    },
    Acknowledge {
        message_id: Uuid,
        consumer: String,
    },
    CachePut {
        key: String,
        value: String,
        version: u64,
    },
    CacheDelete {
        key: String,
    },
}

impl Command {
    /// Stable name for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::AcquireLock { .. } => "acquire_lock",
            Command::ReleaseLock { .. } => "release_lock",
            Command::CancelLockRequest { .. } => "cancel_lock_request",
            Command::Enqueue { .. } => "enqueue",
            Command::MarkDelivered { .. } => "mark_delivered",
            Command::Acknowledge { .. } => "acknowledge",
            Command::CachePut { .. } => "cache_put",
            Command::CacheDelete { .. } => "cache_delete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_roundtrips_through_bincode() {
        let cmd = Command::AcquireLock {
            resource: "orders".to_string(),
            requester: "txn-9".to_string(),
            mode: LockMode::Exclusive,
            timeout_ms: 30_000,
            requested_at_ms: 1_700_000_000_000,
        };
        let bytes = bincode::serialize(&cmd).unwrap();
        let back: Command = bincode::deserialize(&bytes).unwrap();
        assert_eq!(cmd, back);
    }

    #[test]
    fn kind_names_are_stable() {
        let cmd = Command::CachePut {
            key: "k".to_string(),
            value: "v".to_string(),
            version: 1,
        };
        assert_eq!(cmd.kind(), "cache_put");
        let cmd = Command::Acknowledge {
            message_id: Uuid::new_v4(),
            consumer: "c1".to_string(),
        };
        assert_eq!(cmd.kind(), "acknowledge");
    }
}
