//! Replicated applications for varde nodes.
//!
//! Three state machines build on the varde-core consensus log: a lock
//! manager with deadlock detection, a partitioned message queue with
//! at-least-once delivery, and a cache kept coherent with the MESI
//! protocol. Each implements [`varde_core::Application`]; attach them
//! when starting the node and drive them through their own APIs.

pub mod cache;
pub mod deadlock;
pub mod lock;
pub mod queue;
pub mod ring;

pub use cache::{CacheStats, CoherentCache, MesiState};
pub use deadlock::WaitForGraph;
pub use lock::{LockManager, LockStatus};
pub use queue::{QueueStats, ReplicatedQueue};
pub use ring::ConsistentHashRing;
