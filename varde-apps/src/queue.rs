//! Partitioned message queue.
//!
//! Enqueues replicate through the log to every node; serving is
//! partitioned. A queue name hashes to a fixed partition, and the
//! consistent hash ring over node addresses decides which node serves
//! dequeues for it. Delivery is at-least-once: a message leaves the
//! FIFO when popped, leaves the index when acknowledged, and only the
//! index decides redelivery after a snapshot reload.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use varde_core::{
    Application, Command, LogEntry, QueueMessage, SharedNodeState, VardeError, VardeResult,
};

use crate::ring::{hash_position, ConsistentHashRing};

/// Everything the snapshot persists: FIFO order per partition, the
/// live message index, and per-consumer delivery offsets.
#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueState {
    partitions: HashMap<u32, VecDeque<Uuid>>,
    index: HashMap<Uuid, QueueMessage>,
    offsets: HashMap<String, HashMap<u32, u64>>,
}

/// Point-in-time view of the queue, for operators and tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub total_queued: usize,
    pub index_size: usize,
    pub partition_depths: BTreeMap<u32, usize>,
    pub owned_partitions: Vec<u32>,
    pub consumers: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub acknowledged: u64,
}

pub struct ReplicatedQueue {
    shared: Arc<SharedNodeState>,
    ring: ConsistentHashRing,
    own_address: String,
    partition_count: u32,
    state: Mutex<QueueState>,
    snapshot_path: PathBuf,
}

impl ReplicatedQueue {
    /// Builds the ring from the configured membership and reloads the
    /// last snapshot. A missing snapshot starts empty; an unreadable
    /// one is a hard error, since serving from a silently truncated
    /// state would drop messages.
    pub fn new(shared: Arc<SharedNodeState>) -> VardeResult<Arc<Self>> {
        let config = shared.config();
        let own_address = config.node.bind_address.clone();
        let mut addresses: Vec<String> = vec![own_address.clone()];
        addresses.extend(config.peers.iter().map(|peer| peer.address.clone()));
        let ring = ConsistentHashRing::with_nodes(config.queue.virtual_nodes, &addresses);

        let data_dir = config.node.data_dir.clone();
        std::fs::create_dir_all(&data_dir).map_err(|e| VardeError::Io {
            operation: format!("create data dir {}", data_dir.display()),
            source: e,
        })?;
        let snapshot_path = data_dir.join(format!("queue-{}.snapshot", config.node.id));
        let state = load_snapshot(&snapshot_path)?;
        let partition_count = config.queue.partition_count;

        Ok(Arc::new(Self {
            shared,
            ring,
            own_address,
            partition_count,
            state: Mutex::new(state),
            snapshot_path,
        }))
    }

    /// The fixed partition a queue name maps to.
    pub fn partition_of(&self, queue: &str) -> u32 {
        (hash_position(queue) % self.partition_count as u128) as u32
    }

    /// Whether this node serves dequeues for the partition.
    pub fn owns_partition(&self, partition: u32) -> bool {
        self.ring.node_for(&format!("partition_{partition}")) == Some(self.own_address.as_str())
    }

    /// Submits a message for replication. Returns `false` from a
    /// non-leader node. A caller-supplied id keeps retries idempotent
    /// at the consumer; otherwise a fresh v4 id is minted.
    pub async fn enqueue(
        &self,
        queue: &str,
        payload: &str,
        id: Option<Uuid>,
    ) -> VardeResult<bool> {
        let message = QueueMessage {
            id: id.unwrap_or_else(Uuid::new_v4),
            queue: queue.to_string(),
            payload: payload.to_string(),
            partition: self.partition_of(queue),
            enqueued_at_ms: Utc::now().timestamp_millis(),
            retry_count: 0,
            delivered: false,
        };
        let id = message.id;
        match self.shared.submit_command(Command::Enqueue { message }).await {
            Ok(_) => {
                debug!(queue, message_id = %id, "message submitted");
                Ok(true)
            }
            Err(VardeError::NotLeader { leader_hint }) => {
                debug!(queue, ?leader_hint, "enqueue refused off-leader");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Pops the next live message from the queue's partition.
    ///
    /// Returns `None` when this node does not own the partition
    /// (callers retry against other nodes) or the FIFO holds nothing
    /// live. Ids already acknowledged are skipped, never redelivered.
    /// The delivery mark replicates best-effort: if it fails, the
    /// message is still handed out and may be redelivered later.
    pub async fn dequeue(&self, queue: &str, consumer: &str) -> VardeResult<Option<QueueMessage>> {
        let partition = self.partition_of(queue);
        if !self.owns_partition(partition) {
            debug!(queue, partition, "dequeue refused, partition owned elsewhere");
            return Ok(None);
        }

        let picked = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut picked = None;
            if let Some(fifo) = state.partitions.get_mut(&partition) {
                while let Some(id) = fifo.pop_front() {
                    if let Some(message) = state.index.get(&id) {
                        picked = Some(message.clone());
                        break;
                    }
                    // acknowledged while queued; drop the id
                }
            }
            if picked.is_some() {
                let per_partition = state.offsets.entry(consumer.to_string()).or_default();
                *per_partition.entry(partition).or_insert(0) += 1;
            }
            picked
        };

        let Some(mut message) = picked else {
            return Ok(None);
        };
        message.delivered = true;
        self.shared.metrics().incr("queue_dequeued");
        let mark = Command::MarkDelivered {
            message_id: message.id,
            consumer: consumer.to_string(),
        };
        if let Err(err) = self.shared.submit_command(mark).await {
            warn!(message_id = %message.id, error = %err, "delivery mark not replicated");
        }
        Ok(Some(message))
    }

    /// Confirms processing. The committed acknowledge removes the
    /// message from every node's index. Returns `false` from a
    /// non-leader node.
    pub async fn acknowledge(&self, message_id: Uuid, consumer: &str) -> VardeResult<bool> {
        let command = Command::Acknowledge {
            message_id,
            consumer: consumer.to_string(),
        };
        match self.shared.submit_command(command).await {
            Ok(_) => Ok(true),
            Err(VardeError::NotLeader { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let metrics = self.shared.metrics();
        QueueStats {
            total_queued: state.partitions.values().map(VecDeque::len).sum(),
            index_size: state.index.len(),
            partition_depths: state
                .partitions
                .iter()
                .map(|(partition, fifo)| (*partition, fifo.len()))
                .collect(),
            owned_partitions: (0..self.partition_count)
                .filter(|p| self.owns_partition(*p))
                .collect(),
            consumers: state.offsets.len(),
            enqueued: metrics.counter("queue_enqueued"),
            dequeued: metrics.counter("queue_dequeued"),
            acknowledged: metrics.counter("queue_acknowledged"),
        }
    }

    fn apply_enqueue(&self, message: &QueueMessage) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state
            .partitions
            .entry(message.partition)
            .or_default()
            .push_back(message.id);
        state.index.insert(message.id, message.clone());
        self.shared.metrics().incr("queue_enqueued");
        debug!(
            queue = %message.queue,
            message_id = %message.id,
            partition = message.partition,
            "message enqueued"
        );
    }

    fn apply_mark_delivered(&self, message_id: Uuid, consumer: &str) {
        let mut state = self.state.lock();
        match state.index.get_mut(&message_id) {
            Some(message) => {
                if message.delivered {
                    message.retry_count += 1;
                    self.shared.metrics().incr("queue_redeliveries");
                }
                message.delivered = true;
                debug!(%message_id, consumer, "delivery recorded");
            }
            None => debug!(%message_id, "delivery mark for an unindexed message"),
        }
    }

    fn apply_acknowledge(&self, message_id: Uuid, consumer: &str) {
        // the FIFO keeps the id; dequeue skips it once the index entry
        // is gone
        let mut state = self.state.lock();
        if state.index.remove(&message_id).is_some() {
            self.shared.metrics().incr("queue_acknowledged");
            debug!(%message_id, consumer, "message acknowledged");
        } else {
            debug!(%message_id, consumer, "acknowledge for an unknown message");
        }
    }

    /// Serializes the full queue state to a temp file and renames it
    /// into place, so readers never observe a partial snapshot.
    async fn write_snapshot(&self) -> VardeResult<()> {
        let bytes = {
            let state = self.state.lock();
            bincode::serialize(&*state).map_err(|e| VardeError::Serialization {
                operation: "encode queue snapshot".to_string(),
                source: Box::new(e),
            })?
        };
        let tmp = self.snapshot_path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| VardeError::Io {
                operation: format!("write queue snapshot {}", tmp.display()),
                source: e,
            })?;
        tokio::fs::rename(&tmp, &self.snapshot_path)
            .await
            .map_err(|e| VardeError::Io {
                operation: format!("publish queue snapshot {}", self.snapshot_path.display()),
                source: e,
            })?;
        self.shared.metrics().incr("queue_snapshots_written");
        Ok(())
    }

    async fn persistence_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.shared.config().queue.persist_interval;
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.write_snapshot().await {
                        self.shared.metrics().incr("queue_snapshot_failures");
                        warn!(error = %err, "queue snapshot failed, continuing in memory");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        // one parting snapshot so a clean stop loses nothing
                        if let Err(err) = self.write_snapshot().await {
                            warn!(error = %err, "final queue snapshot failed");
                        }
                        break;
                    }
                }
            }
        }
    }
}

fn load_snapshot(path: &Path) -> VardeResult<QueueState> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(QueueState::default());
        }
        Err(err) => {
            return Err(VardeError::Io {
                operation: format!("read queue snapshot {}", path.display()),
                source: err,
            });
        }
    };
    let state: QueueState =
        bincode::deserialize(&bytes).map_err(|e| VardeError::Serialization {
            operation: format!("decode queue snapshot {}", path.display()),
            source: Box::new(e),
        })?;
    info!(
        snapshot = %path.display(),
        messages = state.index.len(),
        "queue snapshot loaded"
    );
    Ok(state)
}

#[async_trait]
impl Application for ReplicatedQueue {
    fn name(&self) -> &'static str {
        "replicated_queue"
    }

    async fn apply(&self, entry: &LogEntry) -> VardeResult<()> {
        match &entry.command {
            Command::Enqueue { message } => self.apply_enqueue(message),
            Command::MarkDelivered {
                message_id,
                consumer,
            } => self.apply_mark_delivered(*message_id, consumer),
            Command::Acknowledge {
                message_id,
                consumer,
            } => self.apply_acknowledge(*message_id, consumer),
            _ => {}
        }
        Ok(())
    }

    fn start_tasks(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![tokio::spawn(self.persistence_loop(shutdown))]
    }
}
