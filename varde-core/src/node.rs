//! Node lifecycle and application wiring.
//!
//! A `Node` binds the transport listener, runs the consensus actor, and
//! fans committed entries out to the registered applications. Every
//! background loop is a task holding a shutdown watch; `stop` flips the
//! watch, waits a bounded grace period, then aborts stragglers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{VardeError, VardeResult};
use crate::node_shared::SharedNodeState;
use crate::raft::command::Command;
use crate::raft::core::{ProposalRequest, RaftManager};
use crate::raft::log::LogEntry;
use crate::raft::messages::RaftRpc;
use crate::raft::state::RaftState;
use crate::transport::message::{Envelope, Payload};
use crate::transport::server;
use crate::types::{LogIndex, NodeId, NodeStatus};

/// A replicated state machine attached to the node.
///
/// `apply` runs on the node's single apply task, in log order, on every
/// cluster member. Implementations must be deterministic and must
/// ignore commands that belong to other applications.
#[async_trait]
pub trait Application: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, entry: &LogEntry) -> VardeResult<()>;

    /// Handles a non-consensus peer message. The default ignores it.
    async fn on_message(&self, from: NodeId, payload: &Payload) -> VardeResult<()> {
        let _ = (from, payload);
        Ok(())
    }

    /// Spawns the application's background loops, if any.
    fn start_tasks(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let _ = shutdown;
        Vec::new()
    }
}

pub struct Node {
    shared: Arc<SharedNodeState>,
    proposal_rx: Mutex<Option<mpsc::UnboundedReceiver<ProposalRequest>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Node {
    pub fn new(config: Config) -> VardeResult<Self> {
        config.validate()?;
        let (proposal_tx, proposal_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SharedNodeState::new(config, proposal_tx));
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            shared,
            proposal_rx: Mutex::new(Some(proposal_rx)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Handle applications use to submit commands and inspect state.
    pub fn shared(&self) -> Arc<SharedNodeState> {
        self.shared.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.shared.is_leader()
    }

    /// Proposes a command through consensus; non-leaders fast-fail.
    pub async fn submit_command(&self, command: Command) -> VardeResult<LogIndex> {
        self.shared.submit_command(command).await
    }

    /// Binds the listener and starts every background task. Callable
    /// once per node.
    pub async fn start(&self, applications: Vec<Arc<dyn Application>>) -> VardeResult<()> {
        let proposal_rx = self
            .proposal_rx
            .lock()
            .take()
            .ok_or_else(|| VardeError::Internal {
                message: "node already started".to_string(),
            })?;

        let config = self.shared.config().clone();
        let listener = server::bind(&config.node.bind_address).await?;

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (raft_tx, raft_rx) = mpsc::unbounded_channel();
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();

        let mut tasks = Vec::new();
        tasks.push(server::spawn_accept_loop(
            listener,
            incoming_tx,
            self.shutdown.subscribe(),
            self.shared.metrics().clone(),
        ));

        let peers: Vec<NodeId> = config.peers.iter().map(|peer| peer.id).collect();
        let state = RaftState::new(
            config.node.id,
            peers,
            config.raft.clone(),
            Instant::now(),
        );
        let manager = RaftManager::new(
            state,
            self.shared.clone(),
            raft_rx,
            proposal_rx,
            apply_tx,
            self.shutdown.subscribe(),
        );
        tasks.push(tokio::spawn(manager.run()));

        tasks.push(spawn_apply_loop(
            self.shared.clone(),
            applications.clone(),
            apply_rx,
            self.shutdown.subscribe(),
        ));
        tasks.push(spawn_dispatch_loop(
            self.shared.clone(),
            applications.clone(),
            incoming_rx,
            raft_tx,
            self.shutdown.subscribe(),
        ));
        tasks.push(spawn_heartbeat_loop(
            self.shared.clone(),
            self.shutdown.subscribe(),
        ));
        tasks.push(self.shared.detector().spawn_monitor(self.shutdown.subscribe()));

        for app in &applications {
            tasks.extend(app.clone().start_tasks(self.shutdown.subscribe()));
            info!(
                node_id = config.node.id,
                application = app.name(),
                "application attached"
            );
        }

        *self.tasks.lock() = tasks;
        self.running.store(true, Ordering::SeqCst);
        info!(
            node_id = config.node.id,
            address = %config.node.bind_address,
            peers = config.peers.len(),
            "node started"
        );
        Ok(())
    }

    /// Signals shutdown and waits up to five seconds for tasks to wind
    /// down before aborting whatever is left.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(node_id = self.shared.node_id(), "stopping node");
        let _ = self.shutdown.send(true);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && tasks.iter().any(|task| !task.is_finished()) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        for task in &tasks {
            if !task.is_finished() {
                task.abort();
            }
        }
        self.shared.connector().shutdown();
        info!(node_id = self.shared.node_id(), "node stopped");
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.shared.node_id(),
            address: self.shared.config().node.bind_address.clone(),
            running: self.running.load(Ordering::SeqCst),
            raft: self.shared.raft_status(),
            peers: self.shared.peer_statuses(),
            cluster_health: self.shared.cluster_health(),
            metrics: self.shared.metrics().snapshot(),
        }
    }
}

/// Applies committed entries in log order, fanning each entry out to
/// every application. Apply failures are logged and skipped.
fn spawn_apply_loop(
    shared: Arc<SharedNodeState>,
    applications: Vec<Arc<dyn Application>>,
    mut apply_rx: mpsc::UnboundedReceiver<LogEntry>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                entry = apply_rx.recv() => match entry {
                    Some(entry) => {
                        for app in &applications {
                            if let Err(err) = app.apply(&entry).await {
                                warn!(
                                    application = app.name(),
                                    index = entry.index,
                                    kind = entry.command.kind(),
                                    error = %err,
                                    "apply failed"
                                );
                            }
                        }
                        shared.metrics().incr("entries_applied");
                        shared.notify_commit(&entry);
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_dispatch_loop(
    shared: Arc<SharedNodeState>,
    applications: Vec<Arc<dyn Application>>,
    mut incoming_rx: mpsc::UnboundedReceiver<Envelope>,
    raft_tx: mpsc::UnboundedSender<RaftRpc>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                envelope = incoming_rx.recv() => match envelope {
                    Some(envelope) => {
                        dispatch(&shared, &applications, &raft_tx, envelope).await;
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

async fn dispatch(
    shared: &Arc<SharedNodeState>,
    applications: &[Arc<dyn Application>],
    raft_tx: &mpsc::UnboundedSender<RaftRpc>,
    envelope: Envelope,
) {
    let sender = envelope.sender;
    match envelope.payload.into_raft() {
        Ok(rpc) => {
            if raft_tx.send(rpc).is_err() {
                warn!("consensus channel closed, dropping rpc");
            }
        }
        Err(Payload::Heartbeat) => shared.detector().record_heartbeat(sender),
        Err(Payload::Ping { nonce }) => shared.send_to(sender, Payload::Pong { nonce }),
        Err(Payload::Pong { .. }) => {}
        Err(payload) => {
            for app in applications {
                if let Err(err) = app.on_message(sender, &payload).await {
                    warn!(
                        application = app.name(),
                        kind = payload.kind(),
                        from = sender,
                        error = %err,
                        "message handler failed"
                    );
                }
            }
        }
    }
}

/// Failure detector beacon, independent of the consensus heartbeat.
fn spawn_heartbeat_loop(
    shared: Arc<SharedNodeState>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let period = shared.config().detector.heartbeat_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    shared.broadcast(Payload::Heartbeat);
                    shared.metrics().incr("heartbeats_sent");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeSettings;
    use crate::raft::command::Command;

    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<LogEntry>>,
    }

    #[async_trait]
    impl Application for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn apply(&self, entry: &LogEntry) -> VardeResult<()> {
            self.applied.lock().push(entry.clone());
            Ok(())
        }
    }

    fn standalone_config() -> Config {
        Config {
            node: NodeSettings {
                id: 1,
                bind_address: "127.0.0.1:0".to_string(),
                ..NodeSettings::default()
            },
            ..Config::default()
        }
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            if Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn standalone_node_elects_itself_and_applies_commands() {
        let _ = tracing_subscriber::fmt::try_init();
        let node = Node::new(standalone_config()).unwrap();
        let app = Arc::new(Recorder::default());
        node.start(vec![app.clone()]).await.unwrap();

        wait_until("leadership", || node.is_leader()).await;

        let index = node
            .submit_command(Command::CachePut {
                key: "greeting".to_string(),
                value: "hello".to_string(),
                version: 1,
            })
            .await
            .unwrap();
        assert_eq!(index, 1);

        wait_until("apply", || !app.applied.lock().is_empty()).await;
        {
            let applied = app.applied.lock();
            assert_eq!(applied.len(), 1);
            assert_eq!(applied[0].index, 1);
            assert_eq!(applied[0].command.kind(), "cache_put");
        }

        let status = node.status();
        assert!(status.running);
        assert!(status.raft.is_leader());
        assert_eq!(status.raft.commit_index, 1);

        // The status snapshot is what admin layers serialize.
        let rendered = serde_json::to_value(&status).unwrap();
        assert_eq!(rendered["node_id"], 1);
        assert_eq!(rendered["raft"]["role"], "Leader");
        assert_eq!(rendered["raft"]["commit_index"], 1);

        node.stop().await;
        assert!(!node.status().running);
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let node = Node::new(standalone_config()).unwrap();
        node.start(vec![]).await.unwrap();
        match node.start(vec![]).await {
            Err(VardeError::Internal { .. }) => {}
            other => panic!("expected second start to fail, got {other:?}"),
        }
        node.stop().await;
    }
}
