//! Three real nodes over TCP, with all three applications attached.
//!
//! Each test stands up its own cluster on fresh localhost ports and
//! drives it through the public application surfaces only: acquire and
//! release locks, enqueue and drain messages, read and write the cache.
//! Timing knobs are tightened so elections and detection cycles finish
//! quickly, but the protocols themselves run unmodified.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;

use varde_apps::{CoherentCache, LockManager, ReplicatedQueue};
use varde_core::config::{
    CacheConfig, DetectorConfig, LockConfig, NodeSettings, RaftTuning, TransportConfig,
};
use varde_core::{Application, Config, LockMode, Node, NodeId, PeerSpec};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Distinct free ports, reserved together so they cannot collide with
/// each other. The listeners drop on return; the race against other
/// processes is accepted.
fn free_ports(count: usize) -> Vec<u16> {
    let probes: Vec<std::net::TcpListener> = (0..count)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").expect("port probe"))
        .collect();
    probes
        .iter()
        .map(|probe| probe.local_addr().expect("probe addr").port())
        .collect()
}

/// Election and detection timing relaxed enough to ride out a loaded
/// test machine, tight enough to keep the tests quick.
fn member_config(id: NodeId, ports: &[u16], data_dir: &Path) -> Config {
    let peers = ports
        .iter()
        .enumerate()
        .map(|(i, port)| (i as NodeId + 1, port))
        .filter(|(peer_id, _)| *peer_id != id)
        .map(|(peer_id, port)| PeerSpec {
            id: peer_id,
            address: format!("127.0.0.1:{port}"),
        })
        .collect();
    Config {
        node: NodeSettings {
            id,
            bind_address: format!("127.0.0.1:{}", ports[(id - 1) as usize]),
            data_dir: data_dir.to_path_buf(),
        },
        peers,
        raft: RaftTuning {
            election_timeout_min: Duration::from_millis(500),
            election_timeout_max: Duration::from_millis(900),
            heartbeat_interval: Duration::from_millis(100),
            ..RaftTuning::default()
        },
        transport: TransportConfig {
            reconnect_base_delay: Duration::from_millis(50),
            ..TransportConfig::default()
        },
        detector: DetectorConfig {
            heartbeat_interval: Duration::from_millis(200),
            ..DetectorConfig::default()
        },
        lock: LockConfig {
            deadlock_interval: Duration::from_millis(500),
            poll_interval: Duration::from_millis(25),
            ..LockConfig::default()
        },
        cache: CacheConfig {
            fetch_wait: Duration::from_millis(250),
            ..CacheConfig::default()
        },
        ..Config::default()
    }
}

struct Member {
    node: Arc<Node>,
    locks: Arc<LockManager>,
    queue: Arc<ReplicatedQueue>,
    cache: Arc<CoherentCache>,
}

struct TestCluster {
    members: Vec<Member>,
    _dirs: Vec<TempDir>,
}

impl TestCluster {
    async fn start(size: u64) -> Self {
        init_tracing();
        let ports = free_ports(size as usize);
        let mut members = Vec::new();
        let mut dirs = Vec::new();
        for id in 1..=size {
            let dir = tempfile::tempdir().expect("tempdir");
            let node = Arc::new(Node::new(member_config(id, &ports, dir.path())).expect("config"));
            let shared = node.shared();
            let locks = LockManager::new(shared.clone());
            let queue = ReplicatedQueue::new(shared.clone()).expect("queue state");
            let cache = CoherentCache::new(shared);
            let apps: Vec<Arc<dyn Application>> =
                vec![locks.clone(), queue.clone(), cache.clone()];
            node.start(apps).await.expect("node start");
            members.push(Member {
                node,
                locks,
                queue,
                cache,
            });
            dirs.push(dir);
        }
        Self {
            members,
            _dirs: dirs,
        }
    }

    /// Index of a leader every running member agrees on. Agreement
    /// means heartbeats have reached everyone, so submissions routed to
    /// this member will not bounce off a stale view.
    async fn settled_leader(&self) -> usize {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            let running: Vec<usize> = self
                .members
                .iter()
                .enumerate()
                .filter(|(_, member)| member.node.status().running)
                .map(|(i, _)| i)
                .collect();
            if let Some(&leader) = running.iter().find(|&&i| self.members[i].node.is_leader()) {
                let id = self.members[leader].node.shared().node_id();
                let agreed = running
                    .iter()
                    .all(|&i| self.members[i].node.shared().raft_status().leader_id == Some(id));
                if agreed {
                    return leader;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("cluster never settled on a leader");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn follower_indexes(&self, leader: usize) -> Vec<usize> {
        (0..self.members.len()).filter(|&i| i != leader).collect()
    }

    async fn stop_all(&self) {
        for member in &self.members {
            member.node.stop().await;
        }
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, condition: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_for_value(cache: &Arc<CoherentCache>, key: &str, want: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if cache.get(key).await.as_deref() == Some(want) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {key}={want}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_for_absent(cache: &Arc<CoherentCache>, key: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if cache.get(key).await.is_none() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {key} to disappear");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Lines held cluster-wide in a write-capable state (Modified or
/// Exclusive).
fn writable_lines(cluster: &TestCluster) -> usize {
    cluster
        .members
        .iter()
        .map(|member| {
            let stats = member.cache.stats();
            stats.modified + stats.exclusive
        })
        .sum()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_settle_on_one_leader() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.settled_leader().await;

    let leaders = cluster
        .members
        .iter()
        .filter(|member| member.node.is_leader())
        .count();
    assert_eq!(leaders, 1);

    let leader_id = cluster.members[leader].node.shared().node_id();
    for member in &cluster.members {
        let status = member.node.status();
        assert_eq!(status.raft.leader_id, Some(leader_id));
        assert_eq!(status.peers.len(), 2);
    }

    // Detector beacons run on their own cadence; soon every member
    // classifies both peers alive.
    wait_until("every peer classified alive", Duration::from_secs(10), || {
        cluster
            .members
            .iter()
            .all(|member| member.node.shared().cluster_health().alive == 2)
    })
    .await;

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exclusive_locks_exclude_rivals_and_hand_off_on_release() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.settled_leader().await;
    let locks = &cluster.members[leader].locks;

    assert!(locks
        .acquire("orders/42", "tx-a", LockMode::Exclusive, None)
        .await
        .unwrap());

    // A rival waits its timeout out and comes back empty-handed.
    assert!(!locks
        .acquire(
            "orders/42",
            "tx-b",
            LockMode::Exclusive,
            Some(Duration::from_millis(700)),
        )
        .await
        .unwrap());

    // The lock table is replicated: a follower reports the holder from
    // its own applied state.
    let follower = cluster.follower_indexes(leader)[0];
    wait_until("follower sees the holder", Duration::from_secs(5), || {
        cluster.members[follower].locks.status("orders/42").holders == vec!["tx-a".to_string()]
    })
    .await;

    // Submitting through a non-leader is refused outright.
    assert!(!cluster.members[follower]
        .locks
        .acquire(
            "orders/42",
            "tx-c",
            LockMode::Exclusive,
            Some(Duration::from_millis(200)),
        )
        .await
        .unwrap());

    // A queued waiter takes over the moment the holder releases.
    let waiting = {
        let locks = locks.clone();
        tokio::spawn(async move {
            locks
                .acquire(
                    "orders/42",
                    "tx-b",
                    LockMode::Exclusive,
                    Some(Duration::from_secs(15)),
                )
                .await
        })
    };
    wait_until("waiter queued", Duration::from_secs(5), || {
        locks
            .status("orders/42")
            .waiters
            .contains(&"tx-b".to_string())
    })
    .await;
    assert!(locks.release("orders/42", "tx-a").await.unwrap());
    assert!(waiting.await.unwrap().unwrap());
    assert_eq!(
        locks.status("orders/42").holders,
        vec!["tx-b".to_string()]
    );

    // Shared readers coexist on another resource.
    assert!(locks
        .acquire("reports", "r1", LockMode::Shared, None)
        .await
        .unwrap());
    assert!(locks
        .acquire("reports", "r2", LockMode::Shared, None)
        .await
        .unwrap());
    assert_eq!(locks.status("reports").holders.len(), 2);

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_message_is_served_by_exactly_one_ring_owner() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.settled_leader().await;
    let queue_names = ["invoices", "emails", "reports", "audits", "backups"];

    for i in 0..30 {
        let name = queue_names[i % queue_names.len()];
        assert!(cluster.members[leader]
            .queue
            .enqueue(name, &format!("payload-{i}"), None)
            .await
            .unwrap());
    }

    // Every replica applies every enqueue before we start draining.
    wait_until("all replicas hold 30 messages", Duration::from_secs(10), || {
        cluster
            .members
            .iter()
            .all(|member| member.queue.stats().index_size == 30)
    })
    .await;

    // Partitions have a single ring owner apiece, so draining all
    // three nodes yields each message exactly once.
    let mut seen = HashSet::new();
    for member in &cluster.members {
        for name in queue_names {
            while let Some(message) = member.queue.dequeue(name, "worker-1").await.unwrap() {
                assert!(message.delivered);
                assert!(seen.insert(message.id), "message served by two owners");
            }
        }
    }
    assert_eq!(seen.len(), 30);

    // Acknowledged messages disappear from every replica for good.
    for id in &seen {
        assert!(cluster.members[leader]
            .queue
            .acknowledge(*id, "worker-1")
            .await
            .unwrap());
    }
    wait_until("acks drain every index", Duration::from_secs(10), || {
        cluster
            .members
            .iter()
            .all(|member| member.queue.stats().index_size == 0)
    })
    .await;
    for member in &cluster.members {
        for name in queue_names {
            assert_eq!(member.queue.dequeue(name, "worker-1").await.unwrap(), None);
        }
    }

    let stats = cluster.members[leader].queue.stats();
    assert_eq!(stats.enqueued, 30);
    assert_eq!(stats.acknowledged, 30);

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retried_enqueue_redelivers_under_the_same_id() {
    let cluster = TestCluster::start(1).await;
    let leader = cluster.settled_leader().await;
    let queue = &cluster.members[leader].queue;

    // A producer retry resends the same message id. Both sends land in
    // the FIFO, but the index holds one entry per id.
    let id = Uuid::new_v4();
    assert!(queue.enqueue("jobs", "send-report", Some(id)).await.unwrap());
    assert!(queue.enqueue("jobs", "send-report", Some(id)).await.unwrap());
    wait_until("both sends applied", Duration::from_secs(10), || {
        queue.stats().enqueued == 2
    })
    .await;
    assert_eq!(queue.stats().index_size, 1);

    // The consumer sees the id twice and dedupes on its side.
    let first = queue.dequeue("jobs", "worker-1").await.unwrap().unwrap();
    let second = queue.dequeue("jobs", "worker-1").await.unwrap().unwrap();
    assert_eq!(first.id, id);
    assert_eq!(second.id, id);

    assert!(queue.acknowledge(id, "worker-1").await.unwrap());
    wait_until("ack clears the index", Duration::from_secs(10), || {
        queue.stats().index_size == 0
    })
    .await;
    assert_eq!(queue.dequeue("jobs", "worker-1").await.unwrap(), None);

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cache_reads_follow_writes_across_nodes() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.settled_leader().await;
    let followers = cluster.follower_indexes(leader);

    assert!(cluster.members[leader]
        .cache
        .put("motd", "first")
        .await
        .unwrap());
    for &f in &followers {
        wait_for_value(&cluster.members[f].cache, "motd", "first").await;
    }
    // One key is live, so write ownership is held once cluster-wide.
    assert!(
        writable_lines(&cluster) <= 1,
        "two members claim write ownership"
    );

    // Overwriting invalidates remote copies; readers converge on the
    // replacement.
    assert!(cluster.members[leader]
        .cache
        .put("motd", "second")
        .await
        .unwrap());
    for &f in &followers {
        wait_for_value(&cluster.members[f].cache, "motd", "second").await;
    }
    assert!(
        writable_lines(&cluster) <= 1,
        "two members claim write ownership"
    );

    // Off-leader writes are refused and leave nothing behind.
    assert!(!cluster.members[followers[0]]
        .cache
        .put("rogue", "x")
        .await
        .unwrap());
    assert_eq!(cluster.members[leader].cache.get("rogue").await, None);

    // Deletion empties every replica; fetches find no owner to answer.
    assert!(cluster.members[leader].cache.delete("motd").await.unwrap());
    for &f in &followers {
        wait_for_absent(&cluster.members[f].cache, "motd").await;
    }
    wait_for_absent(&cluster.members[leader].cache, "motd").await;
    assert_eq!(writable_lines(&cluster), 0);

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deadlock_cycle_is_broken_by_releasing_the_newest_holder() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.settled_leader().await;
    let locks = &cluster.members[leader].locks;

    // Three transactions each hold one account.
    for (resource, tx) in [("acct-a", "tx-1"), ("acct-b", "tx-2"), ("acct-c", "tx-3")] {
        assert!(locks
            .acquire(resource, tx, LockMode::Exclusive, None)
            .await
            .unwrap());
    }

    // Crossed second acquisitions close the cycle:
    // tx-1 -> acct-b, tx-2 -> acct-c, tx-3 -> acct-a.
    // tx-3 holds the newest grant, so it is the predetermined victim;
    // its request gets the short timeout.
    let w1 = {
        let locks = locks.clone();
        tokio::spawn(async move {
            locks
                .acquire(
                    "acct-b",
                    "tx-1",
                    LockMode::Exclusive,
                    Some(Duration::from_secs(15)),
                )
                .await
        })
    };
    let w2 = {
        let locks = locks.clone();
        tokio::spawn(async move {
            locks
                .acquire(
                    "acct-c",
                    "tx-2",
                    LockMode::Exclusive,
                    Some(Duration::from_secs(15)),
                )
                .await
        })
    };
    let w3 = {
        let locks = locks.clone();
        tokio::spawn(async move {
            locks
                .acquire(
                    "acct-a",
                    "tx-3",
                    LockMode::Exclusive,
                    Some(Duration::from_secs(4)),
                )
                .await
        })
    };

    // The victim's release unblocks tx-2 without any manual action.
    assert!(
        w2.await.unwrap().unwrap(),
        "waiter behind the victim should be granted"
    );
    assert_eq!(
        cluster.members[leader].locks.status("acct-c").holders,
        vec!["tx-2".to_string()]
    );

    // The rest of the chain unwinds through ordinary releases.
    assert!(locks.release("acct-b", "tx-2").await.unwrap());
    assert!(w1.await.unwrap().unwrap());

    // The victim's own request was cancelled along with its grant.
    assert!(!w3.await.unwrap().unwrap());
    assert!(!locks.holds("acct-c", "tx-3"));
    assert!(locks.holds("acct-a", "tx-1"));

    let metrics = cluster.members[leader].node.shared().metrics().clone();
    assert!(metrics.counter("lock_deadlocks_detected") >= 1);
    assert!(metrics.counter("lock_deadlock_victims") >= 1);

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn surviving_majority_elects_and_keeps_committing() {
    let cluster = TestCluster::start(3).await;
    let old = cluster.settled_leader().await;

    assert!(cluster.members[old]
        .cache
        .put("epoch", "one")
        .await
        .unwrap());
    for i in cluster.follower_indexes(old) {
        wait_for_value(&cluster.members[i].cache, "epoch", "one").await;
    }
    let old_term = cluster.members[old].node.shared().raft_status().term;

    cluster.members[old].node.stop().await;

    let new = cluster.settled_leader().await;
    assert_ne!(new, old, "a survivor must take over");
    assert!(cluster.members[new].node.shared().raft_status().term > old_term);

    // Two of three is still a quorum; writes keep committing.
    assert!(cluster.members[new]
        .cache
        .put("epoch", "two")
        .await
        .unwrap());
    let witness = (0..cluster.members.len())
        .find(|&i| i != old && i != new)
        .unwrap();
    wait_for_value(&cluster.members[witness].cache, "epoch", "two").await;

    cluster.stop_all().await;
}
