//! Distributed lock manager.
//!
//! Lock state is replicated: every node applies the same committed
//! acquire/release/cancel entries in the same order, so holder and
//! waiter sets match everywhere. The caller API submits a command and
//! polls the locally applied table for the effect. A background pass
//! rebuilds the wait-for graph from waiter state and, on the leader,
//! breaks cycles by forcibly releasing the youngest transaction.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use varde_core::{
    Application, Command, LockMode, LogEntry, SharedNodeState, VardeError, VardeResult,
};

use crate::deadlock::WaitForGraph;

#[derive(Debug, Clone)]
struct Waiter {
    requester: String,
    mode: LockMode,
    timeout_ms: u64,
    requested_at_ms: i64,
}

impl Waiter {
    /// Waiters expire against the applying entry's timestamp, never the
    /// local clock, so replicas prune identically.
    fn expired_at(&self, now_ms: i64) -> bool {
        self.requested_at_ms.saturating_add(self.timeout_ms as i64) <= now_ms
    }
}

#[derive(Debug, Default)]
struct LockEntry {
    mode: Option<LockMode>,
    holders: BTreeSet<String>,
    waiters: VecDeque<Waiter>,
}

impl LockEntry {
    fn admits(&self, mode: LockMode) -> bool {
        self.holders.is_empty()
            || (mode == LockMode::Shared && self.mode == Some(LockMode::Shared))
    }

    /// An exclusive request from the sole shared holder is an upgrade.
    fn admits_upgrade(&self, requester: &str, mode: LockMode) -> bool {
        mode == LockMode::Exclusive
            && self.mode == Some(LockMode::Shared)
            && self.holders.len() == 1
            && self.holders.contains(requester)
    }

    fn is_unused(&self) -> bool {
        self.holders.is_empty() && self.waiters.is_empty()
    }
}

#[derive(Debug, Default)]
struct LockTable {
    locks: BTreeMap<String, LockEntry>,
    /// requester -> resources currently held, for victim release
    held: HashMap<String, BTreeSet<String>>,
    /// requester -> wall clock of its most recent grant, for victim choice
    last_granted_ms: HashMap<String, i64>,
}

/// Snapshot of one resource's lock state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockStatus {
    pub resource: String,
    pub holders: Vec<String>,
    pub mode: Option<LockMode>,
    pub waiters: Vec<String>,
}

pub struct LockManager {
    shared: Arc<SharedNodeState>,
    table: RwLock<LockTable>,
}

impl LockManager {
    pub fn new(shared: Arc<SharedNodeState>) -> Arc<Self> {
        Arc::new(Self {
            shared,
            table: RwLock::new(LockTable::default()),
        })
    }

    /// Submits an acquisition and polls local applied state until the
    /// requester holds the resource or the timeout passes. A timeout
    /// cancels the pending request best-effort and reports `false`, as
    /// does submitting through a non-leader node.
    pub async fn acquire(
        &self,
        resource: &str,
        requester: &str,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> VardeResult<bool> {
        let timeout = timeout.unwrap_or(self.shared.config().lock.default_timeout);
        let poll = self.shared.config().lock.poll_interval;
        let command = Command::AcquireLock {
            resource: resource.to_string(),
            requester: requester.to_string(),
            mode,
            timeout_ms: timeout.as_millis() as u64,
            requested_at_ms: Utc::now().timestamp_millis(),
        };
        match self.shared.submit_command(command).await {
            Ok(_) => {}
            Err(VardeError::NotLeader { leader_hint }) => {
                debug!(resource, requester, ?leader_hint, "acquire refused off-leader");
                return Ok(false);
            }
            Err(err) => return Err(err),
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.holds(resource, requester) {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(poll).await;
        }

        self.shared.metrics().incr("lock_acquire_timeouts");
        debug!(resource, requester, "acquisition timed out, cancelling");
        let cancel = Command::CancelLockRequest {
            resource: resource.to_string(),
            requester: requester.to_string(),
        };
        if let Err(err) = self.shared.submit_command(cancel).await {
            debug!(resource, requester, error = %err, "timeout cancel not replicated");
        }
        Ok(false)
    }

    /// Submits a release. Returns `false` from a non-leader node.
    pub async fn release(&self, resource: &str, holder: &str) -> VardeResult<bool> {
        let command = Command::ReleaseLock {
            resource: resource.to_string(),
            holder: holder.to_string(),
        };
        match self.shared.submit_command(command).await {
            Ok(_) => Ok(true),
            Err(VardeError::NotLeader { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn holds(&self, resource: &str, requester: &str) -> bool {
        self.table
            .read()
            .locks
            .get(resource)
            .map_or(false, |lock| lock.holders.contains(requester))
    }

    /// Holder and waiter view of one resource, from local applied state.
    pub fn status(&self, resource: &str) -> LockStatus {
        let table = self.table.read();
        match table.locks.get(resource) {
            Some(lock) => LockStatus {
                resource: resource.to_string(),
                holders: lock.holders.iter().cloned().collect(),
                mode: lock.mode,
                waiters: lock.waiters.iter().map(|w| w.requester.clone()).collect(),
            },
            None => LockStatus {
                resource: resource.to_string(),
                holders: Vec::new(),
                mode: None,
                waiters: Vec::new(),
            },
        }
    }

    fn apply_acquire(
        &self,
        resource: &str,
        requester: &str,
        mode: LockMode,
        timeout_ms: u64,
        requested_at_ms: i64,
        applied_at_ms: i64,
    ) {
        let mut guard = self.table.write();
        let table = &mut *guard;
        let lock = table.locks.entry(resource.to_string()).or_default();

        if lock.holders.contains(requester) {
            if lock.admits_upgrade(requester, mode) {
                lock.mode = Some(LockMode::Exclusive);
                table
                    .last_granted_ms
                    .insert(requester.to_string(), applied_at_ms);
                self.shared.metrics().incr("lock_upgrades");
                debug!(resource, requester, "sole shared holder upgraded to exclusive");
                return;
            }
            if mode == LockMode::Exclusive && lock.mode == Some(LockMode::Shared) {
                // upgrade blocked by other readers; queue it below
            } else {
                // re-entrant acquire under a covering mode
                table
                    .last_granted_ms
                    .insert(requester.to_string(), applied_at_ms);
                return;
            }
        }

        if !lock.holders.contains(requester) && lock.admits(mode) {
            lock.holders.insert(requester.to_string());
            lock.mode = Some(mode);
            table
                .held
                .entry(requester.to_string())
                .or_default()
                .insert(resource.to_string());
            table
                .last_granted_ms
                .insert(requester.to_string(), applied_at_ms);
            self.shared.metrics().incr("lock_grants");
            debug!(resource, requester, %mode, "lock granted");
        } else if lock.waiters.iter().any(|w| w.requester == requester) {
            debug!(resource, requester, "duplicate wait request ignored");
        } else {
            lock.waiters.push_back(Waiter {
                requester: requester.to_string(),
                mode,
                timeout_ms,
                requested_at_ms,
            });
            self.shared.metrics().incr("lock_waits");
            debug!(resource, requester, %mode, "queued behind current holders");
        }
    }

    fn apply_release(&self, resource: &str, holder: &str, applied_at_ms: i64) {
        let mut guard = self.table.write();
        let table = &mut *guard;
        let Some(lock) = table.locks.get_mut(resource) else {
            debug!(resource, holder, "release for an unknown resource");
            return;
        };
        if !lock.holders.remove(holder) {
            debug!(resource, holder, "release by a non-holder ignored");
            return;
        }
        if lock.holders.is_empty() {
            lock.mode = None;
        }
        if let Some(resources) = table.held.get_mut(holder) {
            resources.remove(resource);
            if resources.is_empty() {
                table.held.remove(holder);
            }
        }
        self.shared.metrics().incr("lock_releases");
        debug!(resource, holder, "lock released");

        // promote waiters: FIFO, dropping expired entries, sharing
        // compatible readers, stopping once a writer takes over
        loop {
            let (expired, admitted) = match lock.waiters.front() {
                Some(w) => (
                    w.expired_at(applied_at_ms),
                    lock.admits(w.mode) || lock.admits_upgrade(&w.requester, w.mode),
                ),
                None => break,
            };
            if expired {
                if let Some(dropped) = lock.waiters.pop_front() {
                    self.shared.metrics().incr("lock_waiters_expired");
                    debug!(resource, requester = %dropped.requester, "expired waiter dropped");
                }
                continue;
            }
            if !admitted {
                break;
            }
            let Some(waiter) = lock.waiters.pop_front() else {
                break;
            };
            lock.holders.insert(waiter.requester.clone());
            lock.mode = Some(waiter.mode);
            table
                .held
                .entry(waiter.requester.clone())
                .or_default()
                .insert(resource.to_string());
            table
                .last_granted_ms
                .insert(waiter.requester.clone(), applied_at_ms);
            self.shared.metrics().incr("lock_grants");
            debug!(resource, requester = %waiter.requester, mode = %waiter.mode, "waiter promoted");
            if waiter.mode == LockMode::Exclusive {
                break;
            }
        }

        if lock.is_unused() {
            table.locks.remove(resource);
        }
    }

    fn apply_cancel(&self, resource: &str, requester: &str) {
        let mut guard = self.table.write();
        let table = &mut *guard;
        let Some(lock) = table.locks.get_mut(resource) else {
            return;
        };
        let before = lock.waiters.len();
        lock.waiters.retain(|w| w.requester != requester);
        if lock.waiters.len() < before {
            self.shared.metrics().incr("lock_cancels");
            debug!(resource, requester, "pending request cancelled");
        }
        if lock.is_unused() {
            table.locks.remove(resource);
        }
    }

    /// Rebuilds the wait-for graph from waiter state and reports one
    /// cycle, if any. Every node can detect; only the leader resolves.
    pub fn find_deadlock(&self) -> Option<Vec<String>> {
        let table = self.table.read();
        let mut graph = WaitForGraph::new();
        for lock in table.locks.values() {
            for waiter in &lock.waiters {
                for holder in &lock.holders {
                    if holder != &waiter.requester {
                        graph.add_edge(&waiter.requester, holder);
                    }
                }
            }
        }
        graph.find_cycle()
    }

    /// The cycle member granted a lock most recently loses; ties fall
    /// to the lexicographically larger id so replicas agree.
    fn pick_victim(&self, cycle: &[String]) -> Option<String> {
        let table = self.table.read();
        cycle
            .iter()
            .max_by_key(|id| {
                (
                    table.last_granted_ms.get(*id).copied().unwrap_or(0),
                    (*id).clone(),
                )
            })
            .cloned()
    }

    async fn resolve_deadlock(&self, cycle: Vec<String>) {
        self.shared.metrics().incr("lock_deadlocks_detected");
        warn!(?cycle, "deadlock cycle detected");
        if !self.shared.is_leader() {
            return;
        }
        let Some(victim) = self.pick_victim(&cycle) else {
            return;
        };
        let commands = {
            let table = self.table.read();
            let mut commands = Vec::new();
            if let Some(resources) = table.held.get(&victim) {
                for resource in resources {
                    commands.push(Command::ReleaseLock {
                        resource: resource.clone(),
                        holder: victim.clone(),
                    });
                }
            }
            for (resource, lock) in table.locks.iter() {
                if lock.waiters.iter().any(|w| w.requester == victim) {
                    commands.push(Command::CancelLockRequest {
                        resource: resource.clone(),
                        requester: victim.clone(),
                    });
                }
            }
            commands
        };
        warn!(victim = %victim, commands = commands.len(), "breaking deadlock");
        self.shared.metrics().incr("lock_deadlock_victims");
        for command in commands {
            if let Err(err) = self.shared.submit_command(command).await {
                warn!(victim = %victim, error = %err, "victim release not replicated");
            }
        }
    }

    async fn detection_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.shared.config().lock.deadlock_interval;
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(cycle) = self.find_deadlock() {
                        self.resolve_deadlock(cycle).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    #[cfg(test)]
    fn resource_count(&self) -> usize {
        self.table.read().locks.len()
    }
}

#[async_trait]
impl Application for LockManager {
    fn name(&self) -> &'static str {
        "lock_manager"
    }

    async fn apply(&self, entry: &LogEntry) -> VardeResult<()> {
        match &entry.command {
            Command::AcquireLock {
                resource,
                requester,
                mode,
                timeout_ms,
                requested_at_ms,
            } => self.apply_acquire(
                resource,
                requester,
                *mode,
                *timeout_ms,
                *requested_at_ms,
                entry.appended_at_ms,
            ),
            Command::ReleaseLock { resource, holder } => {
                self.apply_release(resource, holder, entry.appended_at_ms);
            }
            Command::CancelLockRequest {
                resource,
                requester,
            } => self.apply_cancel(resource, requester),
            _ => {}
        }
        Ok(())
    }

    fn start_tasks(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![tokio::spawn(self.detection_loop(shutdown))]
    }
}
