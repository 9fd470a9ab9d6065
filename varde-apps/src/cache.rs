//! Coherent distributed cache.
//!
//! Lines carry MESI states. Writes broadcast an invalidate before the
//! versioned put goes through consensus, so at most one node holds a
//! MODIFIED copy of a key; reads that miss ask peers and wait briefly
//! for an update to land. The committed log is the durable record, so
//! LRU eviction never needs a write-back.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use varde_core::{
    Application, Command, LogEntry, NodeId, Payload, SharedNodeState, VardeError, VardeResult,
};

/// MESI coherence state of one cache line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MesiState {
    Modified,
    Exclusive,
    Shared,
    Invalid,
}

#[derive(Debug, Clone)]
struct CacheLine {
    value: String,
    state: MesiState,
    version: u64,
    /// Monotonic recency stamp; the line's key in the LRU ordering.
    stamp: u64,
}

/// Fixed-capacity store with least-recently-used eviction. Recency is
/// a monotonic counter mapped back to keys, so eviction is the first
/// entry of the ordering.
struct LruCache {
    capacity: usize,
    lines: HashMap<String, CacheLine>,
    recency: BTreeMap<u64, String>,
    clock: u64,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: HashMap::new(),
            recency: BTreeMap::new(),
            clock: 0,
        }
    }

    fn touch(&mut self, key: &str) {
        let Some(line) = self.lines.get_mut(key) else {
            return;
        };
        self.recency.remove(&line.stamp);
        self.clock += 1;
        line.stamp = self.clock;
        self.recency.insert(self.clock, key.to_string());
    }

    /// Reads a line and marks it most recently used.
    fn get(&mut self, key: &str) -> Option<&CacheLine> {
        if !self.lines.contains_key(key) {
            return None;
        }
        self.touch(key);
        self.lines.get(key)
    }

    /// Reads and touches, allowing state changes in place.
    fn get_mut(&mut self, key: &str) -> Option<&mut CacheLine> {
        if !self.lines.contains_key(key) {
            return None;
        }
        self.touch(key);
        self.lines.get_mut(key)
    }

    /// Reads without disturbing recency.
    fn peek(&self, key: &str) -> Option<&CacheLine> {
        self.lines.get(key)
    }

    fn peek_mut(&mut self, key: &str) -> Option<&mut CacheLine> {
        self.lines.get_mut(key)
    }

    /// Stores a line, evicting the least recently used one when a new
    /// key would exceed capacity. Returns the evicted key.
    fn insert(&mut self, key: &str, mut line: CacheLine) -> Option<String> {
        if let Some(existing) = self.lines.get_mut(key) {
            line.stamp = existing.stamp;
            *existing = line;
            self.touch(key);
            return None;
        }
        let evicted = if self.lines.len() >= self.capacity {
            self.pop_lru()
        } else {
            None
        };
        self.clock += 1;
        line.stamp = self.clock;
        self.recency.insert(self.clock, key.to_string());
        self.lines.insert(key.to_string(), line);
        evicted
    }

    fn pop_lru(&mut self) -> Option<String> {
        let (&stamp, key) = self.recency.iter().next()?;
        let key = key.clone();
        self.recency.remove(&stamp);
        self.lines.remove(&key);
        Some(key)
    }

    fn remove(&mut self, key: &str) {
        if let Some(line) = self.lines.remove(key) {
            self.recency.remove(&line.stamp);
        }
    }

    fn len(&self) -> usize {
        self.lines.len()
    }

    fn iter_lines(&self) -> impl Iterator<Item = &CacheLine> {
        self.lines.values()
    }
}

/// Point-in-time view of the cache, for operators and tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub utilization_percent: f64,
    pub modified: usize,
    pub exclusive: usize,
    pub shared: usize,
    pub invalid: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_percent: f64,
    pub evictions: u64,
    pub invalidations: u64,
}

pub struct CoherentCache {
    shared: Arc<SharedNodeState>,
    lru: Mutex<LruCache>,
    fetch_wait: Duration,
}

impl CoherentCache {
    pub fn new(shared: Arc<SharedNodeState>) -> Arc<Self> {
        let capacity = shared.config().cache.capacity();
        let fetch_wait = shared.config().cache.fetch_wait;
        Arc::new(Self {
            shared,
            lru: Mutex::new(LruCache::new(capacity)),
            fetch_wait,
        })
    }

    /// Reads a key. A local line in any valid state answers directly;
    /// a miss asks every peer and waits briefly for one to reply
    /// before giving up.
    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.read_local(key) {
            self.shared.metrics().incr("cache_hits");
            return Some(value);
        }
        self.shared.metrics().incr("cache_misses");
        self.shared.broadcast(Payload::CacheGet {
            key: key.to_string(),
        });
        tokio::time::sleep(self.fetch_wait).await;
        // a peer's CacheUpdate may have landed while we slept
        self.read_local(key)
    }

    /// Writes a key. Peers drop their copies before the write is even
    /// proposed; the committed entry is the durable record. Returns
    /// `false` from a non-leader node, without touching local state.
    pub async fn put(&self, key: &str, value: &str) -> VardeResult<bool> {
        let version = self.version_of(key) + 1;
        self.shared.broadcast(Payload::CacheInvalidate {
            key: key.to_string(),
            version,
        });
        let command = Command::CachePut {
            key: key.to_string(),
            value: value.to_string(),
            version,
        };
        match self.shared.submit_command(command).await {
            Ok(_) => {
                self.write_line(key, value, MesiState::Modified, version);
                self.shared.metrics().incr("cache_puts");
                debug!(key, version, "line written");
                Ok(true)
            }
            Err(VardeError::NotLeader { leader_hint }) => {
                debug!(key, ?leader_hint, "put refused off-leader");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Drops a key cluster-wide. Returns `false` from a non-leader node.
    pub async fn delete(&self, key: &str) -> VardeResult<bool> {
        let version = self.version_of(key);
        self.shared.broadcast(Payload::CacheInvalidate {
            key: key.to_string(),
            version,
        });
        let command = Command::CacheDelete {
            key: key.to_string(),
        };
        match self.shared.submit_command(command).await {
            Ok(_) => {
                self.lru.lock().remove(key);
                self.shared.metrics().incr("cache_deletes");
                Ok(true)
            }
            Err(VardeError::NotLeader { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let lru = self.lru.lock();
        let (mut modified, mut exclusive, mut shared, mut invalid) = (0, 0, 0, 0);
        for line in lru.iter_lines() {
            match line.state {
                MesiState::Modified => modified += 1,
                MesiState::Exclusive => exclusive += 1,
                MesiState::Shared => shared += 1,
                MesiState::Invalid => invalid += 1,
            }
        }
        let metrics = self.shared.metrics();
        let hits = metrics.counter("cache_hits");
        let misses = metrics.counter("cache_misses");
        let lookups = hits + misses;
        CacheStats {
            entries: lru.len(),
            capacity: lru.capacity,
            utilization_percent: if lru.capacity > 0 {
                lru.len() as f64 * 100.0 / lru.capacity as f64
            } else {
                0.0
            },
            modified,
            exclusive,
            shared,
            invalid,
            hits,
            misses,
            hit_rate_percent: if lookups > 0 {
                hits as f64 * 100.0 / lookups as f64
            } else {
                0.0
            },
            evictions: metrics.counter("cache_evictions"),
            invalidations: metrics.counter("cache_invalidations"),
        }
    }

    fn read_local(&self, key: &str) -> Option<String> {
        let mut lru = self.lru.lock();
        match lru.get(key) {
            Some(line) if line.state != MesiState::Invalid => Some(line.value.clone()),
            _ => None,
        }
    }

    /// Resident version of a key, counting INVALID lines; versions
    /// survive invalidation so the next write still increments past
    /// every version this node has seen.
    fn version_of(&self, key: &str) -> u64 {
        self.lru.lock().peek(key).map_or(0, |line| line.version)
    }

    fn write_line(&self, key: &str, value: &str, state: MesiState, version: u64) {
        let mut lru = self.lru.lock();
        self.insert_into(&mut lru, key, value, state, version);
    }

    /// Applies an update only when it is strictly newer than the
    /// resident line; equal or older versions are duplicates of state
    /// this node already has (including its own MODIFIED write).
    fn store_if_newer(&self, key: &str, value: &str, version: u64) {
        let mut lru = self.lru.lock();
        if lru
            .peek(key)
            .map_or(false, |line| version <= line.version)
        {
            debug!(key, version, "stale version dropped");
            return;
        }
        self.insert_into(&mut lru, key, value, MesiState::Shared, version);
    }

    fn insert_into(
        &self,
        lru: &mut LruCache,
        key: &str,
        value: &str,
        state: MesiState,
        version: u64,
    ) {
        let line = CacheLine {
            value: value.to_string(),
            state,
            version,
            stamp: 0,
        };
        if let Some(evicted) = lru.insert(key, line) {
            self.shared.metrics().incr("cache_evictions");
            debug!(key = %evicted, "line evicted");
        }
    }
}

#[async_trait]
impl Application for CoherentCache {
    fn name(&self) -> &'static str {
        "coherent_cache"
    }

    async fn apply(&self, entry: &LogEntry) -> VardeResult<()> {
        match &entry.command {
            Command::CachePut {
                key,
                value,
                version,
            } => self.store_if_newer(key, value, *version),
            Command::CacheDelete { key } => {
                self.lru.lock().remove(key);
                debug!(key = %key, "line deleted");
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_message(&self, from: NodeId, payload: &Payload) -> VardeResult<()> {
        match payload {
            Payload::CacheGet { key } => {
                let answer = {
                    let mut lru = self.lru.lock();
                    match lru.get_mut(key) {
                        Some(line) if line.state != MesiState::Invalid => {
                            if line.state == MesiState::Exclusive {
                                // a second reader exists now
                                line.state = MesiState::Shared;
                            }
                            Some((line.value.clone(), line.version))
                        }
                        _ => None,
                    }
                };
                if let Some((value, version)) = answer {
                    self.shared.send_to(
                        from,
                        Payload::CacheUpdate {
                            key: key.clone(),
                            value,
                            version,
                        },
                    );
                }
            }
            Payload::CacheUpdate {
                key,
                value,
                version,
            } => self.store_if_newer(key, value, *version),
            Payload::CacheInvalidate { key, version } => {
                let mut lru = self.lru.lock();
                if let Some(line) = lru.peek_mut(key) {
                    if line.state == MesiState::Modified {
                        debug!(key = %key, "invalidating a modified line; the log holds the write-back");
                    }
                    line.state = MesiState::Invalid;
                    self.shared.metrics().incr("cache_invalidations");
                    debug!(key = %key, from, version = *version, "line invalidated");
                }
            }
            _ => {}
        }
        Ok(())
    }
}
