//! In-process metrics registry.
//!
//! Constructed once at node startup and handed to each component; there
//! is no global collector. Counters and gauges only; exporting them is
//! a caller concern.

use std::collections::BTreeMap;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

pub struct Metrics {
    started_at: Instant,
    counters: DashMap<&'static str, u64>,
    gauges: DashMap<&'static str, i64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            counters: DashMap::new(),
            gauges: DashMap::new(),
        }
    }

    pub fn incr(&self, name: &'static str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &'static str, delta: u64) {
        *self.counters.entry(name).or_insert(0) += delta;
    }

    pub fn set_gauge(&self, name: &'static str, value: i64) {
        self.gauges.insert(name, value);
    }

    pub fn counter(&self, name: &'static str) -> u64 {
        self.counters.get(name).map(|v| *v).unwrap_or(0)
    }

    pub fn gauge(&self, name: &'static str) -> Option<i64> {
        self.gauges.get(name).map(|v| *v)
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime().as_secs(),
            counters: self
                .counters
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
            gauges: self
                .gauges
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the registry, sorted for stable output.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.incr("raft.proposals");
        metrics.add("raft.proposals", 4);
        assert_eq!(metrics.counter("raft.proposals"), 5);
        assert_eq!(metrics.counter("never.touched"), 0);
    }

    #[test]
    fn gauges_overwrite() {
        let metrics = Metrics::new();
        metrics.set_gauge("queue.depth", 10);
        metrics.set_gauge("queue.depth", 3);
        assert_eq!(metrics.gauge("queue.depth"), Some(3));
        assert_eq!(metrics.gauge("missing"), None);
    }

    #[test]
    fn snapshot_contains_everything() {
        let metrics = Metrics::new();
        metrics.incr("a");
        metrics.set_gauge("b", -1);
        let snap = metrics.snapshot();
        assert_eq!(snap.counters.get("a"), Some(&1));
        assert_eq!(snap.gauges.get("b"), Some(&-1));
    }
}
