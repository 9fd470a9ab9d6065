//! Phi-accrual failure detection.
//!
//! Each peer's heartbeat inter-arrival times feed a sliding window with
//! a running mean and variance. The phi value is the negative log of
//! the probability that a heartbeat this late is still coming, assuming
//! normally distributed arrivals. Health degrades from alive through
//! suspected to failed, driven by phi and by hard elapsed-time bounds,
//! and recovers the moment a heartbeat arrives.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DetectorConfig;
use crate::metrics::Metrics;
use crate::observer::PeerHealthObserver;
use crate::types::{ClusterHealth, NodeId, PeerHealth};

/// Smallest survival probability fed to the log; caps phi at 10.
const MIN_P_LATER: f64 = 1e-10;

/// Sliding window of heartbeat intervals with running statistics.
struct ArrivalWindow {
    intervals: VecDeque<f64>,
    capacity: usize,
    mean: f64,
    m2: f64,
}

impl ArrivalWindow {
    fn new(capacity: usize) -> Self {
        Self {
            intervals: VecDeque::with_capacity(capacity),
            capacity,
            mean: 0.0,
            m2: 0.0,
        }
    }

    fn len(&self) -> usize {
        self.intervals.len()
    }

    fn push(&mut self, interval_ms: f64) {
        self.intervals.push_back(interval_ms);
        if self.intervals.len() > self.capacity {
            self.intervals.pop_front();
            self.recompute();
        } else {
            // Welford update for the growing window.
            let n = self.intervals.len() as f64;
            let delta = interval_ms - self.mean;
            self.mean += delta / n;
            self.m2 += delta * (interval_ms - self.mean);
        }
    }

    /// Full recompute after an eviction; the incremental form cannot
    /// remove a sample.
    fn recompute(&mut self) {
        self.mean = 0.0;
        self.m2 = 0.0;
        for (i, &value) in self.intervals.iter().enumerate() {
            let n = (i + 1) as f64;
            let delta = value - self.mean;
            self.mean += delta / n;
            self.m2 += delta * (value - self.mean);
        }
    }

    fn mean(&self) -> f64 {
        self.mean
    }

    fn std_dev(&self, floor: f64) -> f64 {
        if self.intervals.len() < 2 {
            return floor;
        }
        let variance = self.m2 / (self.intervals.len() as f64 - 1.0);
        variance.sqrt().max(floor)
    }
}

/// Abramowitz and Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = ((((1.061405429 * t - 1.453152027) * t + 1.421413741) * t - 0.284496736) * t
        + 0.254829592)
        * t;
    sign * (1.0 - poly * (-x * x).exp())
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

fn phi_from(elapsed_ms: f64, mean: f64, std_dev: f64) -> f64 {
    let z = (elapsed_ms - mean) / std_dev;
    let p_later = (1.0 - normal_cdf(z)).max(MIN_P_LATER);
    -p_later.log10()
}

struct PeerRecord {
    window: ArrivalWindow,
    last_heartbeat: Instant,
    health: PeerHealth,
}

pub struct FailureDetector {
    config: DetectorConfig,
    metrics: Arc<Metrics>,
    peers: DashMap<NodeId, RwLock<PeerRecord>>,
    observers: RwLock<Vec<Arc<dyn PeerHealthObserver>>>,
}

impl FailureDetector {
    pub fn new(config: DetectorConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            metrics,
            peers: DashMap::new(),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn PeerHealthObserver>) {
        self.observers.write().push(observer);
    }

    /// Starts tracking a peer. Its health is unknown until heartbeats
    /// arrive or the silence bounds trip.
    pub fn register_peer(&self, peer: NodeId) {
        self.peers.entry(peer).or_insert_with(|| {
            RwLock::new(PeerRecord {
                window: ArrivalWindow::new(self.config.window_size),
                last_heartbeat: Instant::now(),
                health: PeerHealth::Unknown,
            })
        });
    }

    /// Stops tracking a peer and drops its arrival history.
    pub fn unregister_peer(&self, peer: NodeId) {
        self.peers.remove(&peer);
    }

    pub fn record_heartbeat(&self, peer: NodeId) {
        let now = Instant::now();
        let Some(entry) = self.peers.get(&peer) else {
            debug!(peer, "heartbeat from unregistered peer");
            return;
        };
        let previous = {
            let mut record = entry.write();
            let interval = now.duration_since(record.last_heartbeat);
            record.window.push(interval.as_secs_f64() * 1000.0);
            record.last_heartbeat = now;
            std::mem::replace(&mut record.health, PeerHealth::Alive)
        };
        drop(entry);

        if matches!(previous, PeerHealth::Suspected | PeerHealth::Failed) {
            info!(peer, "peer recovered");
            self.metrics.incr("detector_recoveries");
            for observer in self.observers.read().iter() {
                observer.peer_recovered(peer);
            }
        }
    }

    /// Current phi for a peer; zero until enough samples accumulated.
    pub fn phi(&self, peer: NodeId) -> f64 {
        self.peers
            .get(&peer)
            .map(|entry| {
                let record = entry.read();
                self.phi_of(&record, Instant::now())
            })
            .unwrap_or(0.0)
    }

    fn phi_of(&self, record: &PeerRecord, now: Instant) -> f64 {
        if record.window.len() < self.config.min_samples {
            return 0.0;
        }
        let elapsed_ms = now.duration_since(record.last_heartbeat).as_secs_f64() * 1000.0;
        phi_from(
            elapsed_ms,
            record.window.mean(),
            record.window.std_dev(self.config.min_std_dev_ms),
        )
    }

    pub fn health(&self, peer: NodeId) -> PeerHealth {
        self.peers
            .get(&peer)
            .map(|entry| entry.read().health)
            .unwrap_or(PeerHealth::Unknown)
    }

    pub fn cluster_health(&self) -> ClusterHealth {
        let mut health = ClusterHealth {
            total_peers: 0,
            alive: 0,
            suspected: 0,
            failed: 0,
        };
        for entry in self.peers.iter() {
            health.total_peers += 1;
            match entry.read().health {
                PeerHealth::Alive => health.alive += 1,
                PeerHealth::Suspected => health.suspected += 1,
                PeerHealth::Failed => health.failed += 1,
                PeerHealth::Unknown => {}
            }
        }
        health
    }

    /// One detection sweep over every tracked peer.
    pub fn evaluate(&self) {
        let now = Instant::now();
        let suspicion_window =
            self.config.heartbeat_interval * self.config.suspicion_threshold;
        let failure_window = self.config.heartbeat_interval * self.config.failure_threshold;

        for entry in self.peers.iter() {
            let peer = *entry.key();
            let transition = {
                let mut record = entry.write();
                let elapsed = now.duration_since(record.last_heartbeat);
                let phi = self.phi_of(&record, now);
                let verdict = if phi > self.config.phi_threshold || elapsed > failure_window {
                    PeerHealth::Failed
                } else if elapsed > suspicion_window {
                    PeerHealth::Suspected
                } else {
                    record.health
                };
                if verdict != record.health
                    && matches!(verdict, PeerHealth::Suspected | PeerHealth::Failed)
                {
                    record.health = verdict;
                    Some((verdict, phi))
                } else {
                    None
                }
            };

            match transition {
                Some((PeerHealth::Suspected, phi)) => {
                    warn!(peer, phi, "peer suspected");
                    self.metrics.incr("detector_suspicions");
                    for observer in self.observers.read().iter() {
                        observer.peer_suspected(peer, phi);
                    }
                }
                Some((PeerHealth::Failed, phi)) => {
                    warn!(peer, phi, "peer failed");
                    self.metrics.incr("detector_failures");
                    for observer in self.observers.read().iter() {
                        observer.peer_failed(peer, phi);
                    }
                }
                _ => {}
            }
        }
    }

    /// Periodic sweep at half the heartbeat interval, so detection lag
    /// stays under one heartbeat.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let detector = self.clone();
        let period = detector.config.heartbeat_interval / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => detector.evaluate(),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("failure detector monitor shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}
