//! Node configuration.
//!
//! Loaded from a TOML file or assembled in code, validated once, and
//! passed explicitly into every component constructor. There is no
//! process-global configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{VardeError, VardeResult};
use crate::types::{NodeId, PeerSpec};

/// Complete configuration for one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeSettings,
    /// The rest of the cluster. Empty means a standalone node.
    pub peers: Vec<PeerSpec>,
    pub raft: RaftTuning,
    pub transport: TransportConfig,
    pub detector: DetectorConfig,
    pub lock: LockConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub id: NodeId,
    pub bind_address: String,
    pub data_dir: PathBuf,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            id: 1,
            bind_address: "127.0.0.1:7401".to_string(),
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Consensus timing. The heartbeat interval must stay well under the
/// election timeout floor or followers will keep starting elections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftTuning {
    #[serde(with = "humantime_serde")]
    pub election_timeout_min: Duration,
    #[serde(with = "humantime_serde")]
    pub election_timeout_max: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Granularity of the consensus actor's timer checks.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Cap on entries carried by a single AppendEntries.
    pub max_entries_per_append: usize,
}

impl Default for RaftTuning {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            tick_interval: Duration::from_millis(10),
            max_entries_per_append: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// First reconnect delay; doubles per failure up to the max.
    #[serde(with = "humantime_serde")]
    pub reconnect_base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub reconnect_max_delay: Duration,
    /// Outbound messages buffered per peer while disconnected; the
    /// oldest are dropped beyond this.
    pub max_buffered_messages: usize,
    /// Consecutive connect failures before the circuit opens.
    pub circuit_failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub circuit_cooldown: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(30),
            max_buffered_messages: 100,
            circuit_failure_threshold: 5,
            circuit_cooldown: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Cadence of outgoing detector heartbeats; the monitor loop runs at
    /// half this interval.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Elapsed multiples of the heartbeat interval before SUSPECTED.
    pub suspicion_threshold: u32,
    /// Elapsed multiples of the heartbeat interval before FAILED.
    pub failure_threshold: u32,
    /// Phi score above which a peer is FAILED outright.
    pub phi_threshold: f64,
    /// Bounded inter-arrival sample window per peer.
    pub window_size: usize,
    /// Samples required before phi is trusted; below this it reads 0.
    pub min_samples: usize,
    /// Floor on the standard deviation used in phi, in milliseconds.
    pub min_std_dev_ms: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            suspicion_threshold: 3,
            failure_threshold: 5,
            phi_threshold: 8.0,
            window_size: 100,
            min_samples: 3,
            min_std_dev_ms: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Default acquisition timeout when the caller passes none.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub deadlock_interval: Duration,
    /// Cadence of the acquire API's local-effect poll.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            deadlock_interval: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub partition_count: u32,
    /// Ring positions per physical node.
    pub virtual_nodes: u32,
    #[serde(with = "humantime_serde")]
    pub persist_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            partition_count: 16,
            virtual_nodes: 128,
            persist_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_size_mb: u64,
    /// How long a `get` miss waits for a peer's response before giving up.
    #[serde(with = "humantime_serde")]
    pub fetch_wait: Duration,
}

impl CacheConfig {
    /// Line capacity derived from the configured size.
    pub fn capacity(&self) -> usize {
        (self.cache_size_mb * 1024) as usize
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_size_mb: 256,
            fetch_wait: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Load and validate a configuration from a TOML file.
    pub fn from_file(path: &Path) -> VardeResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| VardeError::Io {
            operation: format!("read config {}", path.display()),
            source: e,
        })?;
        let config: Config = toml::from_str(&raw).map_err(|e| VardeError::Config {
            message: format!("parse {}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VardeResult<()> {
        if self.node.bind_address.is_empty() {
            return Err(VardeError::Config {
                message: "node.bind_address must not be empty".to_string(),
            });
        }
        if self.raft.election_timeout_min > self.raft.election_timeout_max {
            return Err(VardeError::Config {
                message: "raft.election_timeout_min exceeds election_timeout_max".to_string(),
            });
        }
        if self.raft.heartbeat_interval >= self.raft.election_timeout_min {
            return Err(VardeError::Config {
                message: "raft.heartbeat_interval must be below the election timeout floor"
                    .to_string(),
            });
        }
        if self.raft.max_entries_per_append == 0 {
            return Err(VardeError::Config {
                message: "raft.max_entries_per_append must be positive".to_string(),
            });
        }
        if self.queue.partition_count == 0 {
            return Err(VardeError::Config {
                message: "queue.partition_count must be positive".to_string(),
            });
        }
        if self.queue.virtual_nodes == 0 {
            return Err(VardeError::Config {
                message: "queue.virtual_nodes must be positive".to_string(),
            });
        }
        if self.cache.cache_size_mb == 0 {
            return Err(VardeError::Config {
                message: "cache.cache_size_mb must be positive".to_string(),
            });
        }
        if self.detector.min_samples < 2 {
            return Err(VardeError::Config {
                message: "detector.min_samples must be at least 2".to_string(),
            });
        }
        if self.detector.window_size < self.detector.min_samples {
            return Err(VardeError::Config {
                message: "detector.window_size must cover min_samples".to_string(),
            });
        }
        for peer in &self.peers {
            if peer.id == self.node.id {
                return Err(VardeError::Config {
                    message: format!("peer id {} collides with the local node", peer.id),
                });
            }
        }
        let mut ids: Vec<NodeId> = self.peers.iter().map(|p| p.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.peers.len() {
            return Err(VardeError::Config {
                message: "duplicate peer ids".to_string(),
            });
        }
        Ok(())
    }
}
