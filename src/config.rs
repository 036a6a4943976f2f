//! Runtime configuration for csd-sim.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Every knob that the on-device caches and the scheduler consult (capacities,
//! eviction policy, timing constants, barrier timeout) lives here.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::cache::evictor::EvictionPolicy;

/// Size of a single vertex value in bytes.
pub const VERTEX_SIZE: u64 = 4;

/// Size of a single edge record (source, destination) in bytes.
pub const EDGE_SIZE: u64 = 8;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "csd-sim", about = "Computational storage cache and scheduler simulator")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address for the control plane (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Control plane settings.
    pub server: ServerConfig,

    /// Graph and device topology.
    pub topology: TopologyConfig,

    /// Edge-block cache settings.
    pub edge_cache: EdgeCacheConfig,

    /// Vertex-partition cache settings.
    pub vertex_cache: VertexCacheConfig,

    /// Simulated latencies and scheduler timing.
    pub timing: TimingConfig,
}

/// HTTP control plane settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:8090").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8090".to_string(),
        }
    }
}

/// Device and graph topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Number of cooperating devices.
    pub num_devices: u32,

    /// Number of vertex partitions (the edge grid is `num_partitions` squared).
    pub num_partitions: u32,

    /// Number of vertices in the graph.
    pub num_vertices: u32,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            num_devices: 4,
            num_partitions: 8,
            num_vertices: 1 << 16,
        }
    }
}

/// Edge-block cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeCacheConfig {
    /// Capacity in bytes.
    pub capacity_bytes: u64,

    /// Victim selection policy.
    pub policy: EvictionPolicy,

    /// Shrink the last victim by the exact shortfall instead of removing it.
    pub partial_eviction: bool,

    /// Drop an edge block from the cache once its future value has been computed.
    pub invalidate_at_future_value: bool,

    /// Upper bound on resident entry records (`None` = unbounded).
    pub max_entries: Option<usize>,
}

impl Default for EdgeCacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 32 * 1024 * 1024,
            policy: EvictionPolicy::Fifo,
            partial_eviction: false,
            invalidate_at_future_value: false,
            max_entries: None,
        }
    }
}

/// Vertex-partition cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VertexCacheConfig {
    /// Capacity in bytes.
    pub capacity_bytes: u64,

    /// Upper bound on resident entry records (`None` = unbounded).
    pub max_entries: Option<usize>,
}

impl Default for VertexCacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 4 * 1024 * 1024,
            max_entries: None,
        }
    }
}

/// Simulated latency constants and scheduler timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Page granularity used for hit/total accounting.
    pub page_size: u64,

    /// How much slower the on-device MCU is than the host CPU.
    pub cpu_mcu_speed_ratio: f64,

    /// Vertex partition DMA read cost per page (ns).
    pub dma_read_latency_ns_per_page: u64,

    /// Flash read cost per page used by the default I/O timing model (ns).
    pub flash_read_latency_ns_per_page: u64,

    /// Flash write-back cost per evicted vertex page (ns).
    pub flash_write_latency_ns_per_page: u64,

    /// Bound on each end-of-iteration barrier wait (ms).
    pub barrier_timeout_ms: u64,

    /// Idle poll interval of a device worker with empty queues (us).
    pub idle_poll_us: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            cpu_mcu_speed_ratio: 1.5,
            dma_read_latency_ns_per_page: 238,
            flash_read_latency_ns_per_page: 10_000,
            flash_write_latency_ns_per_page: 0,
            barrier_timeout_ms: 10_000,
            idle_poll_us: 50,
        }
    }
}

impl TimingConfig {
    /// Barrier wait bound as a `Duration`.
    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Bytes of one vertex partition, or 0 when the partition count is zero.
    pub fn partition_bytes(&self) -> u64 {
        if self.topology.num_partitions == 0 {
            return 0;
        }
        u64::from(self.topology.num_vertices) * VERTEX_SIZE
            / u64::from(self.topology.num_partitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.timing.page_size, 4096);
        assert_eq!(cfg.timing.barrier_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.edge_cache.policy, EvictionPolicy::Fifo);
    }

    #[test]
    fn test_partition_bytes() {
        let mut cfg = Config::default();
        cfg.topology.num_vertices = 1024;
        cfg.topology.num_partitions = 4;
        assert_eq!(cfg.partition_bytes(), 1024);

        cfg.topology.num_partitions = 0;
        assert_eq!(cfg.partition_bytes(), 0);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"edge_cache": {{"capacity_bytes": 100, "policy": "priority", "partial_eviction": true}}}}"#
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.edge_cache.capacity_bytes, 100);
        assert_eq!(cfg.edge_cache.policy, EvictionPolicy::Priority);
        assert!(cfg.edge_cache.partial_eviction);
        assert_eq!(cfg.topology.num_devices, 4);
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"edge_cache": {{"policy": "random"}}}}"#).unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let cfg = Config::load(std::path::Path::new("/nonexistent/csd-sim.json")).unwrap();
        assert_eq!(cfg.topology.num_partitions, 8);
    }
}
