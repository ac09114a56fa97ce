use serde::{Deserialize, Serialize};
use snapvault_exec::{DEFAULT_STRIPES, SchedulerConfig};
use snapvault_persist::{DEFAULT_COMPRESSION_LEVEL, DEFAULT_SNAPSHOT_DIR};
use std::time::Duration;

/// Region cache configuration: eviction timing, locking and storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// A region untouched for this long is marked for eviction.
    pub idle_threshold_ms: u64,
    /// Period of the pass that marks idle regions.
    pub trim_interval_ms: u64,
    /// Period of the pass that flushes and drops marked regions.
    pub unload_interval_ms: u64,
    /// Stripes in each region's slot lock.
    pub lock_stripes: usize,
    /// zstd level for region files.
    pub compression_level: i32,
    /// Directory, relative to the world directory, holding region files.
    pub snapshot_dir: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_threshold_ms: 60_000,
            trim_interval_ms: 1_000,
            unload_interval_ms: 1_000,
            lock_stripes: DEFAULT_STRIPES,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            snapshot_dir: DEFAULT_SNAPSHOT_DIR.to_string(),
        }
    }
}

impl CacheConfig {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    pub fn trim_interval(&self) -> Duration {
        Duration::from_millis(self.trim_interval_ms)
    }

    pub fn unload_interval(&self) -> Duration {
        Duration::from_millis(self.unload_interval_ms)
    }

    /// Stripe count with a floor of one.
    pub fn lock_stripes(&self) -> usize {
        self.lock_stripes.max(1)
    }
}

/// Configuration for a [`crate::SnapshotService`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub cache: CacheConfig,
    /// Worker threads shared by every cache. `None` uses the available parallelism.
    pub workers: Option<usize>,
    /// Upper bound on waiting for running work at shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            workers: None,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl ServiceConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.workers,
            ..SchedulerConfig::default()
        }
    }
}
