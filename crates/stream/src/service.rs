use parking_lot::RwLock;
use snapvault_common::CellCoord;
use snapvault_exec::{Task, TaskScheduler};
use snapvault_live::LiveWorld;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::cache::{CacheError, RegionCache};
use crate::config::ServiceConfig;

/// Owns the shared scheduler and one [`RegionCache`] per attached world.
///
/// Claim and unclaim hooks map onto cache operations: claiming a cell
/// captures its pristine state once, unclaiming restores it and clears the
/// slot.
pub struct SnapshotService {
    config: ServiceConfig,
    scheduler: Arc<TaskScheduler>,
    caches: RwLock<HashMap<String, Arc<RegionCache>>>,
    shut_down: AtomicBool,
}

impl SnapshotService {
    pub fn new(config: ServiceConfig) -> Result<Self, CacheError> {
        let scheduler = Arc::new(TaskScheduler::new(&config.scheduler())?);
        tracing::info!(workers = scheduler.worker_count(), "snapshot service started");
        Ok(Self {
            config,
            scheduler,
            caches: RwLock::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Opens a cache for `name`, backed by `world_dir`. Attaching a name
    /// that is already attached returns the existing cache.
    pub fn attach(
        &self,
        name: &str,
        world_dir: impl AsRef<Path>,
        world: Arc<dyn LiveWorld>,
    ) -> Result<Arc<RegionCache>, CacheError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        let mut caches = self.caches.write();
        if let Some(cache) = caches.get(name) {
            tracing::debug!(world = name, "world already attached");
            return Ok(cache.clone());
        }
        let cache = RegionCache::open(
            name,
            world_dir,
            world,
            self.scheduler.clone(),
            self.config.cache.clone(),
        )?;
        caches.insert(name.to_string(), cache.clone());
        Ok(cache)
    }

    /// Closes and forgets the cache for `name`. Returns whether it was attached.
    pub fn detach(&self, name: &str) -> bool {
        let Some(cache) = self.caches.write().remove(name) else {
            return false;
        };
        cache.close();
        true
    }

    pub fn cache(&self, name: &str) -> Option<Arc<RegionCache>> {
        self.caches.read().get(name).cloned()
    }

    /// Names of attached worlds, sorted.
    pub fn worlds(&self) -> Vec<String> {
        let mut names: Vec<_> = self.caches.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// A cell was claimed: capture its state unless a snapshot already exists.
    pub fn on_claim(&self, world: &str, cell: CellCoord) -> Result<Task<bool>, CacheError> {
        self.require(world)?.capture(cell, false)
    }

    /// A cell was released: put the snapshot back and clear it.
    pub fn on_unclaim(&self, world: &str, cell: CellCoord) -> Result<Task<bool>, CacheError> {
        self.require(world)?.restore(cell, true)
    }

    fn require(&self, world: &str) -> Result<Arc<RegionCache>, CacheError> {
        self.cache(world)
            .ok_or_else(|| CacheError::UnknownWorld(world.to_string()))
    }

    /// Closes every cache, then stops the scheduler, letting queued work
    /// finish within the configured timeout. Returns whether the scheduler
    /// terminated in time. Idempotent.
    pub fn shutdown(&self) -> bool {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return true;
        }
        let _span = tracing::info_span!("service_shutdown").entered();
        let caches: Vec<_> = self.caches.write().drain().map(|(_, c)| c).collect();
        for cache in caches {
            cache.close();
        }
        self.scheduler.shutdown();
        let terminated = self
            .scheduler
            .await_termination(self.config.shutdown_timeout());
        if !terminated {
            tracing::warn!("cancelling work still queued after shutdown timeout");
            self.scheduler.shutdown_now();
        }
        tracing::info!(terminated, "snapshot service stopped");
        terminated
    }
}

impl Drop for SnapshotService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
