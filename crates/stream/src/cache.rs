use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use snapvault_common::{CellCoord, RegionCoord, SlotPayloads};
use snapvault_exec::{Periodic, SingleFlight, Task, TaskError, TaskScheduler};
use snapvault_live::LiveWorld;
use snapvault_persist::RegionStore;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::region::{OpGuard, SnapshotRegion};

/// Errors from region cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("region cache is closed")]
    Closed,
    #[error("no region cache attached for world {0:?}")]
    UnknownWorld(String),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("failed to start cache thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Resident regions and the set marked for eviction.
#[derive(Default)]
struct CacheState {
    regions: HashMap<RegionCoord, Arc<SnapshotRegion>>,
    eviction: HashSet<RegionCoord>,
    /// Bumped by every wipe; loads started before a wipe are discarded.
    generation: u64,
}

/// In-flight loads. A load resolves to `None` when the cache closed before
/// it could publish its region.
type PendingLoads = HashMap<RegionCoord, Task<Option<Arc<SnapshotRegion>>>>;

/// Point-in-time cache statistics for instrumentation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub loaded_regions: usize,
    pub eviction_candidates: usize,
    pub pending_loads: usize,
    pub cells_in_flight: usize,
    pub regions_constructed: u64,
    pub regions_unloaded: u64,
    pub flush_failures: u64,
}

/// Snapshot regions of one world, loaded on demand and evicted when idle.
///
/// Every operation resolves its region on the calling thread, then runs on
/// the shared [`TaskScheduler`]. Work for one cell is serialized through a
/// per-cell single-flight; work for different cells only contends on the
/// slot lock stripes of their region.
///
/// Two background loops keep memory bounded: the trim loop marks regions idle
/// for longer than the configured threshold, and the unload loop flushes and
/// drops marked regions.
pub struct RegionCache {
    name: String,
    config: CacheConfig,
    store: RegionStore,
    world: Arc<dyn LiveWorld>,
    scheduler: Arc<TaskScheduler>,
    state: Arc<RwLock<CacheState>>,
    pending: Arc<Mutex<PendingLoads>>,
    /// Serializes trim, unload and clear.
    maintenance: Mutex<()>,
    cells: SingleFlight<CellCoord, bool>,
    /// Set while holding both `pending` and `state`.
    closed: Arc<AtomicBool>,
    loops: Mutex<Vec<Periodic>>,
    constructed: Arc<AtomicU64>,
    unloaded: AtomicU64,
    flush_failures: AtomicU64,
}

impl RegionCache {
    /// Opens the cache for the world at `world_dir` and starts its trim and
    /// unload loops. Region files live in `config.snapshot_dir` under it.
    pub fn open(
        name: &str,
        world_dir: impl AsRef<Path>,
        world: Arc<dyn LiveWorld>,
        scheduler: Arc<TaskScheduler>,
        config: CacheConfig,
    ) -> Result<Arc<Self>, CacheError> {
        let store = RegionStore::new(
            world_dir.as_ref().join(&config.snapshot_dir),
            config.compression_level,
        );
        let cache = Arc::new(Self::new(name, store, world, scheduler, config));
        cache.start_loops()?;
        tracing::info!(
            world = %cache.name,
            root = %cache.store.root().display(),
            "region cache opened"
        );
        Ok(cache)
    }

    /// A cache over `store` with no background loops; trim and unload run
    /// only when called.
    pub fn new(
        name: &str,
        store: RegionStore,
        world: Arc<dyn LiveWorld>,
        scheduler: Arc<TaskScheduler>,
        config: CacheConfig,
    ) -> Self {
        Self {
            name: name.to_string(),
            config,
            store,
            world,
            scheduler,
            state: Arc::new(RwLock::new(CacheState::default())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            maintenance: Mutex::new(()),
            cells: SingleFlight::new(),
            closed: Arc::new(AtomicBool::new(false)),
            loops: Mutex::new(Vec::new()),
            constructed: Arc::new(AtomicU64::new(0)),
            unloaded: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
        }
    }

    fn start_loops(self: &Arc<Self>) -> Result<(), CacheError> {
        let threshold = self.config.idle_threshold();
        let weak = Arc::downgrade(self);
        let trim = Periodic::spawn(
            &format!("{}-trim", self.name),
            self.config.trim_interval(),
            move || with_live(&weak, |cache| {
                cache.trim(threshold);
            }),
        )?;
        let weak = Arc::downgrade(self);
        let unload = Periodic::spawn(
            &format!("{}-unload", self.name),
            self.config.unload_interval(),
            move || with_live(&weak, |cache| {
                cache.unload();
            }),
        )?;
        self.loops.lock().extend([trim, unload]);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &RegionStore {
        &self.store
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The resident region for `coord`, loading it if needed.
    ///
    /// Concurrent first accesses share one load: exactly one region instance
    /// is constructed per coordinate until it is evicted.
    pub fn get(&self, coord: RegionCoord) -> Result<Arc<SnapshotRegion>, CacheError> {
        if self.is_closed() {
            return Err(CacheError::Closed);
        }
        if let Some(region) = self.state.read().regions.get(&coord) {
            return Ok(region.clone());
        }

        let task = {
            let mut pending = self.pending.lock();
            // A load may have finished between the read above and taking the
            // pending lock; loads publish the region before leaving `pending`.
            if let Some(region) = self.state.read().regions.get(&coord) {
                return Ok(region.clone());
            }
            // `close` flips the flag under this lock, so a load registered
            // here is either seen by `close` or never started.
            if self.is_closed() {
                return Err(CacheError::Closed);
            }
            match pending.get(&coord) {
                Some(task) => task.clone(),
                None => {
                    let task = self.spawn_load(coord)?;
                    pending.insert(coord, task.clone());
                    task
                }
            }
        };

        match task.wait() {
            Ok(Some(region)) => Ok(region),
            Ok(None) => Err(CacheError::Closed),
            Err(e) => {
                let mut pending = self.pending.lock();
                if pending.get(&coord).is_some_and(|t| t.same_as(&task)) {
                    pending.remove(&coord);
                }
                tracing::error!(world = %self.name, ?coord, error = %e, "region load failed");
                Err(CacheError::from(e))
            }
        }
    }

    fn spawn_load(
        &self,
        coord: RegionCoord,
    ) -> Result<Task<Option<Arc<SnapshotRegion>>>, CacheError> {
        let store = self.store.clone();
        let state = self.state.clone();
        let pending = self.pending.clone();
        let closed = self.closed.clone();
        let constructed = self.constructed.clone();
        let stripes = self.config.lock_stripes();
        let generation = self.state.read().generation;

        let task = self.scheduler.submit_with(move || {
            let loaded = Arc::new(SnapshotRegion::load(coord, &store, stripes));
            constructed.fetch_add(1, Ordering::Relaxed);
            let region = {
                let mut state = state.write();
                if closed.load(Ordering::Acquire) {
                    tracing::debug!(?coord, "cache closed during load, discarding region");
                    None
                } else {
                    let region = if state.generation == generation {
                        loaded
                    } else {
                        tracing::debug!(?coord, "store wiped during load, starting empty");
                        Arc::new(SnapshotRegion::empty(coord, stripes))
                    };
                    Some(state.regions.entry(coord).or_insert(region).clone())
                }
            };
            pending.lock().remove(&coord);
            region
        })?;
        Ok(task)
    }

    /// Resolves the region for `coord` and registers an operation on it.
    ///
    /// A region sealed for eviction refuses the registration; the caller then
    /// blocks until the eviction either drops the region or abandons it, and
    /// resolves the coordinate again.
    fn begin_op(&self, coord: RegionCoord) -> Result<OpGuard, CacheError> {
        loop {
            let region = self.get(coord)?;
            if let Some(guard) = region.begin_op() {
                return Ok(guard);
            }
            tracing::trace!(world = %self.name, ?coord, "region is being evicted, waiting");
            region.wait_settled();
        }
    }

    /// Schedules a capture of `cell` into its snapshot slot.
    ///
    /// Without `overwrite`, payloads already stored are kept. The task
    /// resolves to whether any payload was stored.
    pub fn capture(&self, cell: CellCoord, overwrite: bool) -> Result<Task<bool>, CacheError> {
        let guard = self.begin_op(cell.region())?;
        let world = self.world.clone();
        let task = self.cells.submit(&self.scheduler, cell, move || {
            guard.region().capture(world.as_ref(), cell, overwrite)
        })?;
        Ok(task)
    }

    /// Schedules a restore of `cell` from its snapshot slot.
    ///
    /// With `clear_after`, applied payloads are removed from the slot. The
    /// task resolves to whether anything was applied.
    pub fn restore(&self, cell: CellCoord, clear_after: bool) -> Result<Task<bool>, CacheError> {
        let guard = self.begin_op(cell.region())?;
        let world = self.world.clone();
        let task = self.cells.submit(&self.scheduler, cell, move || {
            guard.region().restore(world.as_ref(), cell, clear_after)
        })?;
        Ok(task)
    }

    /// Copy of what is stored for `cell`, loading its region if needed.
    pub fn stored(&self, cell: CellCoord) -> Result<SlotPayloads, CacheError> {
        let guard = self.begin_op(cell.region())?;
        Ok(guard.region().slot(cell.slot()))
    }

    /// Marks every resident region idle for at least `threshold` for eviction.
    /// Returns how many regions were newly marked.
    ///
    /// Idle time is compared with `>=`, so a zero threshold marks every
    /// resident region. `close` relies on this.
    pub fn trim(&self, threshold: Duration) -> usize {
        let _maintenance = self.maintenance.lock();
        let mut state = self.state.write();
        let idle: Vec<RegionCoord> = state
            .regions
            .iter()
            .filter(|(coord, region)| {
                !state.eviction.contains(coord) && region.idle_for() >= threshold
            })
            .map(|(coord, _)| *coord)
            .collect();
        if !idle.is_empty() {
            tracing::debug!(world = %self.name, marked = idle.len(), "idle regions marked");
        }
        state.eviction.extend(idle.iter().copied());
        idle.len()
    }

    /// Flushes and drops every region marked for eviction.
    ///
    /// A region is dropped only after a successful flush. One that fails to
    /// flush stays resident and unmarked, so a later trim can retry it.
    /// Returns how many regions were dropped.
    pub fn unload(&self) -> usize {
        let _maintenance = self.maintenance.lock();
        let started = Instant::now();
        let candidates: Vec<(RegionCoord, Option<Arc<SnapshotRegion>>)> = {
            let state = self.state.read();
            state
                .eviction
                .iter()
                .map(|coord| (*coord, state.regions.get(coord).cloned()))
                .collect()
        };
        if candidates.is_empty() {
            return 0;
        }
        let _span = tracing::debug_span!("cache_unload", world = %self.name).entered();

        let mut dropped = 0;
        for (coord, region) in candidates {
            let Some(region) = region else {
                self.state.write().eviction.remove(&coord);
                continue;
            };
            region.seal();
            let flushed = if region.is_dirty() {
                region.flush(&self.store)
            } else {
                Ok(())
            };
            let mut state = self.state.write();
            state.eviction.remove(&coord);
            match flushed {
                Ok(()) => {
                    // A wipe may already have dropped this instance.
                    if state
                        .regions
                        .get(&coord)
                        .is_some_and(|r| Arc::ptr_eq(r, &region))
                    {
                        state.regions.remove(&coord);
                        dropped += 1;
                        tracing::debug!(world = %self.name, ?coord, "region unloaded");
                    }
                    region.retire();
                }
                Err(e) => {
                    region.unseal();
                    self.flush_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        world = %self.name,
                        ?coord,
                        error = %e,
                        "failed to flush region, keeping it loaded"
                    );
                }
            }
        }

        self.unloaded.fetch_add(dropped as u64, Ordering::Relaxed);
        tracing::trace!(
            world = %self.name,
            dropped,
            elapsed = ?started.elapsed(),
            "unload pass complete"
        );
        dropped
    }

    /// Drops every resident region without flushing and deletes all region
    /// files. Loads in progress come back empty. Operations already running
    /// finish against the discarded regions. Returns whether the files were
    /// deleted.
    pub fn clear(&self) -> bool {
        let _maintenance = self.maintenance.lock();
        let mut state = self.state.write();
        for region in state.regions.values() {
            region.retire();
        }
        let wiped = match self.store.wipe() {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(world = %self.name, error = %e, "failed to wipe region files");
                false
            }
        };
        let dropped = state.regions.len();
        state.regions.clear();
        state.eviction.clear();
        state.generation += 1;
        tracing::info!(world = %self.name, dropped, wiped, "region cache cleared");
        wiped
    }

    /// Stops the background loops, waits for scheduled cell operations, then
    /// flushes and drops every resident region. New operations are refused
    /// from the start, and loads that finish after it are discarded.
    /// Idempotent.
    pub fn close(&self) {
        {
            let _pending = self.pending.lock();
            let _state = self.state.write();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        let _span = tracing::info_span!("cache_close", world = %self.name).entered();
        for periodic in self.loops.lock().drain(..) {
            tracing::debug!(world = %self.name, periodic = periodic.name(), "stopping loop");
            periodic.stop();
        }
        self.cells.drain();
        let loads: Vec<_> = self.pending.lock().values().cloned().collect();
        for load in loads {
            let _ = load.wait_finished();
        }

        self.trim(Duration::ZERO);
        let dropped = self.unload();
        let remaining = self.state.read().regions.len();
        if remaining > 0 {
            tracing::error!(
                world = %self.name,
                remaining,
                "regions could not be flushed on close"
            );
        }
        tracing::info!(world = %self.name, dropped, "region cache closed");
    }

    pub fn is_loaded(&self, coord: RegionCoord) -> bool {
        self.state.read().regions.contains_key(&coord)
    }

    /// Coordinates of resident regions, sorted.
    pub fn loaded_regions(&self) -> Vec<RegionCoord> {
        let mut coords: Vec<_> = self.state.read().regions.keys().copied().collect();
        coords.sort();
        coords
    }

    /// Coordinates marked for eviction, sorted.
    pub fn eviction_candidates(&self) -> Vec<RegionCoord> {
        let mut coords: Vec<_> = self.state.read().eviction.iter().copied().collect();
        coords.sort();
        coords
    }

    pub fn stats(&self) -> CacheStats {
        let (loaded_regions, eviction_candidates) = {
            let state = self.state.read();
            (state.regions.len(), state.eviction.len())
        };
        CacheStats {
            loaded_regions,
            eviction_candidates,
            pending_loads: self.pending.lock().len(),
            cells_in_flight: self.cells.in_flight(),
            regions_constructed: self.constructed.load(Ordering::Relaxed),
            regions_unloaded: self.unloaded.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for RegionCache {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RegionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionCache")
            .field("name", &self.name)
            .field("root", &self.store.root())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Runs `pass` if the cache is still alive; `false` ends the loop.
fn with_live(weak: &Weak<RegionCache>, pass: impl FnOnce(&RegionCache)) -> bool {
    match weak.upgrade() {
        Some(cache) if !cache.is_closed() => {
            pass(&cache);
            true
        }
        _ => false,
    }
}
