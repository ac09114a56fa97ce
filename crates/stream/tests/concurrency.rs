//! Integration test: region cache behavior under concurrent access.
//!
//! Exercises the cache with many threads at once: shared first loads,
//! per-cell serialization, eviction racing with captures, wipes racing with
//! captures, and concurrent close.

use snapvault_common::{CellCoord, RegionCoord};
use snapvault_exec::{Task, TaskScheduler};
use snapvault_live::MemoryWorld;
use snapvault_persist::RegionStore;
use snapvault_stream::{CacheConfig, RegionCache};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const DEADLINE: Duration = Duration::from_secs(10);

fn finish(task: Task<bool>) -> bool {
    task.wait_timeout(DEADLINE)
        .expect("operation did not finish in time")
        .expect("operation failed")
}

fn open(
    dir: &std::path::Path,
    world: &Arc<MemoryWorld>,
    workers: usize,
    config: CacheConfig,
) -> Arc<RegionCache> {
    let scheduler = Arc::new(TaskScheduler::with_workers(workers).unwrap());
    RegionCache::open("concurrency", dir, world.clone(), scheduler, config).unwrap()
}

fn seed(world: &MemoryWorld, cell: CellCoord) {
    let tag = format!("{}:{}", cell.x, cell.z);
    world.set_cell(cell, tag.as_bytes(), tag.as_bytes());
}

#[test]
fn concurrent_first_access_shares_one_load() {
    let dir = tempfile::tempdir().unwrap();
    let world = Arc::new(MemoryWorld::new());
    let cache = open(dir.path(), &world, 4, CacheConfig::default());
    let coord = RegionCoord::new(7, -2);
    let barrier = Arc::new(Barrier::new(16));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                cache.get(coord).unwrap()
            })
        })
        .collect();
    let regions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(regions.iter().all(|r| Arc::ptr_eq(r, &regions[0])));
    assert_eq!(cache.stats().regions_constructed, 1);
    assert_eq!(cache.stats().pending_loads, 0);
}

#[test]
fn operations_on_one_cell_never_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let world = Arc::new(MemoryWorld::new());
    world.set_operation_delay(Duration::from_millis(1));
    let cache = open(dir.path(), &world, 8, CacheConfig::default());
    let cell = CellCoord::new(3, 3);
    seed(&world, cell);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let cache = cache.clone();
            thread::spawn(move || {
                for round in 0..10 {
                    let task = if (i + round) % 2 == 0 {
                        cache.capture(cell, true).unwrap()
                    } else {
                        cache.restore(cell, false).unwrap()
                    };
                    finish(task);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(world.overlapping_tickets(), 0);
    assert!(cache.stored(cell).unwrap().is_full());
}

#[test]
fn cells_sharing_a_region_proceed_independently() {
    let dir = tempfile::tempdir().unwrap();
    let world = Arc::new(MemoryWorld::new());
    let cache = open(dir.path(), &world, 8, CacheConfig::default());
    let cells: Vec<_> = (0..32).map(|i| CellCoord::new(i, 31 - i)).collect();
    for cell in &cells {
        seed(&world, *cell);
    }

    let tasks: Vec<_> = cells
        .iter()
        .map(|cell| cache.capture(*cell, false).unwrap())
        .collect();
    assert!(tasks.into_iter().all(finish));

    assert_eq!(cache.loaded_regions(), vec![RegionCoord::new(0, 0)]);
    for cell in &cells {
        assert!(cache.stored(*cell).unwrap().is_full());
    }
    assert_eq!(world.overlapping_tickets(), 0);
}

#[test]
fn eviction_racing_captures_loses_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let world = Arc::new(MemoryWorld::new());
    let config = CacheConfig {
        idle_threshold_ms: 0,
        trim_interval_ms: 1,
        unload_interval_ms: 1,
        ..CacheConfig::default()
    };
    let cache = open(dir.path(), &world, 4, config);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let cache = cache.clone();
            let world = world.clone();
            thread::spawn(move || {
                let mut cells = Vec::new();
                for i in 0..50 {
                    // Spread across a handful of regions so evictions keep
                    // hitting regions that are in use.
                    let cell = CellCoord::new(t * 50 + i, (i % 3) * 32);
                    seed(&world, cell);
                    assert!(finish(cache.capture(cell, false).unwrap()));
                    cells.push(cell);
                }
                cells
            })
        })
        .collect();
    let cells: Vec<CellCoord> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    cache.close();
    assert!(cache.stats().regions_unloaded > 0);

    let reopened = open(dir.path(), &world, 2, CacheConfig::default());
    for cell in cells {
        assert!(
            reopened.stored(cell).unwrap().is_full(),
            "capture of {cell} was lost"
        );
    }
}

#[test]
fn clear_racing_captures_does_not_deadlock() {
    let dir = tempfile::tempdir().unwrap();
    let world = Arc::new(MemoryWorld::new());
    let cache = open(dir.path(), &world, 2, CacheConfig::default());

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let cache = cache.clone();
            let world = world.clone();
            thread::spawn(move || {
                for i in 0..40 {
                    let cell = CellCoord::new(i * 7, t * 40);
                    seed(&world, cell);
                    finish(cache.capture(cell, true).unwrap());
                }
            })
        })
        .collect();

    let started = Instant::now();
    for _ in 0..10 {
        cache.clear();
        thread::sleep(Duration::from_millis(2));
    }
    for writer in writers {
        writer.join().unwrap();
    }
    assert!(started.elapsed() < DEADLINE);

    assert!(cache.clear());
    assert!(cache.loaded_regions().is_empty());
    assert!(RegionStore::for_world(dir.path()).list().unwrap().is_empty());
}

#[test]
fn concurrent_close_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let world = Arc::new(MemoryWorld::new());
    let cache = open(dir.path(), &world, 2, CacheConfig::default());
    let cell = CellCoord::new(-1, -1);
    seed(&world, cell);
    finish(cache.capture(cell, false).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            thread::spawn(move || cache.close())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(cache.is_closed());
    assert_eq!(cache.stats().regions_unloaded, 1);
    assert_eq!(
        RegionStore::for_world(dir.path()).list().unwrap().len(),
        1
    );
}
