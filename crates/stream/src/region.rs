use parking_lot::{Condvar, Mutex};
use snapvault_common::{CellCoord, RegionCoord, SLOTS_PER_REGION, SlotIndex, SlotPayloads};
use snapvault_exec::KeyedLock;
use snapvault_live::{CellTicket, LiveWorld};
use snapvault_persist::{RegionEncoder, RegionStore, StoreError, decode_region};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Operations in flight against a region, and whether it has been sealed for
/// eviction.
#[derive(Debug, Default)]
struct Activity {
    in_flight: usize,
    sealed: bool,
    /// Sealed for good; the region has left the cache.
    retired: bool,
}

/// 1024 snapshot slots covering a 32x32 block of cells.
///
/// Each slot is only read or written while holding the region's keyed lock
/// for that slot's index.
pub struct SnapshotRegion {
    coord: RegionCoord,
    slots: Box<[Mutex<SlotPayloads>]>,
    lock: KeyedLock,
    last_use: Mutex<Instant>,
    /// Set when slots change after the last successful flush.
    dirty: AtomicBool,
    activity: Mutex<Activity>,
    /// Signalled when the last in-flight operation finishes.
    idle: Condvar,
    /// Signalled when a seal is lifted or made permanent.
    settled: Condvar,
}

/// Registration of one operation against a region; released on drop.
pub(crate) struct OpGuard {
    region: Arc<SnapshotRegion>,
}

impl SnapshotRegion {
    pub fn empty(coord: RegionCoord, lock_stripes: usize) -> Self {
        Self::from_slots(
            coord,
            vec![SlotPayloads::default(); SLOTS_PER_REGION],
            lock_stripes,
        )
    }

    fn from_slots(coord: RegionCoord, slots: Vec<SlotPayloads>, lock_stripes: usize) -> Self {
        debug_assert_eq!(slots.len(), SLOTS_PER_REGION);
        Self {
            coord,
            slots: slots.into_iter().map(Mutex::new).collect(),
            lock: KeyedLock::with_stripes(lock_stripes),
            last_use: Mutex::new(Instant::now()),
            dirty: AtomicBool::new(false),
            activity: Mutex::new(Activity::default()),
            idle: Condvar::new(),
            settled: Condvar::new(),
        }
    }

    /// Loads the persisted image for `coord`, or starts empty.
    ///
    /// A missing file is an empty region. An unreadable one is logged and
    /// also treated as empty.
    pub fn load(coord: RegionCoord, store: &RegionStore, lock_stripes: usize) -> Self {
        let _span = tracing::debug_span!("region_load", ?coord).entered();
        let image = match store.load(coord) {
            Ok(Some(image)) => image,
            Ok(None) => return Self::empty(coord, lock_stripes),
            Err(e) => {
                tracing::error!(?coord, error = %e, "failed to read region file, starting empty");
                return Self::empty(coord, lock_stripes);
            }
        };
        match Self::deserialize(coord, &image, lock_stripes) {
            Ok(region) => {
                tracing::debug!(?coord, occupied = region.occupied_slots(), "region loaded");
                region
            }
            Err(e) => {
                tracing::error!(?coord, error = %e, "failed to decode region file, starting empty");
                Self::empty(coord, lock_stripes)
            }
        }
    }

    /// Rebuilds a region from an image produced by [`SnapshotRegion::serialize`].
    pub fn deserialize(
        coord: RegionCoord,
        image: &[u8],
        lock_stripes: usize,
    ) -> Result<Self, StoreError> {
        let slots = decode_region(image)?;
        Ok(Self::from_slots(coord, slots, lock_stripes))
    }

    /// Encodes every slot, in index order, each read under its slot lock.
    pub fn serialize(&self) -> Result<Vec<u8>, StoreError> {
        let mut encoder = RegionEncoder::new();
        for slot in SlotIndex::all() {
            self.with_slot(slot, |payloads| encoder.push(payloads))?;
        }
        encoder.finish()
    }

    /// Serializes the region and writes it to `store`. A region with no
    /// occupied slot removes its file instead.
    pub fn flush(&self, store: &RegionStore) -> Result<(), StoreError> {
        let was_dirty = self.dirty.swap(false, Ordering::AcqRel);
        let result = if self.occupied_slots() == 0 {
            store.remove(self.coord).map(|existed| {
                if existed {
                    tracing::debug!(coord = ?self.coord, "empty region, file removed");
                }
            })
        } else {
            self.serialize()
                .and_then(|image| store.save(self.coord, &image))
        };
        if result.is_err() && was_dirty {
            self.dirty.store(true, Ordering::Release);
        }
        result
    }

    /// Whether slots changed since the last successful flush.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn coord(&self) -> RegionCoord {
        self.coord
    }

    /// Copies live state for `cell` into its slot.
    ///
    /// Without `overwrite` only missing payloads are read, and a slot that
    /// already holds both payloads is left alone. Each payload is read
    /// independently; a failure is logged and the other payload still
    /// proceeds. Returns whether any payload was stored.
    pub fn capture(&self, world: &dyn LiveWorld, cell: CellCoord, overwrite: bool) -> bool {
        debug_assert_eq!(cell.region(), self.coord);
        self.touch();
        let slot = cell.slot();
        self.lock.with_lock(slot.get() as i64, || {
            let (want_generator, want_environment) = {
                let current = self.slots[slot.get()].lock();
                if !overwrite && current.is_full() {
                    tracing::trace!(?cell, "cell already captured");
                    return false;
                }
                (
                    overwrite || current.generator.is_none(),
                    overwrite || current.environment.is_none(),
                )
            };

            let _ticket = match CellTicket::acquire(world, cell) {
                Ok(ticket) => ticket,
                Err(e) => {
                    tracing::warn!(?cell, error = %e, "could not hold cell for capture");
                    return false;
                }
            };

            let generator = want_generator
                .then(|| world.read_generator_state(cell))
                .and_then(|result| {
                    result
                        .inspect_err(|e| {
                            tracing::warn!(?cell, error = %e, "failed to capture generator state")
                        })
                        .ok()
                });
            let environment = want_environment
                .then(|| world.read_built_environment(cell))
                .and_then(|result| {
                    result
                        .inspect_err(|e| {
                            tracing::warn!(?cell, error = %e, "failed to capture built environment")
                        })
                        .ok()
                });

            let changed = generator.is_some() || environment.is_some();
            let mut current = self.slots[slot.get()].lock();
            if let Some(bytes) = generator {
                current.generator = Some(bytes);
            }
            if let Some(bytes) = environment {
                current.environment = Some(bytes);
            }
            if changed {
                self.dirty.store(true, Ordering::Release);
            }
            tracing::debug!(?cell, changed, overwrite, "cell captured");
            changed
        })
    }

    /// Applies the stored payloads for `cell` back to the live world.
    ///
    /// Each payload is applied independently; a failure is logged and the
    /// other payload still proceeds. With `clear_after`, payloads that were
    /// applied are removed from the slot; a payload that failed to apply is
    /// kept. Returns whether anything was applied.
    pub fn restore(&self, world: &dyn LiveWorld, cell: CellCoord, clear_after: bool) -> bool {
        debug_assert_eq!(cell.region(), self.coord);
        self.touch();
        let slot = cell.slot();
        self.lock.with_lock(slot.get() as i64, || {
            let stored = self.slots[slot.get()].lock().clone();
            if stored.is_empty() {
                tracing::trace!(?cell, "nothing stored for cell");
                return false;
            }

            let _ticket = match CellTicket::acquire(world, cell) {
                Ok(ticket) => ticket,
                Err(e) => {
                    tracing::warn!(?cell, error = %e, "could not hold cell for restore");
                    return false;
                }
            };

            let generator_applied = stored.generator.as_deref().is_some_and(|bytes| {
                world
                    .install_generator_state(cell, bytes)
                    .inspect_err(|e| {
                        tracing::warn!(?cell, error = %e, "failed to restore generator state")
                    })
                    .is_ok()
            });
            let environment_applied = stored.environment.as_deref().is_some_and(|bytes| {
                world
                    .paste_built_environment(cell, bytes)
                    .inspect_err(|e| {
                        tracing::warn!(?cell, error = %e, "failed to restore built environment")
                    })
                    .is_ok()
            });

            if clear_after {
                let mut current = self.slots[slot.get()].lock();
                if generator_applied {
                    current.generator = None;
                }
                if environment_applied {
                    current.environment = None;
                }
                if generator_applied || environment_applied {
                    self.dirty.store(true, Ordering::Release);
                }
            }
            let changed = generator_applied || environment_applied;
            tracing::debug!(?cell, changed, clear_after, "cell restored");
            changed
        })
    }

    /// Copy of the payloads stored in `slot`.
    pub fn slot(&self, slot: SlotIndex) -> SlotPayloads {
        self.with_slot(slot, SlotPayloads::clone)
    }

    /// Number of slots holding at least one payload.
    pub fn occupied_slots(&self) -> usize {
        SlotIndex::all()
            .filter(|slot| self.with_slot(*slot, |p| !p.is_empty()))
            .count()
    }

    pub fn touch(&self) {
        *self.last_use.lock() = Instant::now();
    }

    /// Time since the last capture or restore.
    pub fn idle_for(&self) -> Duration {
        self.last_use.lock().elapsed()
    }

    fn with_slot<T>(&self, slot: SlotIndex, f: impl FnOnce(&SlotPayloads) -> T) -> T {
        self.lock
            .with_lock(slot.get() as i64, || f(&self.slots[slot.get()].lock()))
    }

    /// Registers an operation. Fails once the region is sealed.
    pub(crate) fn begin_op(self: &Arc<Self>) -> Option<OpGuard> {
        let mut activity = self.activity.lock();
        if activity.sealed {
            return None;
        }
        activity.in_flight += 1;
        Some(OpGuard {
            region: self.clone(),
        })
    }

    /// Refuses new operations and waits for in-flight ones to finish.
    pub(crate) fn seal(&self) {
        let mut activity = self.activity.lock();
        activity.sealed = true;
        while activity.in_flight > 0 {
            self.idle.wait(&mut activity);
        }
    }

    /// Refuses new operations without waiting for in-flight ones. Used when
    /// the region is discarded rather than flushed.
    pub(crate) fn retire(&self) {
        let mut activity = self.activity.lock();
        activity.sealed = true;
        activity.retired = true;
        self.settled.notify_all();
    }

    /// Re-admits operations after a seal whose eviction was abandoned.
    pub(crate) fn unseal(&self) {
        let mut activity = self.activity.lock();
        if !activity.retired {
            activity.sealed = false;
            self.settled.notify_all();
        }
    }

    /// Blocks while the region is sealed but neither retired nor unsealed,
    /// i.e. while an eviction of it is still deciding.
    pub(crate) fn wait_settled(&self) {
        let mut activity = self.activity.lock();
        while activity.sealed && !activity.retired {
            self.settled.wait(&mut activity);
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.activity.lock().in_flight
    }
}

impl std::fmt::Debug for SnapshotRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotRegion")
            .field("coord", &self.coord)
            .field("idle_for", &self.idle_for())
            .field("dirty", &self.is_dirty())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl OpGuard {
    pub(crate) fn region(&self) -> &SnapshotRegion {
        &self.region
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        let mut activity = self.region.activity.lock();
        activity.in_flight -= 1;
        if activity.in_flight == 0 {
            self.region.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapvault_exec::DEFAULT_STRIPES;
    use snapvault_live::MemoryWorld;
    use std::thread;

    fn region() -> SnapshotRegion {
        SnapshotRegion::empty(RegionCoord::new(0, 0), DEFAULT_STRIPES)
    }

    #[test]
    fn capture_restore_walkthrough() {
        let world = MemoryWorld::new();
        let region = region();
        let cell = CellCoord::new(3, 5);
        world.set_cell(cell, b"gen", b"env");

        assert!(region.capture(&world, cell, false));
        assert!(!region.capture(&world, cell, false));
        world.clear_cell(cell);
        assert!(region.restore(&world, cell, true));
        assert!(!region.restore(&world, cell, false));
        assert!(region.slot(cell.slot()).is_empty());

        let live = world.cell(cell).unwrap();
        assert_eq!(live.generator, b"gen");
        assert_eq!(live.environment, b"env");
    }

    #[test]
    fn capture_without_overwrite_keeps_stored_bytes() {
        let world = MemoryWorld::new();
        let region = region();
        let cell = CellCoord::new(1, 1);
        world.set_cell(cell, b"g1", b"e1");
        assert!(region.capture(&world, cell, false));

        world.set_cell(cell, b"g2", b"e2");
        assert!(!region.capture(&world, cell, false));
        assert_eq!(region.slot(cell.slot()).generator.as_deref(), Some(&b"g1"[..]));

        assert!(region.capture(&world, cell, true));
        let stored = region.slot(cell.slot());
        assert_eq!(stored.generator.as_deref(), Some(&b"g2"[..]));
        assert_eq!(stored.environment.as_deref(), Some(&b"e2"[..]));
    }

    #[test]
    fn capture_keeps_going_when_one_payload_fails() {
        let world = MemoryWorld::new();
        let region = region();
        let cell = CellCoord::new(0, 2);
        world.set_cell(cell, b"g", b"e");
        world.fail_generator(true);

        assert!(region.capture(&world, cell, false));
        let stored = region.slot(cell.slot());
        assert!(stored.generator.is_none());
        assert_eq!(stored.environment.as_deref(), Some(&b"e"[..]));

        // Only the missing payload is read on the next capture.
        world.fail_generator(false);
        world.drain_events();
        assert!(region.capture(&world, cell, false));
        assert!(region.slot(cell.slot()).is_full());
        assert!(
            !world
                .events()
                .iter()
                .any(|e| matches!(e, snapvault_live::LiveEvent::EnvironmentRead { .. }))
        );
    }

    #[test]
    fn capture_fails_cleanly_when_everything_fails() {
        let world = MemoryWorld::new();
        let region = region();
        let cell = CellCoord::new(4, 4);
        world.set_cell(cell, b"g", b"e");
        world.fail_generator(true);
        world.fail_environment(true);
        assert!(!region.capture(&world, cell, true));
        assert!(region.slot(cell.slot()).is_empty());
    }

    #[test]
    fn ticket_failure_aborts_capture() {
        let world = MemoryWorld::new();
        let region = region();
        let cell = CellCoord::new(4, 5);
        world.set_cell(cell, b"g", b"e");
        world.fail_tickets(true);
        assert!(!region.capture(&world, cell, false));
        assert!(region.slot(cell.slot()).is_empty());
    }

    #[test]
    fn restore_failure_keeps_unapplied_payload() {
        let world = MemoryWorld::new();
        let region = region();
        let cell = CellCoord::new(7, 7);
        world.set_cell(cell, b"g", b"e");
        assert!(region.capture(&world, cell, false));

        world.fail_environment(true);
        assert!(region.restore(&world, cell, true));
        let stored = region.slot(cell.slot());
        assert!(stored.generator.is_none());
        assert_eq!(stored.environment.as_deref(), Some(&b"e"[..]));
    }

    #[test]
    fn restore_without_clear_keeps_slot() {
        let world = MemoryWorld::new();
        let region = region();
        let cell = CellCoord::new(9, 0);
        world.set_cell(cell, b"g", b"e");
        region.capture(&world, cell, false);
        assert!(region.restore(&world, cell, false));
        assert!(region.restore(&world, cell, false));
        assert!(region.slot(cell.slot()).is_full());
    }

    #[test]
    fn serialize_roundtrip_at_various_fill_levels() {
        let world = MemoryWorld::new();
        let coord = RegionCoord::new(-1, 2);
        for fill in [0usize, 37, SLOTS_PER_REGION] {
            let region = SnapshotRegion::empty(coord, DEFAULT_STRIPES);
            for slot in SlotIndex::all().take(fill) {
                let cell = coord.cell(slot);
                let tag = slot.get().to_be_bytes();
                world.set_cell(cell, &tag, &[&tag[..], &b"env"[..]].concat());
                assert!(region.capture(&world, cell, false));
            }

            let image = region.serialize().unwrap();
            let copy = SnapshotRegion::deserialize(coord, &image, DEFAULT_STRIPES).unwrap();
            assert_eq!(copy.occupied_slots(), fill);
            for slot in SlotIndex::all() {
                assert_eq!(copy.slot(slot), region.slot(slot));
            }
        }
    }

    #[test]
    fn load_tolerates_missing_and_corrupt_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RegionStore::for_world(tmp.path());
        let coord = RegionCoord::new(0, 0);

        let region = SnapshotRegion::load(coord, &store, DEFAULT_STRIPES);
        assert_eq!(region.occupied_slots(), 0);

        store.save(coord, b"not a region image").unwrap();
        let region = SnapshotRegion::load(coord, &store, DEFAULT_STRIPES);
        assert_eq!(region.occupied_slots(), 0);
    }

    #[test]
    fn dirty_tracks_changes_since_flush() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RegionStore::for_world(tmp.path());
        let world = MemoryWorld::new();
        let region = region();
        let cell = CellCoord::new(2, 3);
        assert!(!region.is_dirty());

        world.set_cell(cell, b"g", b"e");
        region.capture(&world, cell, false);
        assert!(region.is_dirty());
        region.flush(&store).unwrap();
        assert!(!region.is_dirty());

        region.restore(&world, cell, false);
        assert!(!region.is_dirty());
        region.restore(&world, cell, true);
        assert!(region.is_dirty());
    }

    #[test]
    fn failed_flush_stays_dirty() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("snapshots"), b"blocker").unwrap();
        let store = RegionStore::for_world(tmp.path());
        let world = MemoryWorld::new();
        let region = region();
        let cell = CellCoord::new(0, 0);
        world.set_cell(cell, b"g", b"e");
        region.capture(&world, cell, false);

        assert!(region.flush(&store).is_err());
        assert!(region.is_dirty());
    }

    #[test]
    fn flush_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RegionStore::for_world(tmp.path());
        let world = MemoryWorld::new();
        let cell = CellCoord::new(40, -3);
        world.set_cell(cell, b"g", b"e");

        let region = SnapshotRegion::empty(cell.region(), DEFAULT_STRIPES);
        region.capture(&world, cell, false);
        region.flush(&store).unwrap();

        let loaded = SnapshotRegion::load(cell.region(), &store, DEFAULT_STRIPES);
        assert_eq!(loaded.slot(cell.slot()), region.slot(cell.slot()));
    }

    #[test]
    fn seal_waits_for_in_flight_operations() {
        let region = Arc::new(region());
        let guard = region.begin_op().unwrap();
        assert_eq!(region.in_flight(), 1);

        let sealer = {
            let region = region.clone();
            thread::spawn(move || region.seal())
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!sealer.is_finished());
        assert!(region.begin_op().is_none());

        drop(guard);
        sealer.join().unwrap();
        assert_eq!(region.in_flight(), 0);

        region.unseal();
        assert!(region.begin_op().is_some());
    }

    #[test]
    fn sealed_region_settles_on_unseal() {
        let region = Arc::new(region());
        region.seal();

        let waiter = {
            let region = region.clone();
            thread::spawn(move || {
                region.wait_settled();
                region.begin_op().is_some()
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());

        region.unseal();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn retired_region_settles_and_stays_sealed() {
        let region = Arc::new(region());
        region.seal();

        let waiter = {
            let region = region.clone();
            thread::spawn(move || region.wait_settled())
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());

        region.retire();
        waiter.join().unwrap();
        region.unseal();
        assert!(region.begin_op().is_none());
        // No wait once retired.
        region.wait_settled();
    }

    #[test]
    fn flushing_an_emptied_region_removes_its_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RegionStore::for_world(tmp.path());
        let world = MemoryWorld::new();
        let region = region();
        let cell = CellCoord::new(5, 6);
        world.set_cell(cell, b"g", b"e");
        region.capture(&world, cell, false);
        region.flush(&store).unwrap();
        assert!(store.exists(region.coord()));

        assert!(region.restore(&world, cell, true));
        region.flush(&store).unwrap();
        assert!(!store.exists(region.coord()));
        assert!(!region.is_dirty());
        // Nothing stored is not an error.
        region.flush(&store).unwrap();
    }

    #[test]
    fn idle_time_resets_on_use() {
        let world = MemoryWorld::new();
        let region = region();
        thread::sleep(Duration::from_millis(20));
        assert!(region.idle_for() >= Duration::from_millis(20));
        region.capture(&world, CellCoord::new(0, 0), false);
        assert!(region.idle_for() < Duration::from_millis(20));
    }
}
