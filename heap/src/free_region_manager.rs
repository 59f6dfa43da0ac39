//! Free units, kept in two interval trees.
//!
//! The dirty tree holds units whose memory still has old content; the
//! released tree holds units whose pages went back to the OS and read as
//! zero.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    cartesian_tree::{CartesianTree, UnitCount, UnitIndex},
    mem_map::MemMap,
    region_info::{UNIT_SIZE, UnitInfo, UnitRole, UnitTable},
};

pub struct FreeRegionManager {
    units: Arc<UnitTable>,
    heap: Arc<MemMap>,
    dirty: Mutex<CartesianTree>,
    released: Mutex<CartesianTree>,
}

impl FreeRegionManager {
    pub fn new(units: Arc<UnitTable>, heap: Arc<MemMap>) -> Self {
        let count = units.len();
        Self {
            units,
            heap,
            dirty: Mutex::new(CartesianTree::with_capacity(count)),
            released: Mutex::new(CartesianTree::with_capacity(count)),
        }
    }

    /// Takes `count` contiguous free units as a region of `role`.
    ///
    /// Alternates between the trees with `try_lock` so a busy tree does not
    /// stall the caller while the other could serve. Gives up on a tree
    /// once it has no fitting interval.
    pub fn take_region(&self, count: UnitCount, role: UnitRole) -> Option<&UnitInfo> {
        let mut try_dirty = true;
        let mut try_released = true;
        while try_dirty || try_released {
            if try_dirty && let Some(mut dirty) = self.dirty.try_lock() {
                if let Some(idx) = dirty.take_units(count) {
                    log::trace!(
                        "take dirty units [{idx}+{count}), {} dirty left",
                        dirty.total_count()
                    );
                    self.units.clear_units(idx, count);
                    self.units.init_region(idx, count, role);
                    return Some(self.units.unit(idx));
                }
                try_dirty = false;
            }
            if try_released && let Some(mut released) = self.released.try_lock() {
                if let Some(idx) = released.take_units(count) {
                    log::trace!(
                        "take released units [{idx}+{count}), {} released left",
                        released.total_count()
                    );
                    self.units.init_region(idx, count, role);
                    return Some(self.units.unit(idx));
                }
                try_released = false;
            }
            std::thread::yield_now();
        }
        None
    }

    pub fn add_garbage_units(&self, idx: UnitIndex, count: UnitCount) {
        if let Err(err) = self.dirty.lock().merge_insert(idx, count) {
            crate::fatal!("failed to add dirty units [{idx}+{count}): {err}");
        }
    }

    /// Returns the pages of the units to the OS and records them as
    /// released.
    pub fn add_release_units(&self, idx: UnitIndex, count: UnitCount) {
        self.release_pages(idx, count);
        if let Err(err) = self.released.lock().merge_insert(idx, count) {
            crate::fatal!("failed to add released units [{idx}+{count}): {err}");
        }
    }

    fn release_pages(&self, idx: UnitIndex, count: UnitCount) {
        self.heap
            .release(self.units.unit_address(idx), count as usize * UNIT_SIZE);
    }

    pub fn dirty_unit_count(&self) -> usize {
        self.dirty.lock().total_count()
    }

    pub fn released_unit_count(&self) -> usize {
        self.released.lock().total_count()
    }

    /// Moves dirty intervals, largest first, to the released tree until at
    /// most `target` dirty bytes remain. Returns the bytes released.
    pub fn release_garbage_regions(&self, target: usize) -> usize {
        let mut released = 0;
        loop {
            let (idx, count) = {
                let mut dirty = self.dirty.lock();
                if dirty.total_count() * UNIT_SIZE <= target {
                    break;
                }
                match dirty.take_root() {
                    Some(root) => root,
                    None => break,
                }
            };
            self.add_release_units(idx, count);
            released += count as usize * UNIT_SIZE;
        }
        log::debug!(
            "released {released} bytes of garbage, {} dirty bytes cached (target {target})",
            self.dirty_unit_count() * UNIT_SIZE
        );
        released
    }

    pub fn verify(&self) -> Result<(), String> {
        self.dirty.lock().verify()?;
        self.released.lock().verify()
    }

    /// Every free interval of both trees, sorted by index.
    pub fn intervals(&self) -> Vec<(UnitIndex, UnitCount)> {
        let mut all = self.dirty.lock().intervals();
        all.extend(self.released.lock().intervals());
        all.sort_unstable();
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNITS: usize = 64;

    fn create_test_env() -> FreeRegionManager {
        let heap = Arc::new(MemMap::map(UNITS * UNIT_SIZE, "test-free").expect("map"));
        let units = Arc::new(UnitTable::new(heap.start(), UNITS));
        FreeRegionManager::new(units, heap)
    }

    #[test]
    fn test_dirty_units_are_zeroed_on_reuse() {
        let free = create_test_env();
        let addr = free.units.unit_address(4);
        unsafe { (addr as *mut u8).write_bytes(0xAB, 2 * UNIT_SIZE) };
        free.add_garbage_units(4, 2);

        let region = free.take_region(2, UnitRole::Small).expect("region");
        assert_eq!(region.index(), 4);
        assert_eq!(region.unit_count(), 2);
        assert_eq!(unsafe { *(addr as *const u8).add(UNIT_SIZE + 7) }, 0);
        assert_eq!(free.dirty_unit_count(), 0);
    }

    #[test]
    fn test_released_tree_serves_when_dirty_misses() {
        let free = create_test_env();
        free.add_garbage_units(0, 1);
        free.add_release_units(10, 8);
        let region = free.take_region(4, UnitRole::Small).expect("region");
        assert_eq!(region.index(), 10);
        assert_eq!(free.released_unit_count(), 4);
        assert!(free.take_region(16, UnitRole::Large).is_none());
    }

    #[test]
    fn test_release_garbage_down_to_target() {
        let free = create_test_env();
        free.add_garbage_units(0, 8);
        free.add_garbage_units(20, 4);
        free.add_garbage_units(40, 2);

        let released = free.release_garbage_regions(6 * UNIT_SIZE);
        assert_eq!(released, 8 * UNIT_SIZE);
        assert_eq!(free.dirty_unit_count(), 6);
        assert_eq!(free.released_unit_count(), 8);
        assert!(free.verify().is_ok());
        assert_eq!(free.intervals(), vec![(0, 8), (20, 4), (40, 2)]);
    }
}
