use crate::{
    cartesian_tree::UnitIndex,
    gc_phase::GcPhase,
    region_info::{INVALID_UNIT, UnitInfo, UnitTable},
    region_manager::RegionManager,
};

/// Bump allocator over one thread-local region.
///
/// A mutator owns one through its heap proxy; the forwarding code shares
/// one for to-space. The buffer only remembers its region: when the region
/// fills up it is retired to the full list and a fresh one is taken.
#[derive(Debug)]
pub struct AllocBuffer {
    region: UnitIndex,
}

impl Default for AllocBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocBuffer {
    pub const fn new() -> Self {
        Self {
            region: INVALID_UNIT,
        }
    }

    #[inline(always)]
    pub fn region<'a>(&self, units: &'a UnitTable) -> Option<&'a UnitInfo> {
        (self.region != INVALID_UNIT).then(|| units.unit(self.region))
    }

    pub fn set_region(&mut self, region: &UnitInfo) {
        self.region = region.index();
    }

    /// Allocation from the current region only. Returns 0 when it is full
    /// or there is none.
    #[inline(always)]
    pub fn try_alloc(&self, units: &UnitTable, size: usize) -> usize {
        if self.region == INVALID_UNIT {
            return 0;
        }
        units.unit(self.region).alloc(size)
    }

    /// Allocates `size` bytes, refilling the buffer if needed. Returns 0
    /// when no region is left.
    #[inline]
    pub fn alloc(&mut self, regions: &RegionManager, size: usize, phase: GcPhase) -> usize {
        let addr = self.try_alloc(regions.units(), size);
        if addr != 0 {
            return addr;
        }
        self.alloc_slow(regions, size, phase)
    }

    #[cold]
    fn alloc_slow(&mut self, regions: &RegionManager, size: usize, phase: GcPhase) -> usize {
        self.clear(regions);
        let Some(region) = regions.allocate_thread_local_region(phase) else {
            return 0;
        };
        self.region = region.index();
        region.alloc(size)
    }

    /// Hands the current region over to the full list.
    pub fn clear(&mut self, regions: &RegionManager) {
        if self.region == INVALID_UNIT {
            return;
        }
        let region = regions.units().unit(self.region);
        log::trace!(
            "alloc buffer retires region {} [{:#x}, {:#x})",
            region.index(),
            region.start(),
            region.region_end()
        );
        regions.retire_thread_local_region(region);
        self.region = INVALID_UNIT;
    }
}
