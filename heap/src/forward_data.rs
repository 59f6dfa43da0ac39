//! Scratch memory for live data, double buffered by tag id.
//!
//! Each cycle allocates its [`LiveInfo`]s and bitmaps from the space of its
//! tag id. The space of the previous cycle stays intact until the next one
//! has dispelled its ghosts, since ghost routes are computed from it.

use std::{
    mem,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

use crate::{
    HeapError,
    cartesian_tree::UnitIndex,
    live_info::{LiveInfo, RegionBitmap},
    mem_map::MemMap,
    region_info::{UNIT_SIZE, UnitTable},
    system::{self, OS_PAGE_SIZE},
};

#[derive(Debug)]
struct Zone {
    start: usize,
    end: usize,
    position: AtomicUsize,
}

impl Zone {
    fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            position: AtomicUsize::new(start),
        }
    }

    fn allocate(&self, size: usize) -> usize {
        let addr = self.position.fetch_add(size, Ordering::AcqRel);
        if addr + size > self.end {
            crate::fatal!(
                "forward data zone [{:#x}, {:#x}) exhausted",
                self.start,
                self.end
            );
        }
        addr
    }

    fn reset(&self) {
        self.position.store(self.start, Ordering::Release);
    }
}

#[derive(Debug)]
struct ForwardDataSpace {
    start: usize,
    size: usize,
    live_infos: Zone,
    bitmaps: Zone,
}

impl ForwardDataSpace {
    fn new(start: usize, size: usize, unit_count: usize) -> Self {
        let split = start + unit_count * mem::size_of::<LiveInfo>();
        Self {
            start,
            size,
            live_infos: Zone::new(start, split),
            bitmaps: Zone::new(split, start + size),
        }
    }

    fn release(&self, map: &MemMap) {
        map.release(self.start, self.size);
        self.live_infos.reset();
        self.bitmaps.reset();
    }

    fn live_infos(&self) -> impl Iterator<Item = *mut LiveInfo> + '_ {
        let end = self.live_infos.position.load(Ordering::Acquire);
        (self.live_infos.start..end)
            .step_by(mem::size_of::<LiveInfo>())
            .map(|addr| addr as *mut LiveInfo)
    }
}

pub struct ForwardDataManager {
    map: MemMap,
    spaces: [ForwardDataSpace; 2],
    tag_id: AtomicU8,
}

impl ForwardDataManager {
    /// Bytes one space needs for a heap of `unit_count` units: a live info
    /// per unit plus three bitmaps worth of bits per unit.
    pub fn space_size(unit_count: usize) -> usize {
        let per_unit = mem::size_of::<LiveInfo>()
            + 3 * (mem::size_of::<RegionBitmap>() + UNIT_SIZE / 64);
        system::round_up(unit_count * per_unit, OS_PAGE_SIZE)
    }

    pub fn new(unit_count: usize) -> Result<Self, HeapError> {
        let space = Self::space_size(unit_count);
        let map = MemMap::map(space * 2, "forward-data")?;
        let spaces = [
            ForwardDataSpace::new(map.start(), space, unit_count),
            ForwardDataSpace::new(map.start() + space, space, unit_count),
        ];
        Ok(Self {
            map,
            spaces,
            tag_id: AtomicU8::new(0),
        })
    }

    #[inline]
    pub fn tag_id(&self) -> u8 {
        self.tag_id.load(Ordering::Acquire)
    }

    pub fn set_tag_id(&self, tag: u8) {
        debug_assert!(tag <= 1);
        self.tag_id.store(tag, Ordering::Release);
    }

    #[inline]
    fn current(&self) -> &ForwardDataSpace {
        &self.spaces[self.tag_id() as usize]
    }

    #[inline]
    fn previous(&self) -> &ForwardDataSpace {
        &self.spaces[(self.tag_id() ^ 1) as usize]
    }

    pub fn allocate_live_info(&self, region: UnitIndex) -> *mut LiveInfo {
        let addr = self
            .current()
            .live_infos
            .allocate(mem::size_of::<LiveInfo>());
        // SAFETY: fresh, zeroed and aligned memory of the live info zone
        unsafe { LiveInfo::init_at(addr as *mut u8, region) }
    }

    pub fn allocate_region_bitmap(&self, region_size: usize) -> *mut RegionBitmap {
        let size = system::round_up(RegionBitmap::byte_size(region_size), 8);
        let addr = self.current().bitmaps.allocate(size);
        // SAFETY: fresh and aligned memory of the bitmap zone
        unsafe { RegionBitmap::init_at(addr as *mut u8, region_size) }
    }

    /// Drops the live data of the cycle before the current one.
    pub fn clear_previous_forward_data(&self) {
        self.previous().release(&self.map);
    }

    /// Detaches the live infos of the previous space from the regions still
    /// bound to them.
    pub fn unbind_previous_live_info(&self, units: &UnitTable) {
        for info in self.previous().live_infos() {
            // SAFETY: every slot below the zone position was initialized
            let region = unsafe { (*info).bound_region() };
            crate::heap_check!(
                (region as usize) < units.len(),
                "live info {info:p} bound to unit {region}"
            );
            units.unit(region).check_and_clear_live_info(info);
        }
    }

    pub fn live_info_count(&self) -> usize {
        self.current().live_infos().count()
    }
}
