//! Region lifecycle on top of the unit table.
//!
//! Regions are taken from the garbage list, the free trees or the untouched
//! tail of the heap, live on exactly one list while in use, and flow back
//! through the garbage list into the free trees. During forwarding the
//! manager also routes from-regions to to-space and copies their objects.

use std::{
    collections::BTreeMap,
    ptr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering, fence},
    },
    thread,
};

use parking_lot::Mutex;

use crate::{
    HeapError,
    alloc_buffer::AllocBuffer,
    cartesian_tree::UnitCount,
    forward_data::ForwardDataManager,
    free_region_manager::FreeRegionManager,
    gc_phase::GcPhase,
    mem_map::MemMap,
    object::{HEADER_SIZE, ObjectRef, ObjectState},
    region_info::{
        INVALID_UNIT, RegionType, RouteState, UNIT_SIZE, UnitInfo, UnitRole,
        UnitTable,
    },
    region_list::RegionList,
    settings::HeapSettings,
};

/// Collected large regions above this size go straight back to the OS.
pub const LARGE_OBJECT_RELEASE_THRESHOLD: usize = 4 * 1024 * 1024;

/// How a from-region's live objects reach to-space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Objects are copied to their route by whoever forwards them first.
    Routed,
    /// Objects were moved when the route was set up; nothing left to copy.
    Compacted,
}

/// Sizes reported by the garbage collection steps of a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExemptStats {
    pub forward_bytes: usize,
    pub floating_garbage: usize,
    pub garbage_bytes: usize,
}

pub struct RegionManager {
    units: Arc<UnitTable>,
    forward: ForwardDataManager,
    free: FreeRegionManager,

    /// Units below the cursor have been handed out at least once.
    inactive_cursor: AtomicU32,
    region_units: UnitCount,
    large_object_threshold: usize,
    exemption_threshold: f64,
    heu_threshold: AtomicUsize,
    heu_pending: AtomicBool,

    tl_regions: RegionList,
    recent_full: RegionList,
    full_trace: RegionList,
    from: RegionList,
    ghost_from: RegionList,
    unmovable_from: RegionList,
    garbage: RegionList,
    recent_pinned: RegionList,
    old_pinned: RegionList,
    raw_pointer_pinned: RegionList,
    recent_large: RegionList,
    old_large: RegionList,
    large_trace: RegionList,

    /// Dead pinned objects by exact size, reusable as slots.
    pinned_slots: Mutex<BTreeMap<usize, Vec<usize>>>,
    /// To-space cursor shared by everyone who routes a from-region.
    route_buffer: Mutex<AllocBuffer>,
}

impl RegionManager {
    pub fn new(heap: Arc<MemMap>, settings: &HeapSettings) -> Result<Self, HeapError> {
        let unit_count = heap.size() / UNIT_SIZE;
        let units = Arc::new(UnitTable::new(heap.start(), unit_count));
        let forward = ForwardDataManager::new(unit_count)?;
        let list = |name| RegionList::new(name, units.clone());
        Ok(Self {
            forward,
            free: FreeRegionManager::new(units.clone(), heap),
            inactive_cursor: AtomicU32::new(0),
            region_units: settings.units_per_region() as UnitCount,
            large_object_threshold: settings.large_object_threshold,
            exemption_threshold: settings.exemption_threshold,
            heu_threshold: AtomicUsize::new(settings.gc_threshold),
            heu_pending: AtomicBool::new(false),
            tl_regions: list("thread-local regions"),
            recent_full: list("recent full regions"),
            full_trace: list("full trace regions"),
            from: list("from regions"),
            ghost_from: list("ghost from regions"),
            unmovable_from: list("unmovable from regions"),
            garbage: list("garbage regions"),
            recent_pinned: list("recent pinned regions"),
            old_pinned: list("old pinned regions"),
            raw_pointer_pinned: list("raw pointer pinned regions"),
            recent_large: list("recent large regions"),
            old_large: list("old large regions"),
            large_trace: list("large trace regions"),
            pinned_slots: Mutex::new(BTreeMap::new()),
            route_buffer: Mutex::new(AllocBuffer::new()),
            units,
        })
    }

    #[inline(always)]
    pub fn units(&self) -> &UnitTable {
        &self.units
    }

    #[inline(always)]
    pub fn forward_data(&self) -> &ForwardDataManager {
        &self.forward
    }

    #[inline(always)]
    pub fn region_size(&self) -> usize {
        self.region_units as usize * UNIT_SIZE
    }

    #[inline(always)]
    pub fn large_object_threshold(&self) -> usize {
        self.large_object_threshold
    }

    #[inline(always)]
    pub fn is_heap_address(&self, addr: usize) -> bool {
        self.units.is_heap_address(addr)
    }

    // ── Taking and returning units ────────────────────────────────────

    /// Takes `count` units as a region: a garbage region of the same size
    /// first, then the free trees, then never used units.
    pub fn take_region(&self, count: UnitCount, role: UnitRole) -> Option<&UnitInfo> {
        if let Some(garbage) = self.garbage.take_head() {
            if garbage.unit_count() == count {
                let idx = garbage.index();
                self.units.clear_units(idx, count);
                self.units.init_region(idx, count, role);
                log::trace!("reuse garbage region {idx} ({count} units)");
                return Some(self.units.unit(idx));
            }
            self.reclaim_region(garbage);
        }

        if let Some(region) = self.free.take_region(count, role) {
            return Some(region);
        }

        let len = self.units.len();
        let idx = self
            .inactive_cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur as usize + count as usize <= len).then_some(cur + count)
            })
            .ok()?;
        self.units.init_region(idx, count, role);
        Some(self.units.unit(idx))
    }

    pub fn set_heu_threshold(&self, bytes: usize) {
        self.heu_threshold.store(bytes, Ordering::Release);
    }

    pub fn heu_threshold(&self) -> usize {
        self.heu_threshold.load(Ordering::Acquire)
    }

    /// Consumes the pending heuristic GC request raised by allocation.
    pub fn take_heu_request(&self) -> bool {
        self.heu_pending.swap(false, Ordering::AcqRel)
    }

    fn check_heu_threshold(&self) {
        if self.allocated_size() >= self.heu_threshold() {
            self.heu_pending.store(true, Ordering::Release);
        }
    }

    /// Returns the units of `region` to the dirty tree.
    pub fn reclaim_region(&self, region: &UnitInfo) {
        let (idx, count) = (region.index(), region.unit_count());
        self.units.init_free_units(idx, count);
        self.free.add_garbage_units(idx, count);
    }

    /// Returns the units of `region` to the released tree.
    pub fn release_region(&self, region: &UnitInfo) -> usize {
        let (idx, count) = (region.index(), region.unit_count());
        let size = region.region_size();
        self.units.init_free_units(idx, count);
        self.free.add_release_units(idx, count);
        size
    }

    /// Moves a region out of service into the garbage list. Returns the
    /// bytes it frees.
    pub fn collect_region(&self, region: &UnitInfo) -> usize {
        log::debug!(
            "collect region {} [{:#x}+{}, {:#x}) type {}",
            region.index(),
            region.start(),
            region.live_bytes(),
            region.region_end(),
            region.region_type().name()
        );
        region.lock_write();
        self.garbage.prepend(region, RegionType::Garbage);
        // SAFETY: locked just above
        unsafe { region.unlock_write() };

        if region.is_large_region() {
            region.region_size()
        } else {
            region.region_size() - region.live_bytes()
        }
    }

    /// Empties the garbage list into the dirty tree. Returns the bytes
    /// reclaimed.
    pub fn reclaim_garbage_regions(&self) -> usize {
        let mut bytes = 0;
        while let Some(region) = self.garbage.take_head() {
            bytes += region.region_size();
            self.reclaim_region(region);
        }
        bytes
    }

    /// Reclaims the garbage list, then trims the dirty cache. Everything
    /// goes back to the OS with `release_all`, otherwise the cache keeps
    /// `(1 - utilization)` of the allocated bytes.
    pub fn reclaim_garbage_memory(&self, release_all: bool, heap_utilization: f64) -> usize {
        let reclaimed = self.reclaim_garbage_regions();
        let target = if release_all {
            0
        } else {
            (self.allocated_size() as f64 * (1.0 - heap_utilization)) as usize
        };
        let released = self.free.release_garbage_regions(target);
        log::debug!("reclaimed {reclaimed} bytes of garbage, released {released} bytes");
        released
    }

    // ── Thread-local regions ──────────────────────────────────────────

    pub fn allocate_thread_local_region(&self, phase: GcPhase) -> Option<&UnitInfo> {
        let region = self.take_region(self.region_units, UnitRole::Small)?;
        if phase.is_tracing() {
            region.set_trace_region(true);
        }
        self.tl_regions.prepend(region, RegionType::ThreadLocal);
        self.check_heu_threshold();
        Some(region)
    }

    pub fn remove_thread_local_region(&self, region: &UnitInfo) {
        self.tl_regions.delete(region);
    }

    pub fn enlist_full_thread_local_region(&self, region: &UnitInfo) {
        if region.is_trace_region() {
            if self.full_trace.try_prepend(region, RegionType::RecentFull) {
                return;
            }
            region.set_trace_region(false);
        }
        self.recent_full.prepend(region, RegionType::RecentFull);
    }

    pub fn retire_thread_local_region(&self, region: &UnitInfo) {
        self.remove_thread_local_region(region);
        self.enlist_full_thread_local_region(region);
    }

    // ── Large and pinned objects ──────────────────────────────────────

    /// Allocates a region of its own for an object of `size` bytes.
    pub fn alloc_large(&self, size: usize, phase: GcPhase) -> usize {
        let count = size.div_ceil(UNIT_SIZE) as UnitCount;
        let Some(region) = self.take_region(count, UnitRole::Large) else {
            return 0;
        };
        let addr = region.alloc(size);
        crate::heap_check!(addr != 0, "large region {} too small for {size}", region.index());

        if phase.is_tracing() {
            region.set_trace_region(true);
            if !self.large_trace.try_prepend(region, RegionType::RecentLarge) {
                region.set_trace_region(false);
                self.recent_large.prepend(region, RegionType::RecentLarge);
            }
        } else {
            self.recent_large.prepend(region, RegionType::RecentLarge);
        }
        self.check_heu_threshold();
        addr
    }

    /// Allocates an object that is never moved.
    pub fn alloc_pinned(&self, size: usize, phase: GcPhase) -> usize {
        let addr = {
            let mut pinned = self.recent_pinned.lock();
            if let Some(head) = pinned.head() {
                let addr = head.alloc(size);
                if addr != 0 {
                    return addr;
                }
            }
            let addr = self.alloc_pinned_from_free_list(size, phase);
            if addr != 0 {
                return addr;
            }
            let Some(region) = self.take_region(self.region_units, UnitRole::Small) else {
                return 0;
            };
            region.set_trace_region(phase.is_tracing());
            pinned.prepend(region, RegionType::RecentPinned);
            region.alloc(size)
        };
        self.check_heu_threshold();
        addr
    }

    fn alloc_pinned_from_free_list(&self, size: usize, phase: GcPhase) -> usize {
        // the slot lists are being rebuilt
        if phase == GcPhase::PostTrace {
            return 0;
        }
        let Some(addr) = self
            .pinned_slots
            .lock()
            .get_mut(&size)
            .and_then(Vec::pop)
        else {
            return 0;
        };
        // SAFETY: the slot held a dead object of exactly `size` bytes. Its
        // header stays until the caller writes the new one, so region walks
        // never see a zero size.
        unsafe {
            (addr as *mut u8)
                .add(HEADER_SIZE)
                .write_bytes(0, size - HEADER_SIZE)
        };
        addr
    }

    // ── Marking ───────────────────────────────────────────────────────

    /// Marks `obj` and accounts its bytes to its region. Returns whether it
    /// was marked already.
    pub fn mark_object(&self, obj: ObjectRef) -> bool {
        let region = self.units.region_at(obj.addr());
        let marked = region.mark_object(obj, &self.forward);
        if !marked {
            // SAFETY: only live objects are marked
            region.add_live_bytes(unsafe { obj.size() });
        }
        marked
    }

    pub fn enqueue_object(&self, obj: ObjectRef) -> bool {
        self.units
            .region_at(obj.addr())
            .enqueue_object(obj, &self.forward)
    }

    pub fn is_marked_object(&self, obj: ObjectRef) -> bool {
        self.units.region_at(obj.addr()).is_marked_object(obj)
    }

    pub fn is_enqueued_object(&self, obj: ObjectRef) -> bool {
        self.units.region_at(obj.addr()).is_enqueued_object(obj)
    }

    pub fn is_in_trace_region(&self, obj: ObjectRef) -> bool {
        self.units.region_at(obj.addr()).is_trace_region()
    }

    /// Whether `obj` sits in a region that is evacuated this cycle.
    #[inline(always)]
    pub fn is_in_from_region(&self, obj: ObjectRef) -> bool {
        self.units.region_at(obj.addr()).is_from_region()
    }

    // ── Raw pointers ──────────────────────────────────────────────────

    /// Pins the region of `obj` while native code holds a raw pointer into
    /// it.
    pub fn add_raw_pointer_object(&self, obj: ObjectRef, phase: GcPhase) {
        let region = self.units.region_at(obj.addr());
        region.inc_raw_pointer_count();
        if region.is_from_region()
            && self.from.try_delete(
                region,
                RegionType::From,
                RegionType::RawPointerPinned,
            )
        {
            crate::heap_check!(
                !phase.is_forwarding(),
                "raw pointer into from region {} during {}",
                region.index(),
                phase.name()
            );
            if phase == GcPhase::PostTrace {
                self.units.clear_ghost_region_bit(region);
            }
            self.raw_pointer_pinned
                .prepend(region, RegionType::RawPointerPinned);
        }
    }

    pub fn remove_raw_pointer_object(&self, obj: ObjectRef) {
        self.units
            .region_at(obj.addr())
            .dec_raw_pointer_count();
    }

    // ── Cycle bookkeeping ─────────────────────────────────────────────

    /// Turns every full small region into a from-region.
    pub fn assemble_small_garbage_candidates(&self) {
        self.from
            .merge(&self.raw_pointer_pinned, RegionType::From);
        self.from.merge(&self.recent_full, RegionType::From);
        self.from
            .merge(&self.unmovable_from, RegionType::From);
        self.from.visit(UnitInfo::clear_live_info);
    }

    /// Turns every large region into a candidate. The mark flags of the
    /// last cycle are dropped here, so survivors read as live until then.
    pub fn assemble_large_garbage_candidates(&self) {
        self.old_large
            .merge(&self.recent_large, RegionType::Large);
        self.old_large.visit(|region| {
            region.clear_live_info();
            region.reset_mark_bit();
        });
    }

    pub fn assemble_pinned_garbage_candidates(&self) {
        self.old_pinned
            .merge(&self.recent_pinned, RegionType::FullPinned);
        self.old_pinned.visit(UnitInfo::clear_live_info);
    }

    /// Starts catching the regions filled while tracing.
    pub fn prepare_trace(&self) {
        self.full_trace.activate();
        self.large_trace.activate();
    }

    /// Ends tracing: regions filled meanwhile become ordinary recent ones
    /// and nothing carries the trace flag anymore.
    pub fn handle_trace_regions(&self) {
        self.full_trace.deactivate();
        self.recent_full
            .merge(&self.full_trace, RegionType::RecentFull);
        self.large_trace.deactivate();
        self.recent_large
            .merge(&self.large_trace, RegionType::RecentLarge);
        self.tl_regions.clear_trace_flag();
        self.recent_pinned.clear_trace_flag();
        self.old_pinned.clear_trace_flag();
    }

    /// Drops dead from-regions and keeps dense or pinned ones out of
    /// forwarding.
    pub fn exempt_from_regions(&self) -> ExemptStats {
        let mut stats = ExemptStats::default();
        let old_from_bytes = self.from.allocated_size();
        for region in self.from.regions() {
            let live = region.live_bytes();
            let size = region.region_size();
            let threshold = (self.exemption_threshold * size as f64) as usize;
            let raw = region.raw_pointer_count();
            if live == 0 && raw == 0 {
                if self
                    .from
                    .try_delete(region, RegionType::From, RegionType::Garbage)
                {
                    stats.garbage_bytes += self.collect_region(region);
                }
            } else if live > threshold {
                log::debug!(
                    "region {} exempted from forwarding: {} units, {live} live bytes",
                    region.index(),
                    region.unit_count()
                );
                if self.from.try_delete(
                    region,
                    RegionType::From,
                    RegionType::UnmovableFrom,
                ) {
                    self.unmovable_from
                        .prepend(region, RegionType::UnmovableFrom);
                }
                stats.floating_garbage += size - live;
            } else if raw > 0 {
                log::debug!(
                    "region {} pinned by {raw} raw pointers: {live} live bytes",
                    region.index()
                );
                if self.from.try_delete(
                    region,
                    RegionType::From,
                    RegionType::RawPointerPinned,
                ) {
                    self.raw_pointer_pinned
                        .prepend(region, RegionType::RawPointerPinned);
                }
                stats.floating_garbage += size - live;
            } else {
                stats.forward_bytes += live;
            }
        }
        log::debug!(
            "exempt from-space: {old_from_bytes} B -> {} B, {} B unmovable, {} B floating garbage, {} B to forward",
            self.from.allocated_size(),
            self.unmovable_from.allocated_size(),
            stats.floating_garbage,
            stats.forward_bytes
        );
        stats
    }

    /// Collects the old large regions whose object died.
    pub fn collect_large_garbage(&self) -> usize {
        let mut collected = 0;
        for region in self.old_large.regions() {
            let obj = ObjectRef::from_addr(region.start());
            if region.is_survived_object(obj) {
                continue;
            }
            self.old_large.delete(region);
            collected += if region.region_size() > LARGE_OBJECT_RELEASE_THRESHOLD {
                self.release_region(region)
            } else {
                self.collect_region(region)
            };
        }
        collected
    }

    /// Collects empty pinned regions and turns dead pinned objects into
    /// free slots.
    pub fn collect_pinned_garbage(&self) -> usize {
        let mut slots = self.pinned_slots.lock();
        slots.clear();
        let mut garbage = 0;
        for region in self.old_pinned.regions() {
            if region.live_bytes() == 0 && region.raw_pointer_count() == 0 {
                self.old_pinned.delete(region);
                garbage += self.collect_region(region);
                continue;
            }
            region.visit_all_objects(|obj| {
                if !region.is_survived_object(obj) {
                    // SAFETY: the walk yields object starts up to alloc_ptr
                    let size = unsafe { obj.size() };
                    slots.entry(size).or_default().push(obj.addr());
                    garbage += size;
                }
            });
        }
        garbage
    }

    /// Snapshots the from-space into ghost regions for this cycle's routes,
    /// after retiring the ghosts of the last cycle.
    pub fn prepare_forward_table(&self) {
        self.ghost_from
            .visit_ghost(|r| self.units.dispel_ghost_from_region(r));
        self.from
            .visit(|r| self.units.prepare_forwardable_region(r));
        self.from.copy_to(&self.ghost_from);
        self.forward.clear_previous_forward_data();
    }

    // ── Routing and forwarding ────────────────────────────────────────

    /// Makes sure `region` has a route. `None` if it is not forwardable in
    /// this cycle.
    pub fn route_region(&self, region: &UnitInfo) -> Option<RouteOutcome> {
        loop {
            match region.route_state() {
                RouteState::Routed | RouteState::Forwarded => {
                    return Some(RouteOutcome::Routed);
                }
                RouteState::Compacted => return Some(RouteOutcome::Compacted),
                RouteState::Normal => return None,
                RouteState::Routing => thread::yield_now(),
                RouteState::Forwardable => {
                    if !region
                        .cas_route_state(RouteState::Forwardable, RouteState::Routing)
                    {
                        continue;
                    }
                    let outcome = {
                        let mut buffer = self.route_buffer.lock();
                        self.route_or_compact_region(region, &mut buffer)
                    };
                    region.set_route_state(match outcome {
                        RouteOutcome::Routed => RouteState::Routed,
                        RouteOutcome::Compacted => RouteState::Compacted,
                    });
                    return Some(outcome);
                }
            }
        }
    }

    /// Reserves to-space for the live bytes of `region`, splitting them over
    /// two to-regions if needed. Compacts in place when to-space runs out.
    fn route_or_compact_region(
        &self,
        region: &UnitInfo,
        buffer: &mut AllocBuffer,
    ) -> RouteOutcome {
        let from_bytes = region.live_bytes();
        let Some(to1) = buffer.region(&self.units) else {
            return match self.allocate_thread_local_region(GcPhase::Forward) {
                Some(to) => {
                    let addr = to.alloc(from_bytes);
                    crate::heap_check!(addr != 0, "to-region {} too small", to.index());
                    buffer.set_region(to);
                    region.route().set(addr, from_bytes as u32, INVALID_UNIT);
                    log::debug!("route region {} to {addr:#x}", region.index());
                    RouteOutcome::Routed
                }
                None => {
                    self.compact_region(region, None);
                    buffer.set_region(region);
                    region
                        .route()
                        .set(region.start(), from_bytes as u32, INVALID_UNIT);
                    RouteOutcome::Compacted
                }
            };
        };

        if to1.free_bytes() >= from_bytes {
            let addr = to1.alloc(from_bytes);
            region.route().set(addr, from_bytes as u32, INVALID_UNIT);
            log::debug!("route region {} to {addr:#x}", region.index());
            return RouteOutcome::Routed;
        }

        // the live objects are split at an object boundary
        let capacity = to1.free_bytes();
        let mut used1 = 0;
        region.visit_live_objects_until_false(|obj| {
            // SAFETY: live objects of a from-region are intact
            let size = unsafe { obj.size() };
            if used1 + size > capacity {
                return false;
            }
            used1 += size;
            true
        });
        let used2 = from_bytes - used1;
        let to1_addr = to1.alloc_ptr();
        self.retire_thread_local_region(to1);

        match self.allocate_thread_local_region(GcPhase::Forward) {
            Some(to2) => {
                to1.alloc(used1);
                let addr2 = to2.alloc(used2);
                crate::heap_check!(addr2 != 0, "to-region {} too small", to2.index());
                buffer.set_region(to2);
                region
                    .route()
                    .set(to1_addr, used1 as u32, to2.index());
                log::debug!(
                    "route region {} to {to1_addr:#x} ({used1} B) and {addr2:#x} ({used2} B)",
                    region.index()
                );
                RouteOutcome::Routed
            }
            None => {
                self.compact_region(region, Some(to1));
                buffer.set_region(region);
                region
                    .route()
                    .set(to1_addr, used1 as u32, region.index());
                RouteOutcome::Compacted
            }
        }
    }

    /// Moves the live objects of `region` down to its start, filling `to1`
    /// first if given. The region becomes thread-local afterwards.
    fn compact_region(&self, region: &UnitInfo, mut to1: Option<&UnitInfo>) {
        log::debug!(
            "compact region {} ({} live bytes){}",
            region.index(),
            region.live_bytes(),
            if to1.is_some() { " partially" } else { "" }
        );
        let end = region.alloc_ptr();
        let mut pos = region.start();
        let mut compact_ptr = region.start();
        while pos < end {
            let obj = ObjectRef::from_addr(pos);
            // SAFETY: objects are laid out back to back and the slide never
            // writes past the object being read
            let size = unsafe { obj.size() };
            crate::heap_check!(size > 0, "zero-sized object at {pos:#x}");
            if region.is_survived_object(obj) {
                let dest = match to1 {
                    Some(to) => match to.alloc(size) {
                        0 => None,
                        addr => Some(addr),
                    },
                    None => None,
                };
                match dest {
                    Some(addr) => {
                        // SAFETY: fresh to-space, disjoint from the region
                        unsafe {
                            ptr::copy_nonoverlapping(
                                pos as *const u8,
                                addr as *mut u8,
                                size,
                            )
                        };
                        // SAFETY: just copied
                        unsafe { ObjectRef::from_addr(addr).header() }
                            .set_state(ObjectState::Normal);
                    }
                    None => {
                        to1 = None;
                        if compact_ptr != pos {
                            // SAFETY: compact_ptr < pos, both inside the region
                            unsafe {
                                ptr::copy(pos as *const u8, compact_ptr as *mut u8, size)
                            };
                        }
                        // SAFETY: an object starts at compact_ptr now
                        unsafe { ObjectRef::from_addr(compact_ptr).header() }
                            .set_state(ObjectState::Normal);
                        compact_ptr += size;
                    }
                }
            }
            pos += size;
        }

        region.set_alloc_ptr(compact_ptr);
        fence(Ordering::Release);
        // SAFETY: the tail only held objects that moved or died
        unsafe { (compact_ptr as *mut u8).write_bytes(0, end - compact_ptr) };
        region.clear_live_info();

        // a forwarding task may have taken it off the list already
        self.from
            .try_delete(region, RegionType::From, RegionType::ThreadLocal);
        self.tl_regions.prepend(region, RegionType::ThreadLocal);
    }

    /// Pops the next from-region for a forwarding task.
    pub fn take_from_region(&self) -> Option<&UnitInfo> {
        self.from.take_head_as(Some(RegionType::LoneFrom))
    }

    /// Copies every live object of `region` to to-space and collects it.
    /// Returns the bytes collected.
    pub fn forward_region(&self, region: &UnitInfo) -> usize {
        crate::heap_check!(
            matches!(region.region_type(), RegionType::From | RegionType::LoneFrom),
            "cannot forward {region:?}"
        );
        if region.live_bytes() == 0 {
            return self.collect_region(region);
        }
        if self.route_region(region) != Some(RouteOutcome::Routed) {
            return 0;
        }
        crate::heap_check!(
            region.raw_pointer_count() == 0,
            "forwarding region {} pinned by raw pointers",
            region.index()
        );
        region.visit_live_objects_until_false(|obj| {
            self.copy_object(region, obj);
            true
        });
        region.set_route_state(RouteState::Forwarded);
        self.collect_region(region)
    }

    #[inline]
    fn route_in(&self, region: &UnitInfo, obj: ObjectRef) -> ObjectRef {
        let pre = region.ghost_pre_live_bytes(obj.addr());
        ObjectRef::from_addr(region.route().route(pre, &self.units))
    }

    /// To-space address of `obj` if it lies in a routed or compacted ghost
    /// region, routing the region on demand.
    pub fn route_object(&self, obj: ObjectRef) -> Option<(ObjectRef, RouteOutcome)> {
        let region = self.units.ghost_region_at(obj.addr())?;
        let outcome = self.route_region(region)?;
        Some((self.route_in(region, obj), outcome))
    }

    /// The to-space version of `obj`, or null if it does not move.
    pub fn find_to_version(&self, obj: ObjectRef) -> ObjectRef {
        self.route_object(obj)
            .map_or(ObjectRef::NULL, |(to, _)| to)
    }

    /// Forwards `obj` and returns its to-space address. Objects outside the
    /// ghost regions are returned unchanged.
    pub fn forward_object(&self, obj: ObjectRef) -> ObjectRef {
        let Some(region) = self.units.ghost_region_at(obj.addr()) else {
            return obj;
        };
        match self.route_region(region) {
            None => obj,
            Some(RouteOutcome::Compacted) => self.route_in(region, obj),
            Some(RouteOutcome::Routed) => self.copy_object(region, obj),
        }
    }

    /// Copies `obj` to its route unless someone else does or did.
    fn copy_object(&self, region: &UnitInfo, obj: ObjectRef) -> ObjectRef {
        let to = self.route_in(region, obj);
        if region.route_state() == RouteState::Forwarded
            || !region.try_lock_read_from_region()
        {
            // every object of the region has been copied
            return to;
        }
        // SAFETY: the read lock keeps the from-region from being collected
        let header = unsafe { obj.header() };
        loop {
            match header.state() {
                ObjectState::Forwarded => break,
                ObjectState::Locked => thread::yield_now(),
                ObjectState::Normal => {
                    if !header.try_lock() {
                        continue;
                    }
                    let size = header.size();
                    // SAFETY: to-space for the object was reserved by routing
                    unsafe {
                        ptr::copy_nonoverlapping(obj.as_ptr(), to.as_ptr(), size);
                        to.header().set_state(ObjectState::Normal);
                    }
                    fence(Ordering::Release);
                    header.set_state(ObjectState::Forwarded);
                    break;
                }
            }
        }
        // SAFETY: taken above
        unsafe { region.unlock_read() };
        to
    }

    /// Retires the shared to-space region once forwarding is over.
    pub fn finish_forwarding(&self) {
        self.route_buffer.lock().clear(self);
    }

    // ── Sizes and walks ───────────────────────────────────────────────

    fn in_use_lists(&self) -> [&RegionList; 11] {
        [
            &self.tl_regions,
            &self.recent_full,
            &self.full_trace,
            &self.from,
            &self.unmovable_from,
            &self.recent_pinned,
            &self.old_pinned,
            &self.raw_pointer_pinned,
            &self.recent_large,
            &self.old_large,
            &self.large_trace,
        ]
    }

    /// Every list, for diagnostics.
    pub fn region_lists(&self) -> [&RegionList; 13] {
        [
            &self.tl_regions,
            &self.recent_full,
            &self.full_trace,
            &self.from,
            &self.ghost_from,
            &self.unmovable_from,
            &self.garbage,
            &self.recent_pinned,
            &self.old_pinned,
            &self.raw_pointer_pinned,
            &self.recent_large,
            &self.old_large,
            &self.large_trace,
        ]
    }

    /// Bytes of all regions in use.
    pub fn allocated_size(&self) -> usize {
        self.in_use_lists()
            .iter()
            .map(|l| l.allocated_size())
            .sum()
    }

    pub fn from_space_size(&self) -> usize {
        self.from.allocated_size()
    }

    pub fn large_space_size(&self) -> usize {
        self.old_large.allocated_size()
            + self.recent_large.allocated_size()
            + self.large_trace.allocated_size()
    }

    pub fn pinned_space_size(&self) -> usize {
        self.old_pinned.allocated_size() + self.recent_pinned.allocated_size()
    }

    pub fn garbage_size(&self) -> usize {
        self.garbage.allocated_size()
    }

    pub fn free_unit_count(&self) -> usize {
        let untouched =
            self.units.len() - self.inactive_cursor.load(Ordering::Acquire) as usize;
        untouched + self.free.dirty_unit_count() + self.free.released_unit_count()
    }

    /// Calls `f` on every object of every region in use. The world must be
    /// stopped.
    pub fn for_each_object(&self, mut f: impl FnMut(ObjectRef)) {
        let end = self.inactive_cursor.load(Ordering::Acquire);
        self.units.for_each_region_until(end, |region| {
            if !region.is_garbage_region() {
                region.visit_all_objects(&mut f);
            }
        });
    }

    /// Sum of the sizes of all marked objects. The world must be stopped.
    pub fn live_bytes_by_region_scan(&self) -> usize {
        let mut live = 0;
        let end = self.inactive_cursor.load(Ordering::Acquire);
        self.units.for_each_region_until(end, |region| {
            if region.is_garbage_region() {
                return;
            }
            region.visit_all_objects(|obj| {
                if region.is_survived_object(obj) {
                    // SAFETY: object starts from the region walk
                    live += unsafe { obj.size() };
                }
            });
        });
        live
    }

    pub fn verify_free_trees(&self) -> Result<(), String> {
        self.free.verify()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::BaseObject;

    const UNITS: usize = 64;

    fn create_test_settings() -> HeapSettings {
        HeapSettings {
            heap_size: UNITS * UNIT_SIZE,
            region_size: 4 * UNIT_SIZE,
            large_object_threshold: 2 * UNIT_SIZE,
            gc_threshold: UNITS * UNIT_SIZE,
            ..HeapSettings::default()
        }
    }

    fn create_test_env() -> RegionManager {
        let heap = Arc::new(MemMap::map(UNITS * UNIT_SIZE, "test-regions").expect("map"));
        RegionManager::new(heap, &create_test_settings()).expect("region manager")
    }

    fn init_object(addr: usize, size: usize) -> ObjectRef {
        assert_ne!(addr, 0);
        // SAFETY: freshly allocated, zeroed memory
        unsafe { (*(addr as *const BaseObject)).init(size as u32, 7) };
        ObjectRef::from_addr(addr)
    }

    fn fill_full_region<'a>(
        regions: &'a RegionManager,
        sizes: &[usize],
    ) -> (&'a UnitInfo, Vec<ObjectRef>) {
        let mut buffer = AllocBuffer::new();
        let objs: Vec<_> = sizes
            .iter()
            .map(|&s| init_object(buffer.alloc(regions, s, GcPhase::Idle), s))
            .collect();
        let region = buffer.region(regions.units()).expect("region");
        buffer.clear(regions);
        (region, objs)
    }

    #[test]
    fn test_take_region_prefers_garbage_of_same_size() {
        let regions = create_test_env();
        let a = regions.take_region(4, UnitRole::Small).expect("a");
        assert_eq!(a.index(), 0);
        unsafe { (a.start() as *mut u8).write_bytes(0xCD, 64) };
        regions.collect_region(a);

        let b = regions.take_region(4, UnitRole::Small).expect("b");
        assert_eq!(b.index(), 0);
        assert_eq!(unsafe { *(b.start() as *const u8) }, 0);

        // a garbage region of another size is reclaimed instead
        regions.collect_region(b);
        let c = regions.take_region(2, UnitRole::Small).expect("c");
        assert_eq!(c.index(), 0);
        assert_eq!(regions.free.dirty_unit_count(), 2);
    }

    #[test]
    fn test_inactive_cursor_exhaustion() {
        let regions = create_test_env();
        for i in 0..(UNITS / 4) as u32 {
            assert_eq!(
                regions.take_region(4, UnitRole::Small).map(|r| r.index()),
                Some(i * 4)
            );
        }
        assert!(regions.take_region(1, UnitRole::Small).is_none());
        assert_eq!(regions.free_unit_count(), 0);
    }

    #[test]
    fn test_heu_request_raised_past_threshold() {
        let regions = create_test_env();
        regions.set_heu_threshold(8 * UNIT_SIZE);
        assert!(regions.allocate_thread_local_region(GcPhase::Idle).is_some());
        assert!(!regions.take_heu_request());
        assert!(regions.allocate_thread_local_region(GcPhase::Idle).is_some());
        assert!(regions.take_heu_request());
        assert!(!regions.take_heu_request());
    }

    #[test]
    fn test_trace_regions_go_to_cache_then_recent_full() {
        let regions = create_test_env();
        regions.prepare_trace();
        let region = regions
            .allocate_thread_local_region(GcPhase::Trace)
            .expect("region");
        assert!(region.is_trace_region());
        regions.retire_thread_local_region(region);
        assert_eq!(regions.full_trace.region_count(), 1);

        regions.handle_trace_regions();
        assert_eq!(regions.full_trace.region_count(), 0);
        assert_eq!(regions.recent_full.region_count(), 1);
        assert!(!region.is_trace_region());
        assert_eq!(region.region_type(), RegionType::RecentFull);
    }

    #[test]
    fn test_large_garbage_collection() {
        let regions = create_test_env();
        let size = 3 * UNIT_SIZE;
        let dead = init_object(regions.alloc_large(size, GcPhase::Idle), size);
        let live = init_object(regions.alloc_large(size, GcPhase::Idle), size);
        assert_eq!(regions.large_space_size(), 6 * UNIT_SIZE);

        regions.assemble_large_garbage_candidates();
        assert!(!regions.mark_object(live));
        let collected = regions.collect_large_garbage();
        assert_eq!(collected, 3 * UNIT_SIZE);
        assert_eq!(regions.units().region_at(dead.addr()).region_type(), RegionType::Garbage);
        assert!(regions.is_marked_object(live));
        assert_eq!(regions.old_large.region_count(), 1);

        // the next cycle starts from clean flags
        regions.assemble_large_garbage_candidates();
        assert!(!regions.is_marked_object(live));
    }

    #[test]
    fn test_dead_pinned_slots_are_reused() {
        let regions = create_test_env();
        let a = init_object(regions.alloc_pinned(64, GcPhase::Idle), 64);
        let b = init_object(regions.alloc_pinned(64, GcPhase::Idle), 64);

        regions.assemble_pinned_garbage_candidates();
        regions.mark_object(b);
        assert_eq!(regions.collect_pinned_garbage(), 64);

        // no slot reuse while the slot lists are rebuilt
        let fresh = regions.alloc_pinned(64, GcPhase::PostTrace);
        assert_ne!(fresh, a.addr());
        init_object(fresh, 64);

        regions.recent_pinned.clear();
        let reused = regions.alloc_pinned(64, GcPhase::Idle);
        assert_eq!(reused, a.addr());
    }

    #[test]
    fn test_exempt_sorts_from_space() {
        let regions = create_test_env();
        let (dense, dense_objs) = fill_full_region(&regions, &[UNIT_SIZE * 2, UNIT_SIZE + 2048]);
        let (sparse, sparse_objs) = fill_full_region(&regions, &[256, 512, 1024]);
        let (empty, _) = fill_full_region(&regions, &[128]);
        regions.assemble_small_garbage_candidates();
        assert_eq!(regions.from.region_count(), 3);

        for obj in dense_objs {
            regions.mark_object(obj);
        }
        regions.mark_object(sparse_objs[1]);

        let stats = regions.exempt_from_regions();
        assert_eq!(stats.forward_bytes, 512);
        assert_eq!(dense.region_type(), RegionType::UnmovableFrom);
        assert_eq!(sparse.region_type(), RegionType::From);
        assert_eq!(empty.region_type(), RegionType::Garbage);
        assert_eq!(stats.garbage_bytes, 4 * UNIT_SIZE);
    }

    #[test]
    fn test_forward_region_copies_live_objects() {
        let regions = create_test_env();
        let (from, objs) = fill_full_region(&regions, &[32, 48, 64, 16]);
        for (i, &obj) in objs.iter().enumerate() {
            // SAFETY: valid object with room for a payload word
            unsafe { *((obj.addr() + HEADER_SIZE) as *mut u64) = i as u64 };
        }
        regions.assemble_small_garbage_candidates();
        regions.mark_object(objs[1]);
        regions.mark_object(objs[3]);
        regions.exempt_from_regions();
        regions.prepare_forward_table();

        let routed = regions.find_to_version(objs[3]);
        assert!(!routed.is_null());
        assert_eq!(from.route_state(), RouteState::Routed);

        let region = regions.take_from_region().expect("from region");
        assert_eq!(region.index(), from.index());
        let collected = regions.forward_region(region);
        assert_eq!(collected, from.region_size() - 64);
        assert!(regions.take_from_region().is_none());

        let to1 = regions.forward_object(objs[1]);
        let to3 = regions.forward_object(objs[3]);
        assert_eq!(to3, routed);
        assert_eq!(to3.addr(), to1.addr() + 48);
        unsafe {
            assert_eq!(*((to1.addr() + HEADER_SIZE) as *const u64), 1);
            assert_eq!(*((to3.addr() + HEADER_SIZE) as *const u64), 3);
            assert_eq!(to1.header().state(), ObjectState::Normal);
            assert_eq!(objs[1].header().state(), ObjectState::Forwarded);
        }
        assert_eq!(from.region_type(), RegionType::Garbage);
        regions.finish_forwarding();
    }

    #[test]
    fn test_compaction_when_to_space_is_exhausted() {
        let regions = create_test_env();
        let (from, objs) = fill_full_region(&regions, &[64, 128, 64, 256]);
        for (i, &obj) in objs.iter().enumerate() {
            unsafe { *((obj.addr() + HEADER_SIZE) as *mut u64) = 100 + i as u64 };
        }
        regions.assemble_small_garbage_candidates();
        regions.mark_object(objs[1]);
        regions.mark_object(objs[3]);
        regions.exempt_from_regions();
        regions.prepare_forward_table();

        // use up every unit
        while regions.take_region(1, UnitRole::Small).is_some() {}

        let to3 = regions.forward_object(objs[3]);
        assert_eq!(from.route_state(), RouteState::Compacted);
        assert_eq!(from.region_type(), RegionType::ThreadLocal);
        assert_eq!(to3.addr(), from.start() + 128);
        assert_eq!(from.alloc_ptr(), from.start() + 384);
        unsafe {
            assert_eq!(*((from.start() + HEADER_SIZE) as *const u64), 101);
            assert_eq!(*((to3.addr() + HEADER_SIZE) as *const u64), 103);
        }
        assert_eq!(regions.forward_object(objs[1]).addr(), from.start());
        assert!(regions.take_from_region().is_none());
    }

    #[test]
    fn test_raw_pointer_pins_from_region() {
        let regions = create_test_env();
        let (from, objs) = fill_full_region(&regions, &[64, 64]);
        regions.assemble_small_garbage_candidates();
        regions.mark_object(objs[0]);

        regions.add_raw_pointer_object(objs[0], GcPhase::Trace);
        assert_eq!(from.region_type(), RegionType::RawPointerPinned);
        assert_eq!(regions.from.region_count(), 0);

        regions.remove_raw_pointer_object(objs[0]);
        assert_eq!(from.raw_pointer_count(), 0);
        regions.assemble_small_garbage_candidates();
        assert_eq!(from.region_type(), RegionType::From);
    }
}
