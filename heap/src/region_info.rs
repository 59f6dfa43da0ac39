//! Per-unit metadata.
//!
//! The heap is a grid of OS-page sized units. A region is a run of units;
//! its metadata lives in the entry of its first unit (the head), every other
//! unit of the run is a subordinate pointing back at the head. Lists link
//! regions by unit index, never by pointer.

use std::{
    ptr,
    sync::atomic::{
        AtomicI32, AtomicPtr, AtomicU8, AtomicU32, AtomicUsize, Ordering,
    },
};

use bitflags::bitflags;
use parking_lot::{RawRwLock, lock_api::RawRwLock as _};

use crate::{
    cartesian_tree::{UnitCount, UnitIndex},
    live_info::LiveInfo,
    object::ObjectRef,
    system::OS_PAGE_SIZE,
};

pub const UNIT_SIZE: usize = OS_PAGE_SIZE;
pub const INVALID_UNIT: UnitIndex = u32::MAX;

// ── Roles, types, states ──────────────────────────────────────────────

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitRole {
    Free = 0,
    Small = 1,
    Large = 2,
    /// Non-head unit of a multi-unit region.
    Subordinate = 3,
}

impl From<u8> for UnitRole {
    fn from(val: u8) -> Self {
        match val {
            1 => UnitRole::Small,
            2 => UnitRole::Large,
            3 => UnitRole::Subordinate,
            _ => UnitRole::Free,
        }
    }
}

/// The list a region currently belongs to.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionType {
    Free = 0,
    ThreadLocal = 1,
    RecentFull = 2,
    From = 3,
    /// A from-region taken off the from list by a forwarding task.
    LoneFrom = 4,
    UnmovableFrom = 5,
    To = 6,
    FullPinned = 7,
    RecentPinned = 8,
    RawPointerPinned = 9,
    Large = 10,
    RecentLarge = 11,
    Garbage = 12,
}

impl From<u8> for RegionType {
    fn from(val: u8) -> Self {
        match val {
            1 => RegionType::ThreadLocal,
            2 => RegionType::RecentFull,
            3 => RegionType::From,
            4 => RegionType::LoneFrom,
            5 => RegionType::UnmovableFrom,
            6 => RegionType::To,
            7 => RegionType::FullPinned,
            8 => RegionType::RecentPinned,
            9 => RegionType::RawPointerPinned,
            10 => RegionType::Large,
            11 => RegionType::RecentLarge,
            12 => RegionType::Garbage,
            _ => RegionType::Free,
        }
    }
}

impl RegionType {
    pub fn name(self) -> &'static str {
        match self {
            RegionType::Free => "free",
            RegionType::ThreadLocal => "thread-local",
            RegionType::RecentFull => "recent-full",
            RegionType::From => "from",
            RegionType::LoneFrom => "lone-from",
            RegionType::UnmovableFrom => "unmovable-from",
            RegionType::To => "to",
            RegionType::FullPinned => "full-pinned",
            RegionType::RecentPinned => "recent-pinned",
            RegionType::RawPointerPinned => "raw-pointer-pinned",
            RegionType::Large => "large",
            RegionType::RecentLarge => "recent-large",
            RegionType::Garbage => "garbage",
        }
    }
}

/// Progress of a from-region through forwarding.
///
/// `Normal -> Forwardable -> Routing -> Routed | Compacted`, and
/// `Routed -> Forwarded` once every live object has been copied.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Normal = 0,
    Forwardable = 1,
    Routing = 2,
    Routed = 3,
    Compacted = 4,
    Forwarded = 5,
}

impl From<u8> for RouteState {
    fn from(val: u8) -> Self {
        match val {
            1 => RouteState::Forwardable,
            2 => RouteState::Routing,
            3 => RouteState::Routed,
            4 => RouteState::Compacted,
            5 => RouteState::Forwarded,
            _ => RouteState::Normal,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u8 {
        /// Allocated during tracing; its objects are implicitly live.
        const TRACE_REGION = 1 << 0;
        /// Units of a from-region snapshot readers may still resolve.
        const IN_GHOST     = 1 << 1;
        const MARKED       = 1 << 2;
        const ENQUEUED     = 1 << 3;
        const RESURRECTED  = 1 << 4;
    }
}

// ── Route info ────────────────────────────────────────────────────────

/// Destination of the live objects of a routed from-region.
///
/// Live bytes below `to1_used` go to `to1_start`, the rest to the start of
/// the region `to2_index`.
#[derive(Debug)]
pub struct RouteInfo {
    to1_start: AtomicUsize,
    to1_used: AtomicU32,
    to2_index: AtomicU32,
}

impl RouteInfo {
    const fn new() -> Self {
        Self {
            to1_start: AtomicUsize::new(0),
            to1_used: AtomicU32::new(0),
            to2_index: AtomicU32::new(INVALID_UNIT),
        }
    }

    pub fn set(&self, to1_start: usize, to1_used: u32, to2_index: UnitIndex) {
        self.to1_start.store(to1_start, Ordering::Relaxed);
        self.to1_used.store(to1_used, Ordering::Relaxed);
        self.to2_index.store(to2_index, Ordering::Relaxed);
    }

    /// Route for every live object: one destination, unbounded.
    pub fn set_single(&self, to1_start: usize) {
        self.set(to1_start, u32::MAX, INVALID_UNIT);
    }

    pub fn reset(&self) {
        self.set(0, 0, INVALID_UNIT);
    }

    #[inline]
    pub fn to1_start(&self) -> usize {
        self.to1_start.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn to1_used(&self) -> u32 {
        self.to1_used.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn to2_index(&self) -> UnitIndex {
        self.to2_index.load(Ordering::Relaxed)
    }

    /// Address of the object that has `pre_live` live bytes before it in its
    /// from-region.
    #[inline]
    pub fn route(&self, pre_live: usize, units: &UnitTable) -> usize {
        let used = self.to1_used() as usize;
        if pre_live < used {
            self.to1_start() + pre_live
        } else {
            units.unit_address(self.to2_index()) + (pre_live - used)
        }
    }
}

// ── UnitInfo ──────────────────────────────────────────────────────────

/// Metadata of one unit. Only head units carry meaningful region fields.
///
/// Fields suffixed `0` are the ghost snapshot taken when a from-region
/// becomes forwardable; they stay readable while the live fields move on.
pub struct UnitInfo {
    index: UnitIndex,
    start: usize,

    role: AtomicU8,
    role0: AtomicU8,
    region_type: AtomicU8,
    flags: AtomicU8,
    route_state: AtomicU8,

    owner: AtomicU32,
    owner0: AtomicU32,

    alloc_ptr: AtomicUsize,
    region_end: AtomicUsize,
    region_end0: AtomicUsize,

    next: AtomicU32,
    prev: AtomicU32,
    next0: AtomicU32,

    live_bytes: AtomicU32,
    raw_pointer_count: AtomicI32,

    live_info: AtomicPtr<LiveInfo>,
    live_info0: AtomicPtr<LiveInfo>,

    route: RouteInfo,
    /// Shared by readers copying out of a from-region, exclusive while the
    /// region is collected.
    lock: RawRwLock,
}

impl std::fmt::Debug for UnitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitInfo")
            .field("index", &self.index)
            .field("start", &format_args!("{:#x}", self.start))
            .field("role", &self.role())
            .field("type", &self.region_type())
            .field("flags", &self.flags())
            .field("alloc_ptr", &format_args!("{:#x}", self.alloc_ptr()))
            .field("region_end", &format_args!("{:#x}", self.region_end()))
            .field("live_bytes", &self.live_bytes())
            .finish()
    }
}

impl UnitInfo {
    fn new(index: UnitIndex, start: usize) -> Self {
        Self {
            index,
            start,
            role: AtomicU8::new(UnitRole::Free as u8),
            role0: AtomicU8::new(UnitRole::Free as u8),
            region_type: AtomicU8::new(RegionType::Free as u8),
            flags: AtomicU8::new(0),
            route_state: AtomicU8::new(RouteState::Normal as u8),
            owner: AtomicU32::new(INVALID_UNIT),
            owner0: AtomicU32::new(INVALID_UNIT),
            alloc_ptr: AtomicUsize::new(start),
            region_end: AtomicUsize::new(start + UNIT_SIZE),
            region_end0: AtomicUsize::new(start + UNIT_SIZE),
            next: AtomicU32::new(INVALID_UNIT),
            prev: AtomicU32::new(INVALID_UNIT),
            next0: AtomicU32::new(INVALID_UNIT),
            live_bytes: AtomicU32::new(0),
            raw_pointer_count: AtomicI32::new(0),
            live_info: AtomicPtr::new(ptr::null_mut()),
            live_info0: AtomicPtr::new(ptr::null_mut()),
            route: RouteInfo::new(),
            lock: RawRwLock::INIT,
        }
    }

    /// Resets the head entry of a region of `units` units.
    fn init_region_info(&self, units: UnitCount, role: UnitRole) {
        self.alloc_ptr.store(self.start, Ordering::Relaxed);
        self.region_end
            .store(self.start + units as usize * UNIT_SIZE, Ordering::Relaxed);
        self.prev.store(INVALID_UNIT, Ordering::Relaxed);
        self.next.store(INVALID_UNIT, Ordering::Relaxed);
        self.live_bytes.store(0, Ordering::Relaxed);
        self.live_info.store(ptr::null_mut(), Ordering::Relaxed);
        self.region_type
            .store(RegionType::Free as u8, Ordering::Relaxed);
        self.owner.store(INVALID_UNIT, Ordering::Relaxed);
        self.raw_pointer_count.store(0, Ordering::Relaxed);
        self.clear_flags(
            RegionFlags::TRACE_REGION
                | RegionFlags::MARKED
                | RegionFlags::ENQUEUED
                | RegionFlags::RESURRECTED,
        );
        self.role.store(role as u8, Ordering::Release);
    }

    #[inline(always)]
    pub fn index(&self) -> UnitIndex {
        self.index
    }

    #[inline(always)]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline(always)]
    pub fn role(&self) -> UnitRole {
        UnitRole::from(self.role.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn role0(&self) -> UnitRole {
        UnitRole::from(self.role0.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn region_type(&self) -> RegionType {
        RegionType::from(self.region_type.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn set_region_type(&self, ty: RegionType) {
        self.region_type.store(ty as u8, Ordering::Release);
    }

    #[inline(always)]
    pub fn flags(&self) -> RegionFlags {
        RegionFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn has_flag(&self, flag: RegionFlags) -> bool {
        self.flags().contains(flag)
    }

    #[inline(always)]
    pub fn set_flags(&self, flags: RegionFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn clear_flags(&self, flags: RegionFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Sets `flag` and reports whether it was set already.
    #[inline(always)]
    pub fn test_and_set_flag(&self, flag: RegionFlags) -> bool {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel) & flag.bits() != 0
    }

    #[inline(always)]
    pub fn is_trace_region(&self) -> bool {
        self.has_flag(RegionFlags::TRACE_REGION)
    }

    pub fn set_trace_region(&self, on: bool) {
        if on {
            self.set_flags(RegionFlags::TRACE_REGION);
        } else {
            self.clear_flags(RegionFlags::TRACE_REGION);
        }
    }

    #[inline(always)]
    pub fn is_ghost_from_region(&self) -> bool {
        self.has_flag(RegionFlags::IN_GHOST)
    }

    /// Clears the per-object flags of a large region.
    pub fn reset_mark_bit(&self) {
        self.clear_flags(
            RegionFlags::MARKED | RegionFlags::ENQUEUED | RegionFlags::RESURRECTED,
        );
    }

    #[inline(always)]
    pub fn owner(&self) -> UnitIndex {
        self.owner.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn owner0(&self) -> UnitIndex {
        self.owner0.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn alloc_ptr(&self) -> usize {
        self.alloc_ptr.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set_alloc_ptr(&self, addr: usize) {
        self.alloc_ptr.store(addr, Ordering::Release);
    }

    #[inline(always)]
    pub fn region_end(&self) -> usize {
        self.region_end.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn region_end0(&self) -> usize {
        self.region_end0.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn region_size(&self) -> usize {
        self.region_end() - self.start
    }

    #[inline(always)]
    pub fn unit_count(&self) -> UnitCount {
        (self.region_size() / UNIT_SIZE) as UnitCount
    }

    #[inline(always)]
    pub fn allocated_bytes(&self) -> usize {
        self.alloc_ptr() - self.start
    }

    #[inline(always)]
    pub fn free_bytes(&self) -> usize {
        self.region_end() - self.alloc_ptr()
    }

    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.region_end()
    }

    #[inline(always)]
    pub fn next(&self) -> UnitIndex {
        self.next.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set_next(&self, idx: UnitIndex) {
        self.next.store(idx, Ordering::Release);
    }

    #[inline(always)]
    pub fn prev(&self) -> UnitIndex {
        self.prev.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set_prev(&self, idx: UnitIndex) {
        self.prev.store(idx, Ordering::Release);
    }

    #[inline(always)]
    pub fn next0(&self) -> UnitIndex {
        self.next0.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set_next0(&self, idx: UnitIndex) {
        self.next0.store(idx, Ordering::Release);
    }

    #[inline(always)]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire) as usize
    }

    #[inline(always)]
    pub fn add_live_bytes(&self, bytes: usize) {
        self.live_bytes.fetch_add(bytes as u32, Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn reset_live_bytes(&self) {
        self.live_bytes.store(0, Ordering::Release);
    }

    pub fn raw_pointer_count(&self) -> i32 {
        self.raw_pointer_count.load(Ordering::SeqCst)
    }

    pub fn inc_raw_pointer_count(&self) -> i32 {
        let old = self.raw_pointer_count.fetch_add(1, Ordering::SeqCst);
        crate::heap_check!(
            old >= 0,
            "region {} has raw pointer count {old}",
            self.index
        );
        old
    }

    pub fn dec_raw_pointer_count(&self) -> i32 {
        let old = self.raw_pointer_count.fetch_sub(1, Ordering::SeqCst);
        crate::heap_check!(
            old > 0,
            "raw pointer count underflow in region {}",
            self.index
        );
        old
    }

    pub fn cas_raw_pointer_count(&self, current: i32, new: i32) -> bool {
        self.raw_pointer_count
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::Acquire)
            .is_ok()
    }

    #[inline(always)]
    pub(crate) fn live_info_slot(&self) -> &AtomicPtr<LiveInfo> {
        &self.live_info
    }

    #[inline(always)]
    pub fn live_info0(&self) -> *mut LiveInfo {
        self.live_info0.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn route_state(&self) -> RouteState {
        RouteState::from(self.route_state.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn set_route_state(&self, state: RouteState) {
        self.route_state.store(state as u8, Ordering::Release);
    }

    #[inline(always)]
    pub fn cas_route_state(&self, current: RouteState, new: RouteState) -> bool {
        self.route_state
            .compare_exchange(
                current as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    #[inline(always)]
    pub fn route(&self) -> &RouteInfo {
        &self.route
    }

    // ── type predicates ──

    #[inline(always)]
    pub fn is_large_region(&self) -> bool {
        self.role() == UnitRole::Large
    }

    #[inline(always)]
    pub fn is_small_region(&self) -> bool {
        self.role() == UnitRole::Small
    }

    #[inline(always)]
    pub fn is_from_region(&self) -> bool {
        self.region_type() == RegionType::From
    }

    #[inline(always)]
    pub fn is_lone_from_region(&self) -> bool {
        self.region_type() == RegionType::LoneFrom
    }

    #[inline(always)]
    pub fn is_unmovable_from_region(&self) -> bool {
        matches!(
            self.region_type(),
            RegionType::UnmovableFrom | RegionType::RawPointerPinned
        )
    }

    #[inline(always)]
    pub fn is_pinned_region(&self) -> bool {
        matches!(
            self.region_type(),
            RegionType::FullPinned
                | RegionType::RecentPinned
                | RegionType::RawPointerPinned
        )
    }

    #[inline(always)]
    pub fn is_garbage_region(&self) -> bool {
        self.region_type() == RegionType::Garbage
    }

    // ── allocation ──

    /// Bump allocation for a region owned by one thread. Returns 0 when the
    /// region is full.
    #[inline(always)]
    pub fn alloc(&self, size: usize) -> usize {
        let addr = self.alloc_ptr.load(Ordering::Relaxed);
        if addr + size <= self.region_end() {
            self.alloc_ptr.store(addr + size, Ordering::Release);
            addr
        } else {
            0
        }
    }

    // ── locking ──

    /// Takes the read lock if this is still a from-region. Callers release
    /// it with [`UnitInfo::unlock_read`].
    pub fn try_lock_read_from_region(&self) -> bool {
        if !self.lock.try_lock_shared() {
            return false;
        }
        if matches!(self.region_type(), RegionType::From | RegionType::LoneFrom)
        {
            return true;
        }
        // SAFETY: taken just above
        unsafe { self.lock.unlock_shared() };
        false
    }

    /// # Safety
    /// The caller must hold the read lock.
    pub unsafe fn unlock_read(&self) {
        // SAFETY: guaranteed by caller
        unsafe { self.lock.unlock_shared() };
    }

    pub fn lock_write(&self) {
        self.lock.lock_exclusive();
    }

    /// # Safety
    /// The caller must hold the write lock.
    pub unsafe fn unlock_write(&self) {
        // SAFETY: guaranteed by caller
        unsafe { self.lock.unlock_exclusive() };
    }

    // ── object walks ──

    /// Calls `f` for every object between the region start and the
    /// allocation pointer.
    pub fn visit_all_objects(&self, mut f: impl FnMut(ObjectRef)) {
        if self.is_large_region() {
            if self.alloc_ptr() > self.start {
                f(ObjectRef::from_addr(self.start));
            }
            return;
        }
        let end = self.alloc_ptr();
        let mut pos = self.start;
        while pos < end {
            let obj = ObjectRef::from_addr(pos);
            // SAFETY: objects are laid out back to back up to alloc_ptr
            let size = unsafe { obj.size() };
            crate::heap_check!(
                size > 0,
                "zero-sized object at {pos:#x} in region {}",
                self.index
            );
            f(obj);
            pos += size;
        }
    }
}

// ── UnitTable ─────────────────────────────────────────────────────────

/// Metadata of every unit of the heap, indexed by unit.
pub struct UnitTable {
    units: Box<[UnitInfo]>,
    heap_start: usize,
    heap_end: usize,
}

impl UnitTable {
    pub fn new(heap_start: usize, unit_count: usize) -> Self {
        debug_assert!(heap_start.is_multiple_of(UNIT_SIZE));
        let units = (0..unit_count)
            .map(|i| UnitInfo::new(i as UnitIndex, heap_start + i * UNIT_SIZE))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            units,
            heap_start,
            heap_end: heap_start + unit_count * UNIT_SIZE,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    #[inline(always)]
    pub fn heap_start(&self) -> usize {
        self.heap_start
    }

    #[inline(always)]
    pub fn heap_end(&self) -> usize {
        self.heap_end
    }

    #[inline(always)]
    pub fn is_heap_address(&self, addr: usize) -> bool {
        addr >= self.heap_start && addr < self.heap_end
    }

    #[inline(always)]
    pub fn unit(&self, idx: UnitIndex) -> &UnitInfo {
        &self.units[idx as usize]
    }

    #[inline(always)]
    pub fn unit_index(&self, addr: usize) -> UnitIndex {
        debug_assert!(self.is_heap_address(addr));
        ((addr - self.heap_start) / UNIT_SIZE) as UnitIndex
    }

    #[inline(always)]
    pub fn unit_address(&self, idx: UnitIndex) -> usize {
        self.heap_start + idx as usize * UNIT_SIZE
    }

    /// Head of the region containing `addr`.
    #[inline(always)]
    pub fn region_at(&self, addr: usize) -> &UnitInfo {
        let unit = self.unit(self.unit_index(addr));
        if unit.role() == UnitRole::Subordinate {
            self.unit(unit.owner())
        } else {
            unit
        }
    }

    /// Head of the ghost region containing `addr`, if `addr` lies in one.
    #[inline(always)]
    pub fn ghost_region_at(&self, addr: usize) -> Option<&UnitInfo> {
        if !self.is_heap_address(addr) {
            return None;
        }
        let unit = self.unit(self.unit_index(addr));
        if !unit.is_ghost_from_region() {
            return None;
        }
        if unit.role0() == UnitRole::Subordinate {
            Some(self.unit(unit.owner0()))
        } else {
            Some(unit)
        }
    }

    /// Turns `[idx, idx + count)` into one region with head `idx`.
    pub fn init_region(&self, idx: UnitIndex, count: UnitCount, role: UnitRole) {
        debug_assert!(count > 0);
        debug_assert!((idx + count) as usize <= self.len());
        for sub in idx + 1..idx + count {
            let unit = self.unit(sub);
            unit.owner.store(idx, Ordering::Relaxed);
            unit.role
                .store(UnitRole::Subordinate as u8, Ordering::Release);
        }
        self.unit(idx).init_region_info(count, role);
    }

    /// Marks `[idx, idx + count)` free again. Ghost bits survive: readers of
    /// the last cycle may still resolve through them.
    pub fn init_free_units(&self, idx: UnitIndex, count: UnitCount) {
        for i in idx..idx + count {
            self.unit(i).init_region_info(1, UnitRole::Free);
        }
    }

    /// Zeroes the memory of `[idx, idx + count)`.
    pub fn clear_units(&self, idx: UnitIndex, count: UnitCount) {
        let addr = self.unit_address(idx);
        // SAFETY: the units are free and owned by the caller
        unsafe { (addr as *mut u8).write_bytes(0, count as usize * UNIT_SIZE) };
    }

    /// Takes the ghost snapshot of a from-region and makes it forwardable.
    pub fn prepare_forwardable_region(&self, region: &UnitInfo) {
        crate::heap_check!(
            region.is_from_region() && region.is_small_region(),
            "cannot forward {region:?}"
        );
        crate::heap_check!(
            !region.is_ghost_from_region(),
            "region {} is still a ghost",
            region.index
        );
        region.set_route_state(RouteState::Forwardable);
        region
            .role0
            .store(region.role.load(Ordering::Acquire), Ordering::Release);
        region
            .live_info0
            .store(region.live_info.load(Ordering::Acquire), Ordering::Release);
        region
            .region_end0
            .store(region.region_end(), Ordering::Release);
        region.route.reset();
        region.set_next0(region.next());

        let live = region.live_bytes() > 0;
        if live {
            region.set_flags(RegionFlags::IN_GHOST);
        }
        for sub in region.index + 1..region.index + region.unit_count() {
            let unit = self.unit(sub);
            unit.role0
                .store(UnitRole::Subordinate as u8, Ordering::Release);
            unit.owner0.store(region.index, Ordering::Release);
            if live {
                unit.set_flags(RegionFlags::IN_GHOST);
            }
        }
    }

    /// Ends the ghost life of a region routed in the previous cycle.
    pub fn dispel_ghost_from_region(&self, region: &UnitInfo) {
        region.set_route_state(RouteState::Normal);
        let units = (region.region_end0() - region.start) / UNIT_SIZE;
        self.clear_ghost_bits(region.index, units as UnitCount);
    }

    /// Clears the ghost bits over the current extent of `region`.
    pub fn clear_ghost_region_bit(&self, region: &UnitInfo) {
        self.clear_ghost_bits(region.index, region.unit_count());
    }

    fn clear_ghost_bits(&self, idx: UnitIndex, count: UnitCount) {
        for i in idx..idx + count {
            self.unit(i).clear_flags(RegionFlags::IN_GHOST);
        }
    }

    /// Iterates region heads in address order over `[0, end)`.
    pub fn for_each_region_until(&self, end: UnitIndex, mut f: impl FnMut(&UnitInfo)) {
        let mut idx = 0;
        while idx < end {
            let region = self.unit(idx);
            match region.role() {
                UnitRole::Subordinate => {
                    idx += 1;
                    continue;
                }
                UnitRole::Free => {}
                _ => f(region),
            }
            idx += region.unit_count().max(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mem_map::MemMap, object::BaseObject};

    fn create_test_table(units: usize) -> (MemMap, UnitTable) {
        let map = MemMap::map(units * UNIT_SIZE, "test-units").expect("map");
        let table = UnitTable::new(map.start(), units);
        (map, table)
    }

    #[test]
    fn test_subordinate_units_resolve_to_head() {
        let (map, table) = create_test_table(16);
        table.init_region(4, 3, UnitRole::Large);
        let head = table.unit(4);
        assert_eq!(head.unit_count(), 3);
        assert_eq!(head.region_size(), 3 * UNIT_SIZE);

        let inside = map.start() + 6 * UNIT_SIZE + 100;
        assert_eq!(table.region_at(inside).index(), 4);
        assert_eq!(table.unit(5).role(), UnitRole::Subordinate);

        table.init_free_units(4, 3);
        assert_eq!(table.region_at(inside).index(), 6);
        assert_eq!(table.unit(6).role(), UnitRole::Free);
    }

    #[test]
    fn test_bump_alloc_stops_at_region_end() {
        let (_map, table) = create_test_table(4);
        table.init_region(0, 1, UnitRole::Small);
        let region = table.unit(0);
        let a = region.alloc(1024);
        assert_eq!(a, region.start());
        assert_eq!(region.alloc(UNIT_SIZE - 1024), region.start() + 1024);
        assert_eq!(region.alloc(8), 0);
        assert_eq!(region.free_bytes(), 0);
    }

    #[test]
    fn test_ghost_snapshot_covers_all_units() {
        let (map, table) = create_test_table(8);
        table.init_region(2, 2, UnitRole::Small);
        let region = table.unit(2);
        region.set_region_type(RegionType::From);
        region.add_live_bytes(64);
        table.prepare_forwardable_region(region);

        assert_eq!(region.route_state(), RouteState::Forwardable);
        let addr = map.start() + 3 * UNIT_SIZE + 8;
        assert_eq!(table.ghost_region_at(addr).map(|r| r.index()), Some(2));

        // the live fields may move on without breaking the ghost lookup
        table.init_free_units(2, 2);
        assert_eq!(table.ghost_region_at(addr).map(|r| r.index()), Some(2));

        table.dispel_ghost_from_region(table.unit(2));
        assert!(table.ghost_region_at(addr).is_none());
        assert_eq!(table.unit(2).route_state(), RouteState::Normal);
    }

    #[test]
    fn test_visit_all_objects_walks_by_size() {
        let (_map, table) = create_test_table(2);
        table.init_region(0, 1, UnitRole::Small);
        let region = table.unit(0);
        let mut expected = Vec::new();
        for size in [16u32, 32, 24] {
            let addr = region.alloc(size as usize);
            // SAFETY: freshly allocated, zeroed memory
            unsafe { (*(addr as *const BaseObject)).init(size, 1) };
            expected.push(addr);
        }
        let mut seen = Vec::new();
        region.visit_all_objects(|obj| seen.push(obj.addr()));
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_route_splits_at_to1_used() {
        let (map, table) = create_test_table(4);
        let route = &table.unit(0).route;
        route.set(map.start() + 512, 256, 3);
        assert_eq!(route.route(0, &table), map.start() + 512);
        assert_eq!(route.route(255, &table), map.start() + 767);
        assert_eq!(route.route(256, &table), map.start() + 3 * UNIT_SIZE);
        assert_eq!(route.route(300, &table), map.start() + 3 * UNIT_SIZE + 44);
    }

    #[test]
    fn test_read_lock_only_on_from_regions() {
        let (_map, table) = create_test_table(2);
        table.init_region(0, 1, UnitRole::Small);
        let region = table.unit(0);
        region.set_region_type(RegionType::ThreadLocal);
        assert!(!region.try_lock_read_from_region());
        region.set_region_type(RegionType::From);
        assert!(region.try_lock_read_from_region());
        unsafe { region.unlock_read() };
        region.lock_write();
        assert!(!region.try_lock_read_from_region());
        unsafe { region.unlock_write() };
    }
}
