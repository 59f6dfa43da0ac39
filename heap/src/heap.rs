//! The heap facade.
//!
//! [`Heap`] owns the shared state of one region heap and its collector
//! thread. Every thread that touches objects registers through a
//! [`HeapProxy`], which is its mutator: it allocates from a thread-local
//! region and routes every reference access through the installed barrier.

use std::{
    fmt, io,
    ops::Deref,
    sync::{Arc, atomic::Ordering},
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;

use crate::{
    alloc_buffer::AllocBuffer,
    barrier::{Barrier, BarrierCx},
    collector,
    error::HeapError,
    gc_phase::GcPhase,
    gc_request::{GcReason, GcRequestTable},
    gc_stats::{GcClock, GcCounters, GcStats},
    gc_task::{GcTask, GcTaskQueue},
    gc_thread_pool::GcThreadPool,
    mem_map::MemMap,
    mutator::{Mutator, ScopedEnterSaferegion},
    mutator_manager::{MutatorManager, ScopedStopTheWorld},
    object::{ARRAY_HEADER_SIZE, GcTib, HEADER_SIZE, ObjectRef, RefField, TraceFn, align_object},
    region_manager::RegionManager,
    roots::{RootProvider, StaticRoots},
    satb_buffer::SatbBuffer,
    settings::HeapSettings,
};

/// Allocation retries with an asynchronous heuristic GC before a
/// synchronous out-of-memory GC is requested.
const ALLOC_RETRY_BOUND: usize = 8;

// ── HeapInner ─────────────────────────────────────────────────────────

/// Core shared heap state.
pub struct HeapInner {
    pub(crate) settings: HeapSettings,
    pub(crate) trace_fn: TraceFn,
    pub(crate) regions: RegionManager,
    pub(crate) satb: SatbBuffer,
    pub(crate) mutators: MutatorManager,
    pub(crate) static_roots: StaticRoots,
    pub(crate) pool: GcThreadPool,
    pub(crate) tasks: Arc<GcTaskQueue>,
    pub(crate) requests: GcRequestTable,
    pub(crate) clock: GcClock,
    pub(crate) counters: GcCounters,
    pub(crate) last_stats: Mutex<Option<GcStats>>,
    /// Objects handed over by mutators during root enumeration.
    pub(crate) root_set: Mutex<Vec<ObjectRef>>,
    /// Held by a cycle and by heap walks.
    pub(crate) cycle_lock: Mutex<()>,
    gc_thread: Mutex<Option<JoinHandle<()>>>,
}

// SAFETY: the shared state is atomics, locks and the heap mapping, which is
// only accessed through the region and barrier protocols.
unsafe impl Send for HeapInner {}
// SAFETY: see above.
unsafe impl Sync for HeapInner {}

impl HeapInner {
    fn new(settings: HeapSettings, trace_fn: TraceFn) -> Result<Self, HeapError> {
        settings.validate().map_err(HeapError::InvalidSettings)?;
        let settings = settings.sanitize();

        let map = Arc::new(MemMap::map(settings.heap_size, "kette-heap")?);
        let regions = RegionManager::new(map, &settings)?;
        log::info!(
            "heap of {} bytes in {} units, regions of {} bytes, {} gc threads",
            settings.heap_size,
            settings.unit_count(),
            regions.region_size(),
            settings.gc_threads
        );

        Ok(Self {
            satb: SatbBuffer::new(settings.satb_initial_pages)?,
            mutators: MutatorManager::new(settings.stw_timeout)?,
            static_roots: StaticRoots::new(),
            pool: GcThreadPool::new(settings.gc_threads)?,
            tasks: Arc::new(GcTaskQueue::new()),
            requests: GcRequestTable::new(&settings),
            clock: GcClock::new(),
            counters: GcCounters::default(),
            last_stats: Mutex::new(None),
            root_set: Mutex::new(Vec::new()),
            cycle_lock: Mutex::new(()),
            gc_thread: Mutex::new(None),
            regions,
            trace_fn,
            settings,
        })
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    /// Queues a request on behalf of a thread without a mutator. A
    /// synchronous request blocks until its cycle finished.
    pub fn request_gc(&self, reason: GcReason) {
        if reason.is_sync() {
            let index = self.tasks.enqueue_sync(GcTask::Invoke(reason), |a, b| a == b);
            self.tasks.wait_for_index(index);
        } else {
            self.tasks.enqueue_async(GcTask::Invoke(reason));
        }
    }

    /// Overrides the allocated bytes that trigger a heuristic collection
    /// until the next cycle recomputes them.
    pub fn set_gc_threshold(&self, bytes: usize) {
        self.regions.set_heu_threshold(bytes);
    }

    /// Whether a fault at `addr` hit the safepoint trap page.
    pub fn is_safepoint_trap(&self, addr: usize) -> bool {
        self.mutators.safepoint().is_trap(addr)
    }

    pub fn register_static_root(&self, field: &'static RefField) {
        self.static_roots.register(field);
    }

    pub fn unregister_static_root(&self, field: &'static RefField) {
        self.static_roots.unregister(field);
    }

    /// Stops every mutator until the guard is dropped. The calling thread
    /// must not be a running mutator.
    pub fn stop_the_world(&self, reason: &'static str) -> ScopedStopTheWorld<'_> {
        ScopedStopTheWorld::new(&self.mutators, reason)
    }

    pub fn visit_all_mutators(&self, f: impl FnMut(&Mutator)) {
        self.mutators.for_each_mutator(f);
    }

    pub fn gc_phase(&self) -> GcPhase {
        self.mutators.gc_phase()
    }

    /// Calls `f` on every allocated object, dead ones included, with the
    /// world stopped. The calling thread must not be a running mutator.
    pub fn for_each_object(&self, f: impl FnMut(ObjectRef)) {
        let _cycle = self.cycle_lock.lock();
        let _stw = ScopedStopTheWorld::new(&self.mutators, "heap walk");
        self.regions.for_each_object(f);
    }

    /// Bytes of all regions in use.
    pub fn allocated_bytes(&self) -> usize {
        self.regions.allocated_size()
    }

    pub fn free_bytes(&self) -> usize {
        self.regions.free_unit_count() * crate::region_info::UNIT_SIZE
    }

    pub fn gc_count(&self) -> usize {
        self.counters.gc_count.load(Ordering::Relaxed)
    }

    pub fn gc_total_time_us(&self) -> u64 {
        self.counters.gc_total_time_us.load(Ordering::Relaxed)
    }

    pub fn gc_collected_total_bytes(&self) -> usize {
        self.counters
            .gc_collected_total_bytes
            .load(Ordering::Relaxed)
    }

    pub fn last_gc_stats(&self) -> Option<GcStats> {
        self.last_stats.lock().clone()
    }
}

impl fmt::Debug for HeapInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapInner")
            .field("settings", &self.settings)
            .field("phase", &self.mutators.gc_phase())
            .field("mutators", &self.mutators.mutator_count())
            .field("allocated", &self.regions.allocated_size())
            .finish_non_exhaustive()
    }
}

impl Drop for HeapInner {
    fn drop(&mut self) {
        self.tasks.enqueue_async(GcTask::Terminate);
    }
}

// ── Heap (Arc wrapper) ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Heap(Arc<HeapInner>);

impl Heap {
    /// Maps the heap and starts its collector thread.
    pub fn new(settings: HeapSettings, trace_fn: TraceFn) -> Result<Self, HeapError> {
        let inner = Arc::new(HeapInner::new(settings, trace_fn)?);
        let weak = Arc::downgrade(&inner);
        let tasks = Arc::clone(&inner.tasks);
        let backup = inner.settings.backup_gc_interval;
        let handle = thread::Builder::new()
            .name("kette-gc".into())
            .spawn(move || collector::gc_thread_main(weak, tasks, backup))
            .map_err(HeapError::ThreadSpawn)?;
        *inner.gc_thread.lock() = Some(handle);
        Ok(Self(inner))
    }

    /// Registers the calling thread as a mutator whose roots `roots`
    /// supplies.
    #[must_use]
    pub fn proxy(&self, roots: Arc<dyn RootProvider>) -> HeapProxy {
        HeapProxy::new(self.clone(), roots)
    }

    /// Stops the collector thread and waits for it. Pending requests are
    /// dropped; the heap stays usable for allocation without collection.
    pub fn fini(&self) {
        self.tasks.enqueue_async(GcTask::Terminate);
        let handle = self.gc_thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("gc thread panicked");
            }
        }
    }

    /// Writes a description of the heap and everything reachable from the
    /// roots. The calling thread must not be a running mutator.
    pub fn dump_heap(&self, out: &mut dyn io::Write) -> io::Result<()> {
        crate::heap_dump::dump_heap(&self.0, out)
    }

    /// Bytes of the objects reachable from the roots, measured with the
    /// world stopped. The calling thread must not be a running mutator.
    pub fn reachable_bytes(&self) -> usize {
        crate::heap_dump::reachable_bytes(&self.0)
    }
}

impl Deref for Heap {
    type Target = HeapInner;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ── HeapProxy (mutator side) ──────────────────────────────────────────

/// A registered mutator.
///
/// Owns the thread-local allocation buffer and answers the collector's
/// phase handshakes at its safepoints: allocation, explicit
/// [`HeapProxy::safepoint`] calls, and leaving a safe region. Values passed
/// to and returned from the access methods are always resolved, untagged
/// references.
pub struct HeapProxy {
    heap: Heap,
    mutator: Arc<Mutator>,
    buffer: AllocBuffer,
}

impl HeapProxy {
    fn new(heap: Heap, roots: Arc<dyn RootProvider>) -> Self {
        let mutator = heap.mutators.create_mutator(roots);
        mutator.leave_saferegion(&*heap);
        Self {
            heap,
            mutator,
            buffer: AllocBuffer::new(),
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn mutator(&self) -> &Mutator {
        &self.mutator
    }

    /// Answers pending collector requests.
    #[inline(always)]
    pub fn safepoint(&self) {
        if self.mutator.has_any_suspension_request() {
            self.handle_suspension_request();
        }
    }

    #[cold]
    #[inline(never)]
    fn handle_suspension_request(&self) {
        self.mutator.handle_suspension_request(&*self.heap);
    }

    /// Declares that the thread will not touch the heap until
    /// [`HeapProxy::leave_saferegion`].
    pub fn enter_saferegion(&self) {
        self.mutator.enter_saferegion();
    }

    pub fn leave_saferegion(&self) {
        self.mutator.leave_saferegion(&*self.heap);
    }

    /// Hands the current allocation region to the collector.
    pub fn retire_region(&mut self) {
        self.buffer.clear(&self.heap.regions);
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Allocates a zeroed object of `size` bytes, header included.
    #[inline]
    pub fn new_object(&mut self, type_id: u16, size: usize) -> Result<ObjectRef, HeapError> {
        self.allocate(type_id, size, false)
    }

    /// Allocates a zeroed array of `count` elements of `width` bytes. The
    /// length word follows the header.
    pub fn new_array(
        &mut self,
        type_id: u16,
        count: usize,
        width: usize,
    ) -> Result<ObjectRef, HeapError> {
        let size = count
            .checked_mul(width)
            .and_then(|n| n.checked_add(ARRAY_HEADER_SIZE))
            .ok_or(HeapError::OutOfMemory { requested: usize::MAX })?;
        let obj = self.allocate(type_id, size, false)?;
        // SAFETY: the length word lies inside the fresh object
        unsafe { *((obj.addr() + HEADER_SIZE) as *mut u64) = count as u64 };
        Ok(obj)
    }

    /// Allocates an object that is never moved.
    pub fn new_pinned(&mut self, type_id: u16, size: usize) -> Result<ObjectRef, HeapError> {
        self.allocate(type_id, size, true)
    }

    #[inline(always)]
    fn allocate(&mut self, type_id: u16, size: usize, pinned: bool) -> Result<ObjectRef, HeapError> {
        let size = align_object(size.max(HEADER_SIZE));
        if u32::try_from(size).is_err() {
            return Err(HeapError::OutOfMemory { requested: size });
        }
        let mut addr = self.try_allocate(size, pinned);
        if addr == 0 {
            addr = self.allocate_slow(size, pinned)?;
        }
        Ok(self.init_object(addr, size, type_id))
    }

    #[inline(always)]
    fn try_allocate(&mut self, size: usize, pinned: bool) -> usize {
        let phase = self.mutator.phase();
        let regions = &self.heap.regions;
        if pinned {
            regions.alloc_pinned(size, phase)
        } else if size >= regions.large_object_threshold() {
            regions.alloc_large(size, phase)
        } else {
            self.buffer.alloc(regions, size, phase)
        }
    }

    #[cold]
    #[inline(never)]
    fn allocate_slow(&mut self, size: usize, pinned: bool) -> Result<usize, HeapError> {
        for _ in 0..ALLOC_RETRY_BOUND {
            self.safepoint();
            let addr = self.try_allocate(size, pinned);
            if addr != 0 {
                return Ok(addr);
            }
            self.heap.tasks.enqueue_async(GcTask::Invoke(GcReason::Heu));
            let _safe = ScopedEnterSaferegion::new(&self.mutator, &*self.heap);
            thread::yield_now();
        }

        log::debug!("allocation of {size} bytes failed, requesting oom gc");
        self.request_gc(GcReason::Oom);
        match self.try_allocate(size, pinned) {
            0 => {
                log::warn!("out of memory allocating {size} bytes");
                Err(HeapError::OutOfMemory { requested: size })
            }
            addr => Ok(addr),
        }
    }

    fn init_object(&mut self, addr: usize, size: usize, type_id: u16) -> ObjectRef {
        let obj = ObjectRef::from_addr(addr);
        // SAFETY: `addr` is a fresh allocation of `size` bytes; its size
        // fits the header, checked in `allocate`
        unsafe { obj.header().init(size as u32, type_id) };
        if self.mutator.phase().is_marking() {
            self.heap.regions.mark_object(obj);
        }
        if self.heap.regions.take_heu_request() {
            self.heap.tasks.enqueue_async(GcTask::Invoke(GcReason::Heu));
        }
        obj
    }

    // ── Collector control ─────────────────────────────────────────────

    /// Requests a collection. A synchronous request parks this mutator in
    /// a safe region until the cycle finished.
    pub fn request_gc(&mut self, reason: GcReason) {
        if !reason.is_sync() {
            self.heap.tasks.enqueue_async(GcTask::Invoke(reason));
            return;
        }
        let index = self
            .heap
            .tasks
            .enqueue_sync(GcTask::Invoke(reason), |a, b| a == b);
        let _safe = ScopedEnterSaferegion::new(&self.mutator, &*self.heap);
        self.heap.tasks.wait_for_index(index);
    }

    /// Pins `obj` and returns the start of its array data. Native code may
    /// use the pointer until [`HeapProxy::release_raw_data`].
    pub fn acquire_raw_data(&self, obj: ObjectRef) -> *mut u8 {
        self.mutator.push_raw_object(obj);
        self.heap
            .regions
            .add_raw_pointer_object(obj, self.mutator.phase());
        obj.array_data()
    }

    pub fn release_raw_data(&self, obj: ObjectRef) {
        match self.mutator.pop_raw_object(obj) {
            Some(current) => self.heap.regions.remove_raw_pointer_object(current),
            None => crate::fatal!("raw data of {:#x} released twice", obj.addr()),
        }
    }

    // ── Reference access ──────────────────────────────────────────────

    #[inline(always)]
    fn cx(&self) -> BarrierCx<'_> {
        BarrierCx::new(&self.heap, &self.mutator)
    }

    #[inline(always)]
    fn barrier(&self) -> &'static dyn Barrier {
        self.heap.mutators.barrier_kind().barrier()
    }

    /// Loads the reference in `field` of `obj`.
    #[inline]
    pub fn read_ref(&self, obj: ObjectRef, field: &RefField) -> ObjectRef {
        self.barrier().read_ref_field(self.cx(), obj, field)
    }

    /// Loads a weak reference; null once its referent was found dead.
    #[inline]
    pub fn read_weak_ref(&self, obj: ObjectRef, field: &RefField) -> ObjectRef {
        self.barrier().read_weak_ref(self.cx(), obj, field)
    }

    #[inline]
    pub fn write_ref(&self, obj: ObjectRef, field: &RefField, new: ObjectRef) {
        self.barrier().write_ref_field(self.cx(), obj, field, new);
    }

    #[inline]
    pub fn read_static_ref(&self, field: &RefField) -> ObjectRef {
        self.barrier().read_static_ref(self.cx(), field)
    }

    #[inline]
    pub fn write_static_ref(&self, field: &RefField, new: ObjectRef) {
        self.barrier().write_static_ref(self.cx(), field, new);
    }

    pub fn atomic_read_ref(&self, obj: ObjectRef, field: &RefField, order: Ordering) -> ObjectRef {
        self.barrier().atomic_read_ref(self.cx(), obj, field, order)
    }

    pub fn atomic_write_ref(&self, obj: ObjectRef, field: &RefField, new: ObjectRef, order: Ordering) {
        self.barrier()
            .atomic_write_ref(self.cx(), obj, field, new, order);
    }

    pub fn atomic_swap_ref(
        &self,
        obj: ObjectRef,
        field: &RefField,
        new: ObjectRef,
        order: Ordering,
    ) -> ObjectRef {
        self.barrier()
            .atomic_swap_ref(self.cx(), obj, field, new, order)
    }

    pub fn compare_and_swap_ref(
        &self,
        obj: ObjectRef,
        field: &RefField,
        old: ObjectRef,
        new: ObjectRef,
        success: Ordering,
        failure: Ordering,
    ) -> bool {
        self.barrier()
            .compare_and_swap_ref(self.cx(), obj, field, old, new, success, failure)
    }

    /// Copies `len` bytes of reference elements between two arrays.
    ///
    /// # Safety
    /// Both ranges must be reference slots inside their objects.
    pub unsafe fn copy_ref_array(
        &self,
        dst_obj: ObjectRef,
        dst: *mut u8,
        src_obj: ObjectRef,
        src: *const u8,
        len: usize,
    ) {
        // SAFETY: guaranteed by caller
        unsafe {
            self.barrier()
                .copy_ref_array(self.cx(), dst_obj, dst, src_obj, src, len)
        };
    }

    /// Copies `len` bytes of struct elements laid out as `tib`.
    ///
    /// # Safety
    /// Both ranges must hold whole elements inside their objects.
    pub unsafe fn copy_struct_array(
        &self,
        dst_obj: ObjectRef,
        dst: *mut u8,
        src_obj: ObjectRef,
        src: *const u8,
        len: usize,
        tib: &GcTib,
    ) {
        // SAFETY: guaranteed by caller
        unsafe {
            self.barrier()
                .copy_struct_array(self.cx(), dst_obj, dst, src_obj, src, len, tib)
        };
    }

    /// Copies an inline struct out of `obj` into `dst`.
    ///
    /// # Safety
    /// See [`Barrier::read_struct`].
    pub unsafe fn read_struct(
        &self,
        dst: *mut u8,
        obj: ObjectRef,
        src: *const u8,
        len: usize,
        tib: &GcTib,
    ) {
        // SAFETY: guaranteed by caller
        unsafe { self.barrier().read_struct(self.cx(), dst, obj, src, len, tib) };
    }

    /// Copies an inline struct from `src` into `obj`.
    ///
    /// # Safety
    /// See [`Barrier::write_struct`].
    pub unsafe fn write_struct(
        &self,
        obj: ObjectRef,
        dst: *mut u8,
        src: *const u8,
        len: usize,
        tib: &GcTib,
    ) {
        // SAFETY: guaranteed by caller
        unsafe { self.barrier().write_struct(self.cx(), obj, dst, src, len, tib) };
    }

    /// Stores the payload of the boxed value `src` into `obj`.
    ///
    /// # Safety
    /// See [`Barrier::write_generic`].
    pub unsafe fn write_generic(
        &self,
        obj: ObjectRef,
        field: *mut u8,
        src: ObjectRef,
        len: usize,
        tib: &GcTib,
    ) {
        // SAFETY: guaranteed by caller
        unsafe {
            self.barrier()
                .write_generic(self.cx(), obj, field, src, len, tib)
        };
    }

    /// Loads a value out of `obj` into the payload of the boxed value `dst`.
    ///
    /// # Safety
    /// See [`Barrier::read_generic`].
    pub unsafe fn read_generic(
        &self,
        dst: ObjectRef,
        obj: ObjectRef,
        field: *const u8,
        len: usize,
        tib: &GcTib,
    ) {
        // SAFETY: guaranteed by caller
        unsafe {
            self.barrier()
                .read_generic(self.cx(), dst, obj, field, len, tib)
        };
    }
}

impl fmt::Debug for HeapProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapProxy")
            .field("mutator", &self.mutator.id())
            .field("phase", &self.mutator.phase())
            .finish_non_exhaustive()
    }
}

impl Drop for HeapProxy {
    fn drop(&mut self) {
        self.buffer.clear(&self.heap.regions);
        self.heap
            .mutators
            .destroy_mutator(&self.mutator, &self.heap.satb);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
