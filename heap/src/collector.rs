//! The collection cycle.
//!
//! One thread, `kette-gc`, drives every cycle through its phases: it
//! handshakes the mutators into each phase, marks on the worker pool while
//! they keep running, and then evacuates the from-space. The helpers at the
//! top are shared with the barriers, which resolve and tag reference words
//! on the mutator side of the same protocol.

use std::{
    mem,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use crate::{
    gc_phase::GcPhase,
    gc_request::GcReason,
    gc_stats::{GcClock, GcStats, compute_heap_threshold},
    gc_task::{ASYNC_TASK_INDEX, GcTask, GcTaskQueue, TASK_INDEX_FOR_EXIT},
    heap::HeapInner,
    mutator::{GcPhaseHandler, Mutator},
    mutator_manager::{MutatorManager, ScopedLightSync, ScopedStopTheWorld},
    object::{ObjectRef, RefField, RefWord},
    region_info::RegionType,
    satb_buffer::SatbBuffer,
};

/// A marking task never starts with fewer roots than this.
const MIN_ROOTS_PER_TASK: usize = 8;
/// Past this depth a marking task hands half of its stack to a new task.
const MARK_STACK_SPILL: usize = 128;

// ── Reference words ───────────────────────────────────────────────────

impl HeapInner {
    /// Tag of the running (or next) cycle.
    #[inline(always)]
    pub(crate) fn tag_id(&self) -> u8 {
        self.regions.forward_data().tag_id()
    }

    #[inline(always)]
    pub(crate) fn is_current_pointer(&self, word: RefWord) -> bool {
        word.is_tagged() && word.tag_id() == self.tag_id()
    }

    #[inline(always)]
    pub(crate) fn is_old_pointer(&self, word: RefWord) -> bool {
        word.is_tagged() && word.tag_id() != self.tag_id()
    }

    #[inline(always)]
    pub(crate) fn is_heap_object(&self, obj: ObjectRef) -> bool {
        !obj.is_null() && self.regions.is_heap_address(obj.addr())
    }

    /// The word to store for `obj`: tagged if it lives in from-space.
    #[inline]
    pub(crate) fn get_and_try_tag(&self, obj: ObjectRef) -> RefWord {
        if self.is_heap_object(obj) && self.regions.is_in_from_region(obj) {
            RefWord::tagged(obj, self.tag_id())
        } else {
            RefWord::untagged(obj)
        }
    }

    /// The to-version of `obj` if its ghost region was routed, else `obj`.
    /// Only valid for referents of tagged words.
    #[inline]
    pub(crate) fn find_latest_version(&self, obj: ObjectRef) -> ObjectRef {
        let to = self.regions.find_to_version(obj);
        if to.is_null() { obj } else { to }
    }

    #[inline]
    pub(crate) fn decode_latest(&self, word: RefWord) -> ObjectRef {
        if self.is_old_pointer(word) {
            self.find_latest_version(word.target())
        } else {
            word.target()
        }
    }

    /// Replaces a tagged `word` by its untagged to-version. `None` if the
    /// referent was not moved or another thread changed the slot.
    pub(crate) fn try_update_ref_field(&self, field: &RefField, word: RefWord) -> Option<ObjectRef> {
        if !word.is_tagged() {
            return Some(word.target());
        }
        let to = self.regions.find_to_version(word.target());
        if to.is_null() {
            return None;
        }
        field
            .compare_exchange(word, RefWord::untagged(to))
            .then_some(to)
    }

    /// Forwards the referent of a tagged `word` and republishes it
    /// untagged. `None` if another thread changed the slot first.
    pub(crate) fn try_forward_ref_field(&self, field: &RefField, word: RefWord) -> Option<ObjectRef> {
        if !word.is_tagged() {
            return Some(word.target());
        }
        let to = self.regions.forward_object(word.target());
        field
            .compare_exchange(word, RefWord::untagged(to))
            .then_some(to)
    }

    pub(crate) fn try_untag_ref_field(&self, field: &RefField, word: RefWord) -> Option<ObjectRef> {
        if !word.is_tagged() {
            return Some(word.target());
        }
        let obj = word.target();
        field
            .compare_exchange(word, RefWord::untagged(obj))
            .then_some(obj)
    }

    /// Whether `obj` lies in a from-region that was kept out of
    /// evacuation.
    pub(crate) fn is_unmovable_from_object(&self, obj: ObjectRef) -> bool {
        if !self.is_heap_object(obj) {
            return false;
        }
        let units = self.regions.units();
        if units.ghost_region_at(obj.addr()).is_some() {
            return false;
        }
        units.region_at(obj.addr()).is_unmovable_from_region()
    }

    /// Whether marking is over for `obj` without reaching it.
    pub(crate) fn is_dead_candidate(&self, obj: ObjectRef) -> bool {
        if !self.is_heap_object(obj) {
            return false;
        }
        let region = self.regions.units().region_at(obj.addr());
        match region.region_type() {
            RegionType::Garbage => true,
            RegionType::From
            | RegionType::LoneFrom
            | RegionType::UnmovableFrom
            | RegionType::RawPointerPinned
            | RegionType::Large
            | RegionType::FullPinned => !region.is_survived_object(obj),
            _ => false,
        }
    }
}

// ── Marking ───────────────────────────────────────────────────────────

impl HeapInner {
    /// Resolves the slot, tags it for this cycle and pushes its referent if
    /// this is the first time it is reached.
    fn trace_ref_field(&self, field: &RefField, stack: &mut Vec<ObjectRef>) {
        let word = field.load(Ordering::Acquire);
        let latest = self.decode_latest(word);
        if !self.is_heap_object(latest) {
            return;
        }
        let tagged = self.get_and_try_tag(latest);
        if tagged != word {
            // a failed exchange means a mutator stored a newer value
            let _ = field.compare_exchange(word, tagged);
        }
        if !self.regions.mark_object(latest) {
            stack.push(latest);
        }
    }

    #[inline]
    fn trace_object(&self, obj: ObjectRef, stack: &mut Vec<ObjectRef>) {
        // SAFETY: only marked, live objects are pushed
        unsafe { (self.trace_fn)(obj, &mut |field| self.trace_ref_field(field, stack)) };
    }

    fn spawn_mark_task(self: &Arc<Self>, stack: Vec<ObjectRef>) {
        let heap = Arc::clone(self);
        self.pool
            .add_work(Box::new(move |_| heap.drain_mark_stack(stack)));
    }

    fn drain_mark_stack(self: &Arc<Self>, mut stack: Vec<ObjectRef>) {
        while let Some(obj) = stack.pop() {
            self.trace_object(obj, &mut stack);
            if stack.len() > MARK_STACK_SPILL {
                let half = stack.split_off(stack.len() / 2);
                self.spawn_mark_task(half);
            }
        }
    }

    /// Traces everything reachable from `gray`, whose objects are marked
    /// already, and returns once the pool ran dry.
    fn mark_in_parallel(self: &Arc<Self>, gray: Vec<ObjectRef>) {
        if gray.is_empty() {
            return;
        }
        let tasks = self.pool.thread_count() + 1;
        let chunk = gray.len().div_ceil(tasks).max(MIN_ROOTS_PER_TASK);
        for part in gray.chunks(chunk) {
            self.spawn_mark_task(part.to_vec());
        }
        self.pool.start();
        self.pool.wait_finish();
    }

    /// Everything the mutators remembered so far that is not marked yet.
    /// The returned objects are marked.
    fn take_satb_objects(&self) -> Vec<ObjectRef> {
        let mut objects = Vec::new();
        self.mutators
            .for_each_mutator(|m| m.drain_satb_node(&mut objects));
        self.satb.get_retired_objects(&mut objects);
        objects.retain(|&obj| self.is_heap_object(obj) && !self.regions.mark_object(obj));
        objects
    }

    /// Drains SATB until it stays empty across a retirement of every
    /// mutator's node.
    fn drain_satb_until_stable(self: &Arc<Self>) {
        let mut retired = false;
        loop {
            let pending = self.take_satb_objects();
            if !pending.is_empty() {
                log::trace!("satb remark of {} objects", pending.len());
                self.mark_in_parallel(pending);
                continue;
            }
            if retired {
                return;
            }
            self.mutators
                .transition_all_mutators_to_gc_phase(GcPhase::ClearSatbBuffer, &**self);
            retired = true;
        }
    }

    /// Marks what is left in SATB. Mutators must not remember anymore.
    fn mark_remaining_satb(self: &Arc<Self>) {
        loop {
            let pending = self.take_satb_objects();
            if pending.is_empty() {
                return;
            }
            self.mark_in_parallel(pending);
        }
    }

    fn mark(self: &Arc<Self>, reason: GcReason) {
        let stw = (!reason.is_concurrent())
            .then(|| ScopedStopTheWorld::new(&self.mutators, "marking"));

        self.root_set.lock().clear();
        self.mutators
            .transition_all_mutators_to_gc_phase(GcPhase::Enum, &**self);
        let mut roots = mem::take(&mut *self.root_set.lock());
        roots.retain(|&obj| !self.regions.mark_object(obj));
        self.static_roots
            .visit(|field| self.trace_ref_field(field, &mut roots));
        log::debug!("{} roots to trace", roots.len());

        self.regions.prepare_trace();
        self.mutators
            .transition_all_mutators_to_gc_phase(GcPhase::Trace, &**self);
        self.mark_in_parallel(roots);
        self.drain_satb_until_stable();

        match stw {
            Some(stw) => {
                self.mark_remaining_satb();
                self.mutators
                    .transition_all_mutators_to_gc_phase(GcPhase::PostTrace, &**self);
                drop(stw);
            }
            None => {
                let _sync = ScopedLightSync::new(&**self, GcPhase::PostTrace, "final mark");
                self.mark_remaining_satb();
            }
        }
    }
}

// ── Cycle ─────────────────────────────────────────────────────────────

impl HeapInner {
    /// Runs one full cycle on the calling thread.
    pub(crate) fn run_gc_cycle(self: &Arc<Self>, reason: GcReason, is_async: bool) {
        let _cycle = self.cycle_lock.lock();
        let start = self.clock.now();
        self.counters
            .prev_gc_start_ns
            .store(start, Ordering::Relaxed);
        let mut stats = GcStats::new(reason, is_async, start);
        stats.live_bytes_before = self.regions.allocated_size();
        log::info!(
            "gc cycle for {reason} started, {} bytes allocated",
            stats.live_bytes_before
        );

        self.satb.init();
        self.regions.assemble_small_garbage_candidates();
        self.regions.assemble_large_garbage_candidates();
        self.regions.assemble_pinned_garbage_candidates();
        stats.from_space_size = self.regions.from_space_size();
        stats.large_space_size = self.regions.large_space_size();
        stats.pinned_space_size = self.regions.pinned_space_size();

        self.mark(reason);
        self.sweep(&mut stats);
        self.evacuate(&mut stats);
        self.finish_cycle(reason, stats);
    }

    /// Post-trace work: drops what marking found dead and snapshots the
    /// from-space for forwarding.
    fn sweep(&self, stats: &mut GcStats) {
        self.regions.handle_trace_regions();
        self.satb.clear_buffer();
        stats.large_garbage_size = self.regions.collect_large_garbage();
        stats.pinned_garbage_size = self.regions.collect_pinned_garbage();
        let exempt = self.regions.exempt_from_regions();
        stats.small_garbage_size = exempt.garbage_bytes;
        self.regions.prepare_forward_table();
    }

    fn forward_static_root(&self, field: &RefField) {
        loop {
            let word = field.load(Ordering::Acquire);
            if !word.is_tagged() {
                return;
            }
            let target = word.target();
            let to = if self.is_unmovable_from_object(target) {
                target
            } else {
                self.regions.forward_object(target)
            };
            if field.compare_exchange(word, RefWord::untagged(to)) {
                return;
            }
        }
    }

    fn evacuate(self: &Arc<Self>, stats: &mut GcStats) {
        {
            let _sync = ScopedLightSync::new(&**self, GcPhase::PreForward, "preforward");
        }
        self.static_roots
            .visit(|field| self.forward_static_root(field));

        self.mutators
            .transition_all_mutators_to_gc_phase(GcPhase::Forward, &**self);
        let collected = Arc::new(AtomicUsize::new(0));
        for _ in 0..=self.pool.thread_count() {
            let heap = Arc::clone(self);
            let collected = Arc::clone(&collected);
            self.pool.add_work(Box::new(move |_| {
                let mut bytes = 0;
                while let Some(region) = heap.regions.take_from_region() {
                    bytes += heap.regions.forward_region(region);
                }
                collected.fetch_add(bytes, Ordering::Relaxed);
            }));
        }
        self.pool.start();
        self.pool.wait_finish();
        self.regions.finish_forwarding();
        stats.small_garbage_size += collected.load(Ordering::Relaxed);
    }

    fn finish_cycle(&self, reason: GcReason, mut stats: GcStats) {
        self.mutators
            .transition_all_mutators_to_gc_phase(GcPhase::ReclaimSatbNode, self);
        self.satb.reclaim_all_pages();
        self.mutators
            .transition_all_mutators_to_gc_phase(GcPhase::Idle, self);
        let tag = self.tag_id();
        self.regions.forward_data().set_tag_id(tag ^ 1);

        self.regions
            .reclaim_garbage_memory(reason == GcReason::Oom, self.settings.heap_utilization);
        self.regions
            .forward_data()
            .unbind_previous_live_info(self.regions.units());

        let allocated = self.regions.allocated_size();
        stats.live_bytes_after = allocated;
        stats.heap_threshold = compute_heap_threshold(
            allocated,
            self.settings.heap_utilization,
            self.settings.heap_growth,
            self.settings.heap_size,
        );
        self.regions.set_heu_threshold(stats.heap_threshold);
        stats.finish(self.clock.now());
        self.counters
            .prev_gc_finish_ns
            .store(stats.gc_end_ns, Ordering::Relaxed);
        self.counters.record_cycle(&stats);
        stats.dump(allocated, self.settings.heap_size);
        *self.last_stats.lock() = Some(stats);

        self.mutators.destroy_expired_mutators(&self.satb);
    }
}

impl GcPhaseHandler for HeapInner {
    fn mutator_manager(&self) -> &MutatorManager {
        &self.mutators
    }

    fn satb_buffer(&self) -> &SatbBuffer {
        &self.satb
    }

    fn enumerate_mutator_roots(&self, mutator: &Mutator) {
        let mut found = Vec::new();
        mutator.visit_roots(&mut |slot| {
            if self.is_heap_object(*slot) {
                found.push(*slot);
            }
        });
        self.root_set.lock().extend(found);
    }

    fn forward_mutator_roots(&self, mutator: &Mutator) {
        mutator.visit_roots(&mut |slot| {
            if self.is_heap_object(*slot) {
                *slot = self.regions.forward_object(*slot);
            }
        });
    }
}

// ── GC thread ─────────────────────────────────────────────────────────

impl HeapInner {
    fn invoke_gc(self: &Arc<Self>, reason: GcReason, index: u64) {
        let now = self.clock.now();
        if self
            .requests
            .check_and_record(reason, now, self.counters.prev_gc_finish())
        {
            log::debug!(
                "gc request for {reason} ignored, within {:?} of the last one",
                self.requests.min_interval(reason)
            );
        } else {
            self.tasks.set_gc_started();
            self.run_gc_cycle(reason, index == ASYNC_TASK_INDEX);
        }
        self.tasks.notify_finished(index);
    }

    fn run_backup_gc(self: &Arc<Self>, interval: Duration) {
        let now = self.clock.now();
        let last = self
            .counters
            .prev_gc_finish()
            .max(self.counters.prev_gc_start());
        let idle_since = if last == GcClock::NEVER { 0 } else { last };
        if Duration::from_nanos(now.saturating_sub(idle_since)) >= interval {
            self.invoke_gc(GcReason::Backup, ASYNC_TASK_INDEX);
        }
    }
}

/// Body of the `kette-gc` thread. It only holds the heap while a task
/// runs, so dropping the last [`crate::Heap`] ends the loop.
pub(crate) fn gc_thread_main(heap: Weak<HeapInner>, tasks: Arc<GcTaskQueue>, backup: Duration) {
    log::debug!("gc thread started");
    loop {
        let (task, index) = tasks.dequeue(backup);
        let Some(heap) = heap.upgrade() else {
            break;
        };
        match task {
            GcTask::Terminate => break,
            GcTask::Timeout => heap.run_backup_gc(backup),
            GcTask::Invoke(reason) => heap.invoke_gc(reason, index),
        }
    }
    tasks.clear();
    tasks.notify_finished(TASK_INDEX_FOR_EXIT);
    log::debug!("gc thread exits");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        barrier::tests::{NODE_SIZE, create_test_env, make_from_space},
        gc_request::GcReason,
        object::{HEADER_SIZE, RefField},
    };

    const PAYLOAD: usize = HEADER_SIZE + 16;

    fn payload(obj: ObjectRef) -> u64 {
        // SAFETY: test nodes carry a payload word after their two slots
        unsafe { *((obj.addr() + PAYLOAD) as *const u64) }
    }

    fn set_payload(obj: ObjectRef, value: u64) {
        // SAFETY: see above
        unsafe { *((obj.addr() + PAYLOAD) as *mut u64) = value };
    }

    #[test]
    fn test_tagging_follows_from_space() {
        let (heap, mut proxy, _roots) = create_test_env();
        let obj = proxy.new_object(1, NODE_SIZE).expect("object");
        assert_eq!(heap.get_and_try_tag(obj), RefWord::untagged(obj));
        make_from_space(&heap, &mut proxy);

        let word = heap.get_and_try_tag(obj);
        assert_eq!(word, RefWord::tagged(obj, heap.tag_id()));
        assert!(heap.is_current_pointer(word));
        assert!(!heap.is_old_pointer(word));
        assert_eq!(heap.decode_latest(word), obj);

        let stale = RefWord::tagged(obj, heap.tag_id() ^ 1);
        assert!(heap.is_old_pointer(stale));
        // no ghost region knows the object, so it did not move
        assert_eq!(heap.decode_latest(stale), obj);

        assert_eq!(heap.get_and_try_tag(ObjectRef::NULL), RefWord::NULL);
        assert!(!heap.is_heap_object(ObjectRef::from_addr(0x10)));
    }

    #[test]
    fn test_untag_and_update_slots() {
        let (heap, mut proxy, _roots) = create_test_env();
        let obj = proxy.new_object(1, NODE_SIZE).expect("object");
        make_from_space(&heap, &mut proxy);

        let field = RefField::new(RefWord::tagged(obj, heap.tag_id()));
        let word = field.word();
        // nothing routed, so there is no to-version to update to
        assert_eq!(heap.try_update_ref_field(&field, word), None);
        assert_eq!(heap.try_untag_ref_field(&field, word), Some(obj));
        assert_eq!(field.word(), RefWord::untagged(obj));
        // a stale expected word loses
        assert_eq!(heap.try_untag_ref_field(&field, word), None);
    }

    #[test]
    fn test_dead_candidates_after_marking() {
        let (heap, mut proxy, _roots) = create_test_env();
        let live = proxy.new_object(1, NODE_SIZE).expect("live");
        let dead = proxy.new_object(1, NODE_SIZE).expect("dead");
        make_from_space(&heap, &mut proxy);
        let fresh = proxy.new_object(1, NODE_SIZE).expect("fresh");

        assert!(!heap.regions.mark_object(live));
        assert!(!heap.is_dead_candidate(live));
        assert!(heap.is_dead_candidate(dead));
        assert!(!heap.is_dead_candidate(fresh));
        assert!(!heap.is_dead_candidate(ObjectRef::NULL));
    }

    #[test]
    fn test_sync_gc_keeps_reachable_list() {
        let (heap, mut proxy, roots) = create_test_env();
        let head = proxy.new_object(1, NODE_SIZE).expect("head");
        set_payload(head, 0);
        let slot = roots.push(head);
        let mut tail = head;
        for i in 1..200u64 {
            let node = proxy.new_object(1, NODE_SIZE).expect("node");
            set_payload(node, i);
            // SAFETY: nodes have a slot after the header
            proxy.write_ref(tail, unsafe { tail.field(HEADER_SIZE) }, node);
            tail = node;
            // unreachable filler
            proxy.new_object(2, NODE_SIZE).expect("garbage");
        }
        proxy.retire_region();

        proxy.request_gc(GcReason::User);
        proxy.request_gc(GcReason::User);
        assert!(heap.gc_count() >= 2);

        let mut node = roots.get(slot);
        for i in 0..200u64 {
            assert!(!node.is_null(), "list broken at {i}");
            assert_eq!(payload(node), i);
            // SAFETY: see above
            node = proxy.read_ref(node, unsafe { node.field(HEADER_SIZE) });
        }
        assert!(node.is_null());

        let stats = heap.last_gc_stats().expect("stats");
        assert_eq!(stats.reason, GcReason::User);
        assert!(!stats.is_async);
        assert!(heap.gc_collected_total_bytes() > 0);
    }

    #[test]
    fn test_static_root_survives_and_is_forwarded() {
        static SLOT: RefField = RefField::new(RefWord::NULL);
        let (heap, mut proxy, _roots) = create_test_env();
        heap.register_static_root(&SLOT);
        let obj = proxy.new_object(1, NODE_SIZE).expect("object");
        set_payload(obj, 77);
        proxy.write_static_ref(&SLOT, obj);
        for _ in 0..4 {
            proxy.new_object(2, NODE_SIZE).expect("garbage");
        }
        proxy.retire_region();

        proxy.request_gc(GcReason::User);
        let now = proxy.read_static_ref(&SLOT);
        assert!(!SLOT.word().is_tagged());
        assert_eq!(payload(now), 77);
        heap.unregister_static_root(&SLOT);
    }

    #[test]
    fn test_cycle_updates_threshold_and_tag() {
        let (heap, mut proxy, _roots) = create_test_env();
        let tag = heap.tag_id();
        proxy.new_object(1, NODE_SIZE).expect("object");
        proxy.request_gc(GcReason::User);
        assert_ne!(heap.tag_id(), tag);
        let stats = heap.last_gc_stats().expect("stats");
        assert_eq!(heap.regions.heu_threshold(), stats.heap_threshold);
        assert_eq!(heap.mutators.gc_phase(), GcPhase::Idle);
        assert!(stats.duration() > Duration::ZERO);
    }

    #[test]
    fn test_forced_gc_marks_with_world_stopped() {
        let (heap, mut proxy, roots) = create_test_env();
        let obj = proxy.new_object(1, NODE_SIZE).expect("object");
        set_payload(obj, 5);
        let slot = roots.push(obj);
        proxy.retire_region();
        proxy.request_gc(GcReason::Force);
        assert_eq!(payload(roots.get(slot)), 5);
        assert_eq!(heap.last_gc_stats().map(|s| s.reason), Some(GcReason::Force));
    }
}
