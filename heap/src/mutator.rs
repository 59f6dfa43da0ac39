//! Per-thread collector state and the phase handshake.
//!
//! A mutator is the collector's view of one execution context. It carries
//! the phase it has acknowledged, the pending suspension requests, its
//! safe-region state and its SATB node. The collector posts requests with
//! [`Mutator::set_suspension_flag`]; the thread answers them at its next
//! safepoint in [`Mutator::handle_suspension_request`], or the collector
//! answers for it while the thread sits in a safe region.

use std::{
    ptr::{self, NonNull},
    sync::{
        Arc,
        atomic::{AtomicPtr, AtomicU8, AtomicU32, AtomicUsize, Ordering},
    },
    thread,
};

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::{
    gc_phase::{AtomicGcPhase, GcPhase},
    mutator_manager::MutatorManager,
    object::ObjectRef,
    region_manager::RegionManager,
    roots::RootProvider,
    safepoint::SafepointPage,
    satb_buffer::{SatbBuffer, SatbNode},
};

bitflags! {
    /// Requests a mutator has to answer at its next safepoint.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SuspensionFlags: u32 {
        const GC_PHASE = 1;
        const SYNC = 1 << 1;
        const EXIT = 1 << 2;
        const CPU_PROFILE = 1 << 3;
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransitionState {
    No = 0,
    Need = 1,
    In = 2,
    Finish = 3,
}

impl From<u8> for TransitionState {
    fn from(val: u8) -> Self {
        match val {
            1 => TransitionState::Need,
            2 => TransitionState::In,
            3 => TransitionState::Finish,
            _ => TransitionState::No,
        }
    }
}

const SAFE_REGION_TRUE: u32 = 0x1716_1514;
const SAFE_REGION_FALSE: u32 = 0x0302_0100;

/// The collector side of a phase handshake.
///
/// Phase transitions run either on the mutator's own thread or on the gc
/// thread, so everything a transition needs is reached through this trait.
pub trait GcPhaseHandler: Send + Sync {
    fn mutator_manager(&self) -> &MutatorManager;

    fn satb_buffer(&self) -> &SatbBuffer;

    /// Adds the roots of `mutator` to the root set of the cycle.
    fn enumerate_mutator_roots(&self, mutator: &Mutator);

    /// Moves the roots of `mutator` that point into evacuated regions.
    fn forward_mutator_roots(&self, mutator: &Mutator);

    /// Samples `mutator` for a cpu profile request.
    fn sample_mutator(&self, _mutator: &Mutator) {}
}

pub struct Mutator {
    id: u32,
    phase: AtomicGcPhase,
    in_saferegion: AtomicU32,
    suspension: AtomicU32,
    transition: AtomicU8,
    observer_cnt: AtomicUsize,
    /// Address the thread polls; the trap page while a request is pending.
    safepoint_slot: AtomicUsize,
    normal_page: usize,
    trap_page: usize,
    /// Guards `satb_node` and the root walk against the collector.
    lock: Mutex<()>,
    satb_node: AtomicPtr<SatbNode>,
    roots: Arc<dyn RootProvider>,
    raw_objects: Mutex<Vec<ObjectRef>>,
}

// SAFETY: the satb node pointer is only swapped under `lock`
unsafe impl Send for Mutator {}
// SAFETY: see above
unsafe impl Sync for Mutator {}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .field("in_saferegion", &self.in_saferegion())
            .field("suspension", &self.suspension_flags())
            .field("transition", &self.transition_state())
            .finish()
    }
}

impl Mutator {
    /// A new mutator starts inside a safe region, in `phase`.
    pub fn new(
        id: u32,
        phase: GcPhase,
        roots: Arc<dyn RootProvider>,
        safepoint: &SafepointPage,
    ) -> Self {
        Self {
            id,
            phase: AtomicGcPhase::new(phase),
            in_saferegion: AtomicU32::new(SAFE_REGION_TRUE),
            suspension: AtomicU32::new(0),
            transition: AtomicU8::new(TransitionState::No as u8),
            observer_cnt: AtomicUsize::new(0),
            safepoint_slot: AtomicUsize::new(safepoint.normal_page()),
            normal_page: safepoint.normal_page(),
            trap_page: safepoint.trap_page(),
            lock: Mutex::new(()),
            satb_node: AtomicPtr::new(ptr::null_mut()),
            roots,
            raw_objects: Mutex::new(Vec::new()),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The phase this mutator has acknowledged.
    #[inline(always)]
    pub fn phase(&self) -> GcPhase {
        self.phase.load()
    }

    pub fn roots(&self) -> &Arc<dyn RootProvider> {
        &self.roots
    }

    fn transition_state(&self) -> TransitionState {
        TransitionState::from(self.transition.load(Ordering::Acquire))
    }

    // ── Safe regions ──────────────────────────────────────────────────

    #[inline(always)]
    pub fn in_saferegion(&self) -> bool {
        self.in_saferegion.load(Ordering::SeqCst) == SAFE_REGION_TRUE
    }

    /// Declares that this thread will not touch the heap until it leaves
    /// again. The collector may act on its behalf meanwhile.
    #[inline]
    pub fn enter_saferegion(&self) {
        self.in_saferegion.store(SAFE_REGION_TRUE, Ordering::SeqCst);
    }

    /// Returns to managed code, answering whatever was posted meanwhile.
    #[inline]
    pub fn leave_saferegion(&self, cx: &dyn GcPhaseHandler) {
        self.in_saferegion.store(SAFE_REGION_FALSE, Ordering::SeqCst);
        if self.has_any_suspension_request() {
            self.handle_suspension_request(cx);
        }
    }

    // ── Suspension requests ───────────────────────────────────────────

    #[inline(always)]
    pub fn suspension_flags(&self) -> SuspensionFlags {
        SuspensionFlags::from_bits_truncate(self.suspension.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn has_any_suspension_request(&self) -> bool {
        self.suspension.load(Ordering::Acquire) != 0
    }

    #[inline(always)]
    pub fn has_suspension_flag(&self, flag: SuspensionFlags) -> bool {
        self.suspension_flags().contains(flag)
    }

    pub fn set_suspension_flag(&self, flag: SuspensionFlags) {
        if flag.contains(SuspensionFlags::GC_PHASE) {
            self.transition
                .store(TransitionState::Need as u8, Ordering::SeqCst);
        }
        self.suspension.fetch_or(flag.bits(), Ordering::SeqCst);
    }

    pub fn clear_suspension_flag(&self, flag: SuspensionFlags) {
        self.suspension.fetch_and(!flag.bits(), Ordering::SeqCst);
    }

    // ── Safepoint page ────────────────────────────────────────────────

    /// The address compiled code reads at a polling safepoint.
    #[inline(always)]
    pub fn safepoint_poll_address(&self) -> usize {
        self.safepoint_slot.load(Ordering::Relaxed)
    }

    pub fn set_safepoint_active(&self, active: bool) {
        let page = if active { self.trap_page } else { self.normal_page };
        self.safepoint_slot.store(page, Ordering::Release);
    }

    pub fn is_safepoint_active(&self) -> bool {
        self.safepoint_poll_address() == self.trap_page
    }

    // ── Observers ─────────────────────────────────────────────────────

    pub fn inc_observer(&self) {
        self.observer_cnt.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_observer(&self) {
        self.observer_cnt.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn has_observer(&self) -> bool {
        self.observer_cnt.load(Ordering::SeqCst) != 0
    }

    // ── Handshake ─────────────────────────────────────────────────────

    /// Answers pending requests until none is left and nobody inspects
    /// this mutator anymore.
    pub fn handle_suspension_request(&self, cx: &dyn GcPhaseHandler) {
        loop {
            self.enter_saferegion();
            if self.has_suspension_flag(SuspensionFlags::GC_PHASE) {
                self.transition_gc_phase(true, cx);
            } else if self.has_suspension_flag(SuspensionFlags::SYNC) {
                self.suspend_for_sync(cx.mutator_manager());
                if self.has_suspension_flag(SuspensionFlags::GC_PHASE) {
                    self.transition_gc_phase(true, cx);
                }
            } else if self.has_suspension_flag(SuspensionFlags::CPU_PROFILE) {
                self.inc_observer();
                cx.sample_mutator(self);
                self.dec_observer();
                self.clear_suspension_flag(SuspensionFlags::CPU_PROFILE);
            } else if self.has_suspension_flag(SuspensionFlags::EXIT) {
                log::debug!("mutator {} parks for exit", self.id);
                loop {
                    thread::park();
                }
            }
            self.in_saferegion
                .store(SAFE_REGION_FALSE, Ordering::SeqCst);
            if !self.has_any_suspension_request() && !self.has_observer() {
                return;
            }
        }
    }

    fn suspend_for_sync(&self, manager: &MutatorManager) {
        self.clear_suspension_flag(SuspensionFlags::SYNC);
        manager.wait_for_sync_release();
        if manager.is_sync_triggered() {
            // a new sync was posted while this mutator slept
            self.set_suspension_flag(SuspensionFlags::SYNC);
        }
    }

    /// Moves this mutator to the global phase. Called by the mutator itself
    /// (`by_self`) or by the gc thread while the mutator is in a safe
    /// region. Returns false if the gc thread has to retry later.
    pub fn transition_gc_phase(&self, by_self: bool, cx: &dyn GcPhaseHandler) -> bool {
        loop {
            match self.transition_state() {
                TransitionState::Finish => {
                    let global = cx.mutator_manager().gc_phase();
                    let done = self.phase() == global;
                    if !by_self {
                        crate::heap_check!(
                            done,
                            "mutator {} finished in {} but the heap is in {}",
                            self.id,
                            self.phase().name(),
                            global.name()
                        );
                    }
                    return done;
                }
                TransitionState::In => {
                    if !by_self {
                        return false;
                    }
                    self.wait_for_phase_transition();
                    return true;
                }
                TransitionState::No => return true,
                TransitionState::Need => {
                    if self
                        .transition
                        .compare_exchange(
                            TransitionState::Need as u8,
                            TransitionState::In as u8,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_err()
                    {
                        continue;
                    }
                    let phase = cx.mutator_manager().gc_phase();
                    self.transition_to_gc_phase_exclusive(phase, cx);
                    self.transition
                        .store(TransitionState::Finish as u8, Ordering::Release);
                    return true;
                }
            }
        }
    }

    fn wait_for_phase_transition(&self) {
        while self.transition_state() == TransitionState::In {
            thread::yield_now();
        }
    }

    fn transition_to_gc_phase_exclusive(&self, phase: GcPhase, cx: &dyn GcPhaseHandler) {
        self.handle_gc_phase(phase, cx);
        self.set_safepoint_active(false);
        self.clear_suspension_flag(SuspensionFlags::GC_PHASE);
        self.phase.store(phase);
    }

    fn handle_gc_phase(&self, phase: GcPhase, cx: &dyn GcPhaseHandler) {
        match phase {
            GcPhase::Finish | GcPhase::Forward => {
                let _guard = self.lock.lock();
                if let Some(node) = NonNull::new(self.satb_node.load(Ordering::Relaxed)) {
                    // SAFETY: the node belongs to the satb buffer
                    unsafe { node.as_ref() }.clear();
                }
            }
            GcPhase::Enum => cx.enumerate_mutator_roots(self),
            GcPhase::PreForward => cx.forward_mutator_roots(self),
            GcPhase::ClearSatbBuffer | GcPhase::ReclaimSatbNode => {
                self.retire_satb_node(cx.satb_buffer());
            }
            _ => {}
        }
    }

    // ── SATB ──────────────────────────────────────────────────────────

    /// Remembers `obj` unless it is known to be traced already.
    pub fn remember_object(&self, regions: &RegionManager, satb: &SatbBuffer, obj: ObjectRef) {
        if !SatbBuffer::should_enqueue(regions, obj) {
            return;
        }
        let _guard = self.lock.lock();
        let node = satb.ensure_good_node(self.satb_node.load(Ordering::Relaxed));
        // SAFETY: ensure_good_node hands out a live node with room
        let pushed = unsafe { node.as_ref() }.push(obj);
        debug_assert!(pushed);
        self.satb_node.store(node.as_ptr(), Ordering::Relaxed);
    }

    /// Moves the objects of the current node into `out`. The node stays
    /// with the mutator.
    pub fn drain_satb_node(&self, out: &mut Vec<ObjectRef>) {
        let _guard = self.lock.lock();
        if let Some(node) = NonNull::new(self.satb_node.load(Ordering::Relaxed)) {
            // SAFETY: the node belongs to the satb buffer
            unsafe { node.as_ref() }.drain_into(out);
        }
    }

    pub fn retire_satb_node(&self, satb: &SatbBuffer) {
        let _guard = self.lock.lock();
        let node = self.satb_node.swap(ptr::null_mut(), Ordering::Relaxed);
        if let Some(node) = NonNull::new(node) {
            satb.retire_node(node);
        }
    }

    pub fn has_satb_node(&self) -> bool {
        !self.satb_node.load(Ordering::Relaxed).is_null()
    }

    // ── Roots ─────────────────────────────────────────────────────────

    /// Calls `visitor` on every root of this mutator: the slots of its root
    /// provider and the objects pinned for raw access.
    pub fn visit_roots(&self, visitor: &mut dyn FnMut(&mut ObjectRef)) {
        let _guard = self.lock.lock();
        self.inc_observer();
        self.roots.visit_roots(visitor);
        for obj in self.raw_objects.lock().iter_mut() {
            visitor(obj);
        }
        self.dec_observer();
    }

    pub fn push_raw_object(&self, obj: ObjectRef) {
        self.raw_objects.lock().push(obj);
    }

    /// Forgets the most recent raw pin of `obj` and returns its current
    /// address, which differs from `obj` if the collector moved it.
    pub fn pop_raw_object(&self, obj: ObjectRef) -> Option<ObjectRef> {
        let mut raw = self.raw_objects.lock();
        let pos = raw.iter().rposition(|&o| o == obj)?;
        Some(raw.remove(pos))
    }

    pub fn raw_object_count(&self) -> usize {
        self.raw_objects.lock().len()
    }

    /// One log line describing this mutator, for stuck-world diagnostics.
    pub fn dump(&self) {
        log::warn!(
            "mutator {}: phase {}, in saferegion {}, requests {:?}, transition {:?}, observers {}",
            self.id,
            self.phase().name(),
            self.in_saferegion(),
            self.suspension_flags(),
            self.transition_state(),
            self.observer_cnt.load(Ordering::Relaxed)
        );
    }
}

/// Keeps the current thread in a safe region for its lifetime.
///
/// Blocking calls wrap themselves in one so that the collector never waits
/// on them; leaving the region answers pending requests.
pub struct ScopedEnterSaferegion<'a> {
    mutator: &'a Mutator,
    cx: &'a dyn GcPhaseHandler,
    was_in: bool,
}

impl<'a> ScopedEnterSaferegion<'a> {
    pub fn new(mutator: &'a Mutator, cx: &'a dyn GcPhaseHandler) -> Self {
        let was_in = mutator.in_saferegion();
        if !was_in {
            mutator.enter_saferegion();
        }
        Self {
            mutator,
            cx,
            was_in,
        }
    }
}

impl Drop for ScopedEnterSaferegion<'_> {
    fn drop(&mut self) {
        if !self.was_in {
            self.mutator.leave_saferegion(self.cx);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::roots::RootStack;
    use std::sync::atomic::AtomicBool;

    /// Handler without a heap: counts enumerations and forwards nothing.
    pub(crate) struct TestHandler {
        pub manager: MutatorManager,
        pub satb: SatbBuffer,
        pub enumerated: AtomicUsize,
        pub forwarded: AtomicUsize,
        pub sampled: AtomicBool,
    }

    impl TestHandler {
        pub(crate) fn new() -> Self {
            Self {
                manager: MutatorManager::new(std::time::Duration::from_secs(30))
                    .expect("mutator manager"),
                satb: SatbBuffer::new(1).expect("satb buffer"),
                enumerated: AtomicUsize::new(0),
                forwarded: AtomicUsize::new(0),
                sampled: AtomicBool::new(false),
            }
        }
    }

    impl GcPhaseHandler for TestHandler {
        fn mutator_manager(&self) -> &MutatorManager {
            &self.manager
        }

        fn satb_buffer(&self) -> &SatbBuffer {
            &self.satb
        }

        fn enumerate_mutator_roots(&self, mutator: &Mutator) {
            mutator.visit_roots(&mut |_| {
                self.enumerated.fetch_add(1, Ordering::SeqCst);
            });
        }

        fn forward_mutator_roots(&self, _mutator: &Mutator) {
            self.forwarded.fetch_add(1, Ordering::SeqCst);
        }

        fn sample_mutator(&self, _mutator: &Mutator) {
            self.sampled.store(true, Ordering::SeqCst);
        }
    }

    fn create_mutator(cx: &TestHandler) -> Arc<Mutator> {
        let roots = Arc::new(RootStack::new());
        roots.push(ObjectRef::from_addr(0x1000));
        roots.push(ObjectRef::from_addr(0x2000));
        cx.manager.create_mutator(roots)
    }

    #[test]
    fn test_self_transition_runs_phase_work() {
        let cx = TestHandler::new();
        let m = create_mutator(&cx);
        m.leave_saferegion(&cx);

        cx.manager.set_gc_phase(GcPhase::Enum);
        m.set_suspension_flag(SuspensionFlags::GC_PHASE);
        m.set_safepoint_active(true);
        assert!(m.is_safepoint_active());

        m.handle_suspension_request(&cx);
        assert_eq!(m.phase(), GcPhase::Enum);
        assert_eq!(cx.enumerated.load(Ordering::SeqCst), 2);
        assert!(!m.has_any_suspension_request());
        assert!(!m.is_safepoint_active());
        assert!(!m.in_saferegion());

        // a finished transition is not repeated
        assert!(m.transition_gc_phase(true, &cx));
        assert_eq!(cx.enumerated.load(Ordering::SeqCst), 2);
        cx.manager.destroy_mutator(&m, &cx.satb);
    }

    #[test]
    fn test_gc_transitions_parked_mutator() {
        let cx = TestHandler::new();
        let m = create_mutator(&cx);
        assert!(m.in_saferegion());

        cx.manager.set_gc_phase(GcPhase::PreForward);
        m.set_suspension_flag(SuspensionFlags::GC_PHASE);
        assert!(m.transition_gc_phase(false, &cx));
        assert_eq!(m.phase(), GcPhase::PreForward);
        assert_eq!(cx.forwarded.load(Ordering::SeqCst), 1);

        // leaving the safe region does not run the handshake again
        m.leave_saferegion(&cx);
        assert_eq!(cx.forwarded.load(Ordering::SeqCst), 1);
        cx.manager.destroy_mutator(&m, &cx.satb);
    }

    #[test]
    fn test_clear_satb_phase_retires_node() {
        let cx = TestHandler::new();
        let m = create_mutator(&cx);
        let node = cx.satb.ensure_good_node(ptr::null_mut());
        unsafe { node.as_ref() }.push(ObjectRef::from_addr(0x3000));
        m.satb_node.store(node.as_ptr(), Ordering::Relaxed);

        cx.manager.set_gc_phase(GcPhase::ClearSatbBuffer);
        m.set_suspension_flag(SuspensionFlags::GC_PHASE);
        assert!(m.transition_gc_phase(false, &cx));
        assert!(!m.has_satb_node());

        let mut out = Vec::new();
        cx.satb.get_retired_objects(&mut out);
        assert_eq!(out, vec![ObjectRef::from_addr(0x3000)]);
        cx.manager.destroy_mutator(&m, &cx.satb);
    }

    #[test]
    fn test_cpu_profile_request() {
        let cx = TestHandler::new();
        let m = create_mutator(&cx);
        m.leave_saferegion(&cx);
        m.set_suspension_flag(SuspensionFlags::CPU_PROFILE);
        m.handle_suspension_request(&cx);
        assert!(cx.sampled.load(Ordering::SeqCst));
        assert!(!m.has_any_suspension_request());
        cx.manager.destroy_mutator(&m, &cx.satb);
    }

    #[test]
    fn test_raw_objects_are_roots() {
        let cx = TestHandler::new();
        let m = create_mutator(&cx);
        m.push_raw_object(ObjectRef::from_addr(0x5000));
        let mut seen = Vec::new();
        m.visit_roots(&mut |slot| seen.push(*slot));
        assert_eq!(seen.len(), 3);
        assert!(seen.contains(&ObjectRef::from_addr(0x5000)));
        assert_eq!(
            m.pop_raw_object(ObjectRef::from_addr(0x5000)),
            Some(ObjectRef::from_addr(0x5000))
        );
        assert_eq!(m.raw_object_count(), 0);
        cx.manager.destroy_mutator(&m, &cx.satb);
    }

    #[test]
    fn test_scoped_saferegion_restores_state() {
        let cx = TestHandler::new();
        let m = create_mutator(&cx);
        m.leave_saferegion(&cx);
        {
            let _scope = ScopedEnterSaferegion::new(&m, &cx);
            assert!(m.in_saferegion());
        }
        assert!(!m.in_saferegion());
        cx.manager.destroy_mutator(&m, &cx.satb);
    }
}
