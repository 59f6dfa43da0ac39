//! Registry of mutators and the world-level synchronization on top of the
//! per-mutator handshake.
//!
//! Membership changes take the management lock shared; stopping the world
//! and phase transitions take it exclusive, so the set of mutators is fixed
//! while the collector walks it.

use std::{
    mem,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::{
    Condvar, Mutex, RawMutex, RawRwLock,
    lock_api::{RawMutex as _, RawRwLock as _, RawRwLockTimed as _},
};

use crate::{
    HeapError,
    barrier::BarrierKind,
    gc_phase::{AtomicGcPhase, GcPhase},
    mutator::{GcPhaseHandler, Mutator, SuspensionFlags},
    roots::RootProvider,
    safepoint::SafepointPage,
    satb_buffer::SatbBuffer,
};

/// Time a silent mutator gets per hundred mutators before it is dumped.
const STW_DUMP_INTERVAL_MS: u64 = 240_000;

/// Mutators that enter a safe region on their own do not report, so a
/// stopping collector rechecks them at this interval.
const STW_POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Shared by a stopping collector and the mutators answering it.
struct SyncState {
    /// Flagged mutators that have not reported in yet.
    unstopped: usize,
    /// Whether a stop is in force. Reported mutators sleep until it ends.
    stopped: bool,
}

pub struct MutatorManager {
    management: RawRwLock,
    sync: RawMutex,
    mutators: Mutex<Vec<Arc<Mutator>>>,
    expiring: Mutex<Vec<Arc<Mutator>>>,
    sync_triggered: AtomicBool,
    world_stopped: AtomicBool,
    sync_state: Mutex<SyncState>,
    sync_changed: Condvar,
    gc_phase: AtomicGcPhase,
    barrier: AtomicU8,
    next_id: AtomicU32,
    safepoint: SafepointPage,
    stw_timeout: Duration,
}

impl MutatorManager {
    pub fn new(stw_timeout: Duration) -> Result<Self, HeapError> {
        Ok(Self {
            management: RawRwLock::INIT,
            sync: RawMutex::INIT,
            mutators: Mutex::new(Vec::new()),
            expiring: Mutex::new(Vec::new()),
            sync_triggered: AtomicBool::new(false),
            world_stopped: AtomicBool::new(false),
            sync_state: Mutex::new(SyncState {
                unstopped: 0,
                stopped: false,
            }),
            sync_changed: Condvar::new(),
            gc_phase: AtomicGcPhase::new(GcPhase::Idle),
            barrier: AtomicU8::new(BarrierKind::Idle as u8),
            next_id: AtomicU32::new(0),
            safepoint: SafepointPage::new()?,
            stw_timeout,
        })
    }

    pub fn safepoint(&self) -> &SafepointPage {
        &self.safepoint
    }

    // ── Global phase ──────────────────────────────────────────────────

    #[inline(always)]
    pub fn gc_phase(&self) -> GcPhase {
        self.gc_phase.load()
    }

    pub fn set_gc_phase(&self, phase: GcPhase) {
        self.gc_phase.store(phase);
    }

    #[inline(always)]
    pub fn barrier_kind(&self) -> BarrierKind {
        BarrierKind::from(self.barrier.load(Ordering::Acquire))
    }

    /// Selects the barrier for `phase`. Phases without a barrier of their
    /// own keep the installed one.
    pub fn install_barrier(&self, phase: GcPhase) {
        if let Some(kind) = BarrierKind::for_phase(phase) {
            self.barrier.store(kind as u8, Ordering::Release);
        }
    }

    // ── Membership ────────────────────────────────────────────────────

    /// Registers a mutator in the current global phase. It starts inside a
    /// safe region.
    pub fn create_mutator(&self, roots: Arc<dyn RootProvider>) -> Arc<Mutator> {
        self.management.lock_shared();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mutator = Arc::new(Mutator::new(id, self.gc_phase(), roots, &self.safepoint));
        self.mutators.lock().push(Arc::clone(&mutator));
        // SAFETY: locked above
        unsafe { self.management.unlock_shared() };
        log::debug!("mutator {id} created");
        mutator
    }

    /// Unregisters `mutator`. If the world is stopped, the mutator is only
    /// parked in a safe region and removed at the end of the cycle.
    pub fn destroy_mutator(&self, mutator: &Arc<Mutator>, satb: &SatbBuffer) {
        mutator.enter_saferegion();
        if self.management.try_lock_shared() {
            self.remove_mutator(mutator, satb);
            // SAFETY: locked above
            unsafe { self.management.unlock_shared() };
        } else {
            log::debug!("mutator {} expires", mutator.id());
            self.expiring.lock().push(Arc::clone(mutator));
        }
    }

    /// Removes the mutators whose destruction raced with a collection.
    pub fn destroy_expired_mutators(&self, satb: &SatbBuffer) {
        let expiring = mem::take(&mut *self.expiring.lock());
        if expiring.is_empty() {
            return;
        }
        self.management.lock_shared();
        for mutator in &expiring {
            self.remove_mutator(mutator, satb);
        }
        // SAFETY: locked above
        unsafe { self.management.unlock_shared() };
    }

    fn remove_mutator(&self, mutator: &Arc<Mutator>, satb: &SatbBuffer) {
        self.mutators.lock().retain(|m| !Arc::ptr_eq(m, mutator));
        mutator.retire_satb_node(satb);
        log::debug!("mutator {} destroyed", mutator.id());
    }

    pub fn mutator_count(&self) -> usize {
        self.mutators.lock().len()
    }

    /// A snapshot of the registered mutators.
    pub fn mutators(&self) -> Vec<Arc<Mutator>> {
        self.mutators.lock().clone()
    }

    pub fn for_each_mutator(&self, mut f: impl FnMut(&Mutator)) {
        for mutator in self.mutators() {
            f(&mutator);
        }
    }

    // ── Stop the world ────────────────────────────────────────────────

    #[inline]
    pub fn is_sync_triggered(&self) -> bool {
        self.sync_triggered.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_world_stopped(&self) -> bool {
        self.world_stopped.load(Ordering::SeqCst)
    }

    /// Reports a mutator that answered a sync request as stopped and
    /// blocks it until the world runs again.
    pub(crate) fn wait_for_sync_release(&self) {
        let mut state = self.sync_state.lock();
        if !state.stopped {
            return;
        }
        state.unstopped = state.unstopped.saturating_sub(1);
        if state.unstopped == 0 {
            self.sync_changed.notify_all();
        }
        while state.stopped {
            self.sync_changed.wait(&mut state);
        }
    }

    /// Mutators of the running stop that have not reported in.
    pub fn unstopped_mutator_count(&self) -> usize {
        self.sync_state.lock().unstopped
    }

    fn acquire_management_exclusive(&self) {
        if !self.management.try_lock_exclusive_for(self.stw_timeout) {
            crate::fatal!(
                "could not lock the mutator list within {:?}",
                self.stw_timeout
            );
        }
    }

    /// Brings every mutator into a safe region and keeps it there until
    /// [`Self::start_the_world`].
    pub fn stop_the_world(&self) {
        self.sync.lock();
        self.sync_triggered.store(true, Ordering::SeqCst);
        self.acquire_management_exclusive();

        let mutators = self.mutators();
        if mutators.is_empty() {
            self.world_stopped.store(true, Ordering::SeqCst);
            return;
        }
        {
            let mut state = self.sync_state.lock();
            state.unstopped = mutators.len();
            state.stopped = true;
        }
        for mutator in &mutators {
            mutator.set_suspension_flag(SuspensionFlags::SYNC);
            mutator.set_safepoint_active(true);
        }
        self.wait_all_in_saferegion(&mutators);
        self.world_stopped.store(true, Ordering::SeqCst);
    }

    fn wait_all_in_saferegion(&self, mutators: &[Arc<Mutator>]) {
        let dump_after = Duration::from_millis(
            (mutators.len() as u64 / 100) * STW_DUMP_INTERVAL_MS + STW_DUMP_INTERVAL_MS,
        );
        let mut last_dump = Instant::now();
        let mut pending: Vec<&Arc<Mutator>> = mutators.iter().collect();
        let mut state = self.sync_state.lock();
        loop {
            pending.retain(|m| !m.in_saferegion());
            if pending.is_empty() || state.unstopped == 0 {
                return;
            }
            if last_dump.elapsed() >= dump_after {
                log::warn!(
                    "{} of {} mutators did not reach a safe region",
                    pending.len(),
                    mutators.len()
                );
                for m in &pending {
                    m.dump();
                }
                last_dump = Instant::now();
            }
            self.sync_changed.wait_for(&mut state, STW_POLL_INTERVAL);
        }
    }

    pub fn start_the_world(&self) {
        self.world_stopped.store(false, Ordering::SeqCst);
        self.sync_triggered.store(false, Ordering::SeqCst);
        for mutator in self.mutators() {
            mutator.clear_suspension_flag(SuspensionFlags::SYNC);
            mutator.set_safepoint_active(false);
        }
        {
            let mut state = self.sync_state.lock();
            state.unstopped = 0;
            state.stopped = false;
            self.sync_changed.notify_all();
        }
        // SAFETY: both locks are held since stop_the_world
        unsafe {
            self.management.unlock_exclusive();
            self.sync.unlock();
        }
    }

    // ── Phase transitions ─────────────────────────────────────────────

    /// Switches the world to `phase` under a stopped world. Mutators run
    /// their part of the transition when they resume.
    pub fn start_light_sync(&self, phase: GcPhase) {
        self.stop_the_world();
        self.install_barrier(phase);
        self.set_gc_phase(phase);
        for mutator in self.mutators() {
            mutator.set_suspension_flag(SuspensionFlags::GC_PHASE);
            mutator.set_safepoint_active(true);
        }
    }

    /// Resumes the world and completes the transition of every mutator that
    /// stays in a safe region.
    pub fn stop_light_sync(&self, cx: &dyn GcPhaseHandler) {
        let phase = self.gc_phase();
        self.start_the_world();
        self.ensure_phase_transition(phase, &self.mutators(), cx);
    }

    /// Moves every mutator to `phase`, doing the work of the ones inside a
    /// safe region on the calling thread.
    pub fn transition_all_mutators_to_gc_phase(&self, phase: GcPhase, cx: &dyn GcPhaseHandler) {
        let locked = !self.is_world_stopped();
        if locked {
            self.acquire_management_exclusive();
        }
        self.install_barrier(phase);
        self.set_gc_phase(phase);
        let mutators = self.mutators();
        for mutator in &mutators {
            mutator.set_suspension_flag(SuspensionFlags::GC_PHASE);
            mutator.set_safepoint_active(true);
        }
        self.ensure_phase_transition(phase, &mutators, cx);
        if locked {
            // SAFETY: locked above
            unsafe { self.management.unlock_exclusive() };
        }
        log::trace!("all mutators in {}", phase.name());
    }

    fn ensure_phase_transition(
        &self,
        phase: GcPhase,
        mutators: &[Arc<Mutator>],
        cx: &dyn GcPhaseHandler,
    ) {
        let mut pending: Vec<&Arc<Mutator>> = mutators.iter().collect();
        while !pending.is_empty() {
            pending.retain(|m| {
                if m.in_saferegion() {
                    !m.transition_gc_phase(false, cx)
                } else {
                    !(m.phase() == phase && !m.has_suspension_flag(SuspensionFlags::GC_PHASE))
                }
            });
            if !pending.is_empty() {
                thread::yield_now();
            }
        }
    }

    /// Flags every mutator to park at its next safepoint for good.
    pub fn demand_exit(&self) {
        for mutator in self.mutators() {
            mutator.set_suspension_flag(SuspensionFlags::EXIT);
            mutator.set_safepoint_active(true);
        }
    }

    /// Posts a sampling request to every mutator.
    pub fn request_cpu_profile(&self) {
        for mutator in self.mutators() {
            mutator.set_suspension_flag(SuspensionFlags::CPU_PROFILE);
            mutator.set_safepoint_active(true);
        }
    }
}

// ── Scoped guards ─────────────────────────────────────────────────────

/// Holds the world stopped for its lifetime and logs the pause.
pub struct ScopedStopTheWorld<'a> {
    manager: &'a MutatorManager,
    reason: &'static str,
    start: Instant,
}

impl<'a> ScopedStopTheWorld<'a> {
    pub fn new(manager: &'a MutatorManager, reason: &'static str) -> Self {
        let start = Instant::now();
        manager.stop_the_world();
        log::debug!(
            "world stopped for {reason} in {}us",
            start.elapsed().as_micros()
        );
        Self {
            manager,
            reason,
            start,
        }
    }
}

impl Drop for ScopedStopTheWorld<'_> {
    fn drop(&mut self) {
        self.manager.start_the_world();
        log::info!(
            "stop-the-world ({}) paused {}us",
            self.reason,
            self.start.elapsed().as_micros()
        );
    }
}

/// A light sync to one phase for the lifetime of the guard.
pub struct ScopedLightSync<'a> {
    manager: &'a MutatorManager,
    cx: &'a dyn GcPhaseHandler,
    reason: &'static str,
    start: Instant,
}

impl<'a> ScopedLightSync<'a> {
    pub fn new(cx: &'a dyn GcPhaseHandler, phase: GcPhase, reason: &'static str) -> Self {
        let start = Instant::now();
        let manager = cx.mutator_manager();
        manager.start_light_sync(phase);
        Self {
            manager,
            cx,
            reason,
            start,
        }
    }
}

impl Drop for ScopedLightSync<'_> {
    fn drop(&mut self) {
        self.manager.stop_light_sync(self.cx);
        log::info!(
            "light sync ({}) took {}us",
            self.reason,
            self.start.elapsed().as_micros()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mutator::tests::TestHandler, object::ObjectRef, roots::RootStack};
    use std::sync::atomic::AtomicUsize;

    fn spawn_worker(
        cx: Arc<TestHandler>,
        stop: Arc<AtomicBool>,
        progress: Arc<AtomicUsize>,
    ) -> thread::JoinHandle<()> {
        let roots = Arc::new(RootStack::new());
        roots.push(ObjectRef::from_addr(0x1000));
        let mutator = cx.manager.create_mutator(roots);
        thread::spawn(move || {
            mutator.leave_saferegion(&*cx);
            while !stop.load(Ordering::SeqCst) {
                progress.fetch_add(1, Ordering::SeqCst);
                if mutator.has_any_suspension_request() {
                    mutator.handle_suspension_request(&*cx);
                }
                thread::yield_now();
            }
            cx.manager.destroy_mutator(&mutator, &cx.satb);
        })
    }

    #[test]
    fn test_stop_the_world_quiesces_mutators() {
        let cx = Arc::new(TestHandler::new());
        let stop = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..4)
            .map(|_| spawn_worker(Arc::clone(&cx), Arc::clone(&stop), Arc::clone(&progress)))
            .collect();
        while progress.load(Ordering::SeqCst) < 100 {
            thread::yield_now();
        }

        for _ in 0..3 {
            {
                let _stw = ScopedStopTheWorld::new(&cx.manager, "test");
                assert!(cx.manager.is_world_stopped());
                cx.manager.for_each_mutator(|m| assert!(m.in_saferegion()));
                let before = progress.load(Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                assert_eq!(progress.load(Ordering::SeqCst), before);
            }
            assert!(!cx.manager.is_world_stopped());
            let resumed = progress.load(Ordering::SeqCst);
            while progress.load(Ordering::SeqCst) < resumed + 10 {
                thread::yield_now();
            }
        }

        stop.store(true, Ordering::SeqCst);
        for w in workers {
            w.join().expect("worker panicked");
        }
        assert_eq!(cx.manager.mutator_count(), 0);
    }

    #[test]
    fn test_transition_reaches_running_and_parked_mutators() {
        let cx = Arc::new(TestHandler::new());
        let stop = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(AtomicUsize::new(0));
        let worker = spawn_worker(Arc::clone(&cx), Arc::clone(&stop), Arc::clone(&progress));
        // stays in its safe region
        let parked = cx.manager.create_mutator(Arc::new(RootStack::new()));

        cx.manager.transition_all_mutators_to_gc_phase(GcPhase::Enum, &*cx);
        cx.manager.for_each_mutator(|m| assert_eq!(m.phase(), GcPhase::Enum));
        // one root on the running mutator, none on the parked one
        assert_eq!(cx.enumerated.load(Ordering::SeqCst), 1);
        assert_eq!(cx.manager.barrier_kind(), BarrierKind::Enum);

        cx.manager.transition_all_mutators_to_gc_phase(GcPhase::Idle, &*cx);
        assert_eq!(parked.phase(), GcPhase::Idle);
        assert_eq!(cx.manager.barrier_kind(), BarrierKind::Idle);

        stop.store(true, Ordering::SeqCst);
        worker.join().expect("worker panicked");
        cx.manager.destroy_mutator(&parked, &cx.satb);
    }

    #[test]
    fn test_light_sync_runs_preforward_on_every_mutator() {
        let cx = Arc::new(TestHandler::new());
        let stop = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..2)
            .map(|_| spawn_worker(Arc::clone(&cx), Arc::clone(&stop), Arc::clone(&progress)))
            .collect();
        let parked = cx.manager.create_mutator(Arc::new(RootStack::new()));
        {
            let _sync = ScopedLightSync::new(&*cx, GcPhase::PreForward, "test");
            assert!(cx.manager.is_world_stopped());
        }
        cx.manager.for_each_mutator(|m| assert_eq!(m.phase(), GcPhase::PreForward));
        assert_eq!(cx.forwarded.load(Ordering::SeqCst), 3);

        stop.store(true, Ordering::SeqCst);
        for w in workers {
            w.join().expect("worker panicked");
        }
        cx.manager.destroy_mutator(&parked, &cx.satb);
    }

    #[test]
    fn test_answering_mutators_count_down_the_stop() {
        let cx = Arc::new(TestHandler::new());
        let stop = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..3)
            .map(|_| spawn_worker(Arc::clone(&cx), Arc::clone(&stop), Arc::clone(&progress)))
            .collect();
        // never answers, found by its safe-region flag instead
        let parked = cx.manager.create_mutator(Arc::new(RootStack::new()));
        while progress.load(Ordering::SeqCst) < 100 {
            thread::yield_now();
        }

        {
            let _stw = ScopedStopTheWorld::new(&cx.manager, "test");
            cx.manager.for_each_mutator(|m| assert!(m.in_saferegion()));
            let deadline = Instant::now() + Duration::from_secs(10);
            while cx.manager.unstopped_mutator_count() > 1 {
                assert!(Instant::now() < deadline, "workers never reported");
                thread::yield_now();
            }
            assert_eq!(cx.manager.unstopped_mutator_count(), 1);
        }
        assert_eq!(cx.manager.unstopped_mutator_count(), 0);
        let resumed = progress.load(Ordering::SeqCst);
        while progress.load(Ordering::SeqCst) < resumed + 10 {
            thread::yield_now();
        }

        stop.store(true, Ordering::SeqCst);
        for w in workers {
            w.join().expect("worker panicked");
        }
        cx.manager.destroy_mutator(&parked, &cx.satb);
    }

    #[test]
    fn test_destroy_during_stop_the_world_expires() {
        let cx = TestHandler::new();
        let m = cx.manager.create_mutator(Arc::new(RootStack::new()));
        cx.manager.stop_the_world();
        cx.manager.destroy_mutator(&m, &cx.satb);
        assert_eq!(cx.manager.mutator_count(), 1);
        cx.manager.start_the_world();
        cx.manager.destroy_expired_mutators(&cx.satb);
        assert_eq!(cx.manager.mutator_count(), 0);
    }
}
