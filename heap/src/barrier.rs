//! Phase-dependent access to reference slots.
//!
//! Every load and store of a heap reference goes through the barrier the
//! collector installed for the current phase. The barriers share one
//! interface, so the hot paths dispatch once on [`BarrierKind`] instead of
//! branching on the phase inside every access.
//!
//! A tagged word points into a from-region. Tagged words carrying the tag of
//! the running cycle are *current*; those carrying the other tag are *old*
//! leftovers of the previous cycle whose to-version may be found through the
//! ghost regions.

mod enumeration;
mod forward;
mod idle;
mod post_trace;
mod preforward;
mod trace;

use std::{
    ptr,
    sync::atomic::{Ordering, fence},
};

pub(crate) use enumeration::EnumBarrier;
pub(crate) use forward::ForwardBarrier;
pub(crate) use idle::IdleBarrier;
pub(crate) use post_trace::PostTraceBarrier;
pub(crate) use preforward::PreForwardBarrier;
pub(crate) use trace::TraceBarrier;

use crate::{
    gc_phase::GcPhase,
    heap::HeapInner,
    mutator::Mutator,
    object::{GcTib, HEADER_SIZE, ObjectRef, RefField, RefWord},
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierKind {
    Idle = 0,
    Enum = 1,
    Trace = 2,
    PostTrace = 3,
    PreForward = 4,
    Forward = 5,
}

impl From<u8> for BarrierKind {
    fn from(val: u8) -> Self {
        match val {
            1 => BarrierKind::Enum,
            2 => BarrierKind::Trace,
            3 => BarrierKind::PostTrace,
            4 => BarrierKind::PreForward,
            5 => BarrierKind::Forward,
            _ => BarrierKind::Idle,
        }
    }
}

static BARRIERS: [&dyn Barrier; 6] = [
    &IdleBarrier,
    &EnumBarrier,
    &TraceBarrier,
    &PostTraceBarrier,
    &PreForwardBarrier,
    &ForwardBarrier,
];

impl BarrierKind {
    /// The barrier a phase installs. Phases that only bracket a cycle keep
    /// whatever is installed.
    pub fn for_phase(phase: GcPhase) -> Option<BarrierKind> {
        match phase {
            GcPhase::Idle => Some(BarrierKind::Idle),
            GcPhase::Enum => Some(BarrierKind::Enum),
            GcPhase::Trace | GcPhase::ClearSatbBuffer => Some(BarrierKind::Trace),
            GcPhase::PostTrace => Some(BarrierKind::PostTrace),
            GcPhase::PreForward => Some(BarrierKind::PreForward),
            GcPhase::Forward => Some(BarrierKind::Forward),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BarrierKind::Idle => "idle",
            BarrierKind::Enum => "enum",
            BarrierKind::Trace => "trace",
            BarrierKind::PostTrace => "post-trace",
            BarrierKind::PreForward => "preforward",
            BarrierKind::Forward => "forward",
        }
    }

    #[inline(always)]
    pub(crate) fn barrier(self) -> &'static dyn Barrier {
        BARRIERS[self as usize]
    }
}

/// What a barrier works with: the heap and the mutator doing the access.
#[derive(Clone, Copy)]
pub(crate) struct BarrierCx<'a> {
    pub heap: &'a HeapInner,
    pub mutator: &'a Mutator,
}

impl<'a> BarrierCx<'a> {
    pub fn new(heap: &'a HeapInner, mutator: &'a Mutator) -> Self {
        Self { heap, mutator }
    }

    /// Pushes `obj` into the mutator's SATB node unless it is known live.
    #[inline]
    pub fn remember(&self, obj: ObjectRef) {
        self.mutator
            .remember_object(&self.heap.regions, &self.heap.satb, obj);
    }
}

/// Reference slots of a struct of `len` bytes at `base`.
///
/// # Safety
/// `base` must point to `len` readable bytes laid out as `tib` describes.
unsafe fn struct_fields<'a>(base: usize, len: usize, tib: &GcTib) -> Vec<&'a RefField> {
    let mut fields = Vec::new();
    tib.for_each_ref_offset(len, |off| {
        // SAFETY: guaranteed by caller
        fields.push(unsafe { RefField::from_addr(base + off) });
    });
    fields
}

/// Stores `new` into `field` tagged for the running cycle if it is still
/// the `old` word. Losing the race means someone stored a newer value.
#[inline]
fn retag_field(heap: &HeapInner, field: &RefField, old: RefWord, latest: ObjectRef) {
    let tagged = heap.get_and_try_tag(latest);
    if tagged != old {
        let _ = field.compare_exchange(old, tagged);
    }
}

// ── Marking-phase helpers ─────────────────────────────────────────────

/// Store of a marking phase: the overwritten referent and the new one are
/// remembered before the store becomes visible.
fn satb_store(cx: BarrierCx<'_>, field: &RefField, new: ObjectRef, order: Ordering) {
    let old = cx.heap.decode_latest(field.load(Ordering::Acquire));
    cx.remember(old);
    cx.remember(new);
    fence(Ordering::SeqCst);
    field.store(cx.heap.get_and_try_tag(new), order);
}

fn satb_swap(cx: BarrierCx<'_>, field: &RefField, new: ObjectRef, order: Ordering) -> ObjectRef {
    cx.remember(new);
    fence(Ordering::SeqCst);
    let old = cx
        .heap
        .decode_latest(field.exchange(cx.heap.get_and_try_tag(new), order));
    cx.remember(old);
    old
}

fn satb_compare_and_swap(
    cx: BarrierCx<'_>,
    field: &RefField,
    old: ObjectRef,
    new: ObjectRef,
    success: Ordering,
    failure: Ordering,
) -> bool {
    loop {
        let word = field.load(Ordering::Acquire);
        let current = cx.heap.decode_latest(word);
        if current != old {
            return false;
        }
        cx.remember(current);
        cx.remember(new);
        fence(Ordering::SeqCst);
        if field.compare_exchange_with(word, cx.heap.get_and_try_tag(new), success, failure) {
            return true;
        }
    }
}

/// Struct store of a marking phase.
///
/// # Safety
/// As for [`Barrier::write_struct`].
unsafe fn satb_write_struct(cx: BarrierCx<'_>, dst: *mut u8, src: *const u8, len: usize, tib: &GcTib) {
    // SAFETY: guaranteed by caller
    unsafe {
        for field in struct_fields(dst as usize, len, tib) {
            cx.remember(cx.heap.decode_latest(field.load(Ordering::Acquire)));
        }
        for field in struct_fields(src as usize, len, tib) {
            cx.remember(field.target());
        }
    }
    fence(Ordering::SeqCst);
    // SAFETY: guaranteed by caller
    unsafe {
        ptr::copy_nonoverlapping(src, dst, len);
        retag_struct(cx.heap, dst, len, tib);
    }
}

/// Tags the reference slots of a freshly copied struct that point into
/// from-space.
///
/// # Safety
/// `dst` must hold `len` bytes laid out as `tib` describes.
unsafe fn retag_struct(heap: &HeapInner, dst: *mut u8, len: usize, tib: &GcTib) {
    // SAFETY: guaranteed by caller
    for field in unsafe { struct_fields(dst as usize, len, tib) } {
        let word = field.word();
        if !word.is_tagged() {
            retag_field(heap, field, word, word.target());
        }
    }
}

/// The interface every phase barrier implements.
///
/// `obj` is the object owning `field`, or null for slots outside the heap.
/// Values handed in and out are always untagged.
pub(crate) trait Barrier: Sync {
    fn kind(&self) -> BarrierKind;

    fn read_ref_field(&self, cx: BarrierCx<'_>, obj: ObjectRef, field: &RefField) -> ObjectRef;

    fn read_static_ref(&self, cx: BarrierCx<'_>, field: &RefField) -> ObjectRef {
        self.read_ref_field(cx, ObjectRef::NULL, field)
    }

    fn read_weak_ref(&self, cx: BarrierCx<'_>, obj: ObjectRef, field: &RefField) -> ObjectRef {
        self.read_ref_field(cx, obj, field)
    }

    fn write_ref_field(&self, cx: BarrierCx<'_>, obj: ObjectRef, field: &RefField, new: ObjectRef);

    fn write_static_ref(&self, cx: BarrierCx<'_>, field: &RefField, new: ObjectRef) {
        self.write_ref_field(cx, ObjectRef::NULL, field, new);
    }

    fn atomic_read_ref(
        &self,
        cx: BarrierCx<'_>,
        obj: ObjectRef,
        field: &RefField,
        order: Ordering,
    ) -> ObjectRef;

    fn atomic_write_ref(
        &self,
        cx: BarrierCx<'_>,
        obj: ObjectRef,
        field: &RefField,
        new: ObjectRef,
        order: Ordering,
    );

    /// Stores `new` and returns the previous referent.
    fn atomic_swap_ref(
        &self,
        cx: BarrierCx<'_>,
        obj: ObjectRef,
        field: &RefField,
        new: ObjectRef,
        order: Ordering,
    ) -> ObjectRef;

    /// Stores `new` if the field refers to `old`, comparing resolved
    /// referents rather than raw words.
    #[allow(clippy::too_many_arguments)]
    fn compare_and_swap_ref(
        &self,
        cx: BarrierCx<'_>,
        obj: ObjectRef,
        field: &RefField,
        old: ObjectRef,
        new: ObjectRef,
        success: Ordering,
        failure: Ordering,
    ) -> bool;

    /// Copies a struct of `len` bytes at `src` (inside `obj`, or a static
    /// area if `obj` is null) to `dst` outside the heap. The copy holds
    /// resolved, untagged references.
    ///
    /// # Safety
    /// `src` and `dst` must be valid for `len` bytes laid out as `tib`
    /// describes, and must not overlap.
    unsafe fn read_struct(
        &self,
        cx: BarrierCx<'_>,
        dst: *mut u8,
        obj: ObjectRef,
        src: *const u8,
        len: usize,
        tib: &GcTib,
    ) {
        // SAFETY: guaranteed by caller
        unsafe { ptr::copy_nonoverlapping(src, dst, len) };
        // SAFETY: dst now holds the struct
        for field in unsafe { struct_fields(dst as usize, len, tib) } {
            let target = self.read_ref_field(cx, obj, field);
            field.set_target(target);
        }
    }

    /// Copies a struct of `len` bytes from `src` outside the heap to `dst`
    /// inside `obj` (or a static area if `obj` is null).
    ///
    /// # Safety
    /// As for [`Barrier::read_struct`].
    unsafe fn write_struct(
        &self,
        cx: BarrierCx<'_>,
        obj: ObjectRef,
        dst: *mut u8,
        src: *const u8,
        len: usize,
        tib: &GcTib,
    );

    /// Copies `len` bytes of reference elements from `src` in `src_obj` to
    /// `dst` in `dst_obj`. The ranges may overlap.
    ///
    /// # Safety
    /// Both ranges must be valid 8-aligned reference slots of `len` bytes.
    unsafe fn copy_ref_array(
        &self,
        cx: BarrierCx<'_>,
        dst_obj: ObjectRef,
        dst: *mut u8,
        src_obj: ObjectRef,
        src: *const u8,
        len: usize,
    ) {
        if ptr::eq(dst, src) || len == 0 {
            return;
        }
        let in_heap = cx.heap.is_heap_object(dst_obj);
        let count = len / 8;
        let mut copy_one = |i: usize| {
            // SAFETY: guaranteed by caller
            let (d, s) = unsafe {
                (
                    RefField::from_addr(dst as usize + i * 8),
                    RefField::from_addr(src as usize + i * 8),
                )
            };
            let value = self.read_ref_field(cx, src_obj, s);
            if in_heap {
                self.write_ref_field(cx, dst_obj, d, value);
            } else {
                d.set_target(value);
            }
        };
        if (dst as usize) < (src as usize) {
            (0..count).for_each(&mut copy_one);
        } else {
            (0..count).rev().for_each(&mut copy_one);
        }
    }

    /// Copies `len` bytes of struct elements laid out as `tib` from `src`
    /// in `src_obj` to `dst` in `dst_obj`. The ranges may overlap.
    ///
    /// # Safety
    /// Both ranges must be valid for `len` bytes of whole elements.
    #[allow(clippy::too_many_arguments)]
    unsafe fn copy_struct_array(
        &self,
        cx: BarrierCx<'_>,
        dst_obj: ObjectRef,
        dst: *mut u8,
        src_obj: ObjectRef,
        src: *const u8,
        len: usize,
        tib: &GcTib,
    ) {
        let elem = tib.size();
        if ptr::eq(dst, src) || len == 0 || elem == 0 {
            return;
        }
        crate::heap_check!(
            len.is_multiple_of(elem),
            "struct array copy of {len} bytes with {elem}-byte elements"
        );
        let mut tmp = vec![0u64; elem.div_ceil(8)];
        let tmp_ptr = tmp.as_mut_ptr() as *mut u8;
        let mut copy_one = |i: usize| {
            let off = i * elem;
            // SAFETY: guaranteed by caller; the element goes through a
            // private buffer, so overlap only matters for the order
            unsafe {
                self.read_struct(cx, tmp_ptr, src_obj, src.add(off), elem, tib);
                self.write_struct(cx, dst_obj, dst.add(off), tmp_ptr, elem, tib);
            }
        };
        let count = len / elem;
        if (dst as usize) < (src as usize) {
            (0..count).for_each(&mut copy_one);
        } else {
            (0..count).rev().for_each(&mut copy_one);
        }
    }

    /// Stores the payload of the boxed value `src` into `field` of `obj`.
    /// Either side may live outside the heap.
    ///
    /// # Safety
    /// `field` must be valid for `len` bytes, `src` must be an object with
    /// a payload of `len` bytes, both laid out as `tib` describes.
    unsafe fn write_generic(
        &self,
        cx: BarrierCx<'_>,
        obj: ObjectRef,
        field: *mut u8,
        src: ObjectRef,
        len: usize,
        tib: &GcTib,
    ) {
        let payload = (src.addr() + HEADER_SIZE) as *const u8;
        let dst_in_heap = cx.heap.is_heap_object(obj);
        let src_in_heap = cx.heap.is_heap_object(src);
        // SAFETY: guaranteed by caller
        unsafe {
            match (dst_in_heap, src_in_heap) {
                (false, false) => ptr::copy_nonoverlapping(payload, field, len),
                (false, true) => self.read_struct(cx, field, src, payload, len, tib),
                (true, false) => self.write_struct(cx, obj, field, payload, len, tib),
                (true, true) => {
                    let mut tmp = vec![0u64; len.div_ceil(8)];
                    let tmp_ptr = tmp.as_mut_ptr() as *mut u8;
                    self.read_struct(cx, tmp_ptr, src, payload, len, tib);
                    self.write_struct(cx, obj, field, tmp_ptr, len, tib);
                }
            }
        }
    }

    /// Loads `len` bytes at `field` of `obj` into the payload of the boxed
    /// value `dst`. Either side may live outside the heap.
    ///
    /// # Safety
    /// As for [`Barrier::write_generic`].
    unsafe fn read_generic(
        &self,
        cx: BarrierCx<'_>,
        dst: ObjectRef,
        obj: ObjectRef,
        field: *const u8,
        len: usize,
        tib: &GcTib,
    ) {
        let payload = (dst.addr() + HEADER_SIZE) as *mut u8;
        let dst_in_heap = cx.heap.is_heap_object(dst);
        let src_in_heap = cx.heap.is_heap_object(obj);
        // SAFETY: guaranteed by caller
        unsafe {
            match (dst_in_heap, src_in_heap) {
                (false, false) => ptr::copy_nonoverlapping(field, payload, len),
                (false, true) => self.read_struct(cx, payload, obj, field, len, tib),
                (true, false) => self.write_struct(cx, dst, payload, field, len, tib),
                (true, true) => {
                    let mut tmp = vec![0u64; len.div_ceil(8)];
                    let tmp_ptr = tmp.as_mut_ptr() as *mut u8;
                    self.read_struct(cx, tmp_ptr, obj, field, len, tib);
                    self.write_struct(cx, dst, payload, tmp_ptr, len, tib);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        heap::{Heap, HeapProxy},
        object::{ARRAY_HEADER_SIZE, TraceFn},
        region_info::UNIT_SIZE,
        roots::RootStack,
        settings::HeapSettings,
    };
    use std::sync::Arc;

    /// Objects in barrier tests are `header | ref | ref | payload...`.
    pub(crate) unsafe fn two_ref_trace(obj: ObjectRef, visitor: &mut dyn FnMut(&RefField)) {
        // SAFETY: test objects have two reference slots after the header
        unsafe {
            visitor(obj.field(HEADER_SIZE));
            visitor(obj.field(HEADER_SIZE + 8));
        }
    }

    pub(crate) const NODE_SIZE: usize = HEADER_SIZE + 16 + 8;

    pub(crate) fn create_test_settings() -> HeapSettings {
        HeapSettings {
            heap_size: 256 * UNIT_SIZE,
            region_size: 4 * UNIT_SIZE,
            large_object_threshold: 2 * UNIT_SIZE,
            gc_threshold: 256 * UNIT_SIZE,
            gc_threads: 2,
            satb_initial_pages: 1,
            ..HeapSettings::default()
        }
    }

    pub(crate) fn create_test_env_with(
        trace: TraceFn,
    ) -> (Heap, HeapProxy, Arc<RootStack>) {
        let heap = Heap::new(create_test_settings(), trace).expect("heap");
        let roots = Arc::new(RootStack::new());
        let proxy = heap.proxy(roots.clone());
        (heap, proxy, roots)
    }

    pub(crate) fn create_test_env() -> (Heap, HeapProxy, Arc<RootStack>) {
        create_test_env_with(two_ref_trace)
    }

    /// Turns every full small region into a from-region, as the start of a
    /// cycle does.
    pub(crate) fn make_from_space(heap: &Heap, proxy: &mut HeapProxy) {
        proxy.retire_region();
        heap.regions.assemble_small_garbage_candidates();
    }

    #[test]
    fn test_kind_per_phase() {
        assert_eq!(BarrierKind::for_phase(GcPhase::Idle), Some(BarrierKind::Idle));
        assert_eq!(BarrierKind::for_phase(GcPhase::Enum), Some(BarrierKind::Enum));
        assert_eq!(
            BarrierKind::for_phase(GcPhase::ClearSatbBuffer),
            Some(BarrierKind::Trace)
        );
        assert_eq!(
            BarrierKind::for_phase(GcPhase::PreForward),
            Some(BarrierKind::PreForward)
        );
        assert_eq!(BarrierKind::for_phase(GcPhase::Init), None);
        assert_eq!(BarrierKind::for_phase(GcPhase::ReclaimSatbNode), None);
        for kind in 0..6u8 {
            let kind = BarrierKind::from(kind);
            assert_eq!(kind.barrier().kind(), kind);
        }
    }

    #[test]
    fn test_write_then_read_round_trips_in_every_phase() {
        let (heap, mut proxy, _roots) = create_test_env();
        let holder = proxy.new_object(1, NODE_SIZE).expect("holder");
        let from_obj = proxy.new_object(2, NODE_SIZE).expect("from object");
        make_from_space(&heap, &mut proxy);
        let fresh = proxy.new_object(3, NODE_SIZE).expect("fresh object");
        assert!(heap.regions.is_in_from_region(from_obj));
        assert!(!heap.regions.is_in_from_region(fresh));

        let cx = BarrierCx::new(&heap, proxy.mutator());
        // SAFETY: holder has a slot right after its header
        let field = unsafe { holder.field(HEADER_SIZE) };
        for kind in [
            BarrierKind::Idle,
            BarrierKind::Enum,
            BarrierKind::Trace,
            BarrierKind::PostTrace,
        ] {
            let barrier = kind.barrier();
            for value in [fresh, from_obj, ObjectRef::NULL] {
                barrier.write_ref_field(cx, holder, field, value);
                assert_eq!(barrier.read_ref_field(cx, holder, field), value, "{kind:?}");
                assert_eq!(
                    barrier.atomic_read_ref(cx, holder, field, Ordering::SeqCst),
                    value,
                    "{kind:?}"
                );
            }
        }
        // tracing barriers tag from-space referents
        BarrierKind::Trace
            .barrier()
            .write_ref_field(cx, holder, field, from_obj);
        assert_eq!(field.word(), RefWord::tagged(from_obj, heap.tag_id()));
        // the idle barrier stores plain words
        BarrierKind::Idle
            .barrier()
            .write_ref_field(cx, holder, field, from_obj);
        assert_eq!(field.word(), RefWord::untagged(from_obj));
    }

    #[test]
    fn test_swap_and_cas_compare_referents() {
        let (heap, mut proxy, _roots) = create_test_env();
        let holder = proxy.new_object(1, NODE_SIZE).expect("holder");
        let a = proxy.new_object(2, NODE_SIZE).expect("a");
        make_from_space(&heap, &mut proxy);
        let b = proxy.new_object(3, NODE_SIZE).expect("b");

        let cx = BarrierCx::new(&heap, proxy.mutator());
        let field = unsafe { holder.field(HEADER_SIZE) };
        for kind in [BarrierKind::Idle, BarrierKind::Enum, BarrierKind::Trace, BarrierKind::PostTrace] {
            let barrier = kind.barrier();
            barrier.write_ref_field(cx, holder, field, a);
            // a tagged word still compares equal to its referent
            assert!(barrier.compare_and_swap_ref(
                cx,
                holder,
                field,
                a,
                b,
                Ordering::SeqCst,
                Ordering::SeqCst
            ));
            assert!(!barrier.compare_and_swap_ref(
                cx,
                holder,
                field,
                a,
                ObjectRef::NULL,
                Ordering::SeqCst,
                Ordering::SeqCst
            ));
            assert_eq!(barrier.atomic_swap_ref(cx, holder, field, a, Ordering::SeqCst), b);
            assert_eq!(barrier.read_ref_field(cx, holder, field), a, "{kind:?}");
        }
    }

    const PAYLOAD: usize = HEADER_SIZE + 16;

    /// Keeps `obj` live in its from-region and snapshots from-space into
    /// ghost regions, as the sweep does before forwarding starts.
    fn prepare_forwarding(heap: &Heap, obj: ObjectRef) {
        assert!(!heap.regions.mark_object(obj));
        heap.regions.exempt_from_regions();
        heap.regions.prepare_forward_table();
    }

    fn payload(obj: ObjectRef) -> u64 {
        // SAFETY: test nodes carry a payload word after their two slots
        unsafe { *((obj.addr() + PAYLOAD) as *const u64) }
    }

    #[test]
    fn test_preforward_reads_forward_and_untag() {
        let (heap, mut proxy, _roots) = create_test_env();
        let from_obj = proxy.new_object(2, NODE_SIZE).expect("from object");
        // SAFETY: see payload
        unsafe { *((from_obj.addr() + PAYLOAD) as *mut u64) = 0xfeed };
        make_from_space(&heap, &mut proxy);
        let holder = proxy.new_object(1, NODE_SIZE).expect("holder");
        let fresh = proxy.new_object(3, NODE_SIZE).expect("fresh object");
        prepare_forwarding(&heap, from_obj);

        let cx = BarrierCx::new(&heap, proxy.mutator());
        let barrier = BarrierKind::PreForward.barrier();
        // SAFETY: holder has a slot right after its header
        let field = unsafe { holder.field(HEADER_SIZE) };

        barrier.write_ref_field(cx, holder, field, from_obj);
        assert_eq!(field.word(), RefWord::tagged(from_obj, heap.tag_id()));
        let to = barrier.read_ref_field(cx, holder, field);
        assert_ne!(to, from_obj);
        assert_eq!(to, heap.regions.forward_object(from_obj));
        assert!(!heap.regions.is_in_from_region(to));
        assert_eq!(field.word(), RefWord::untagged(to));
        assert_eq!(payload(to), 0xfeed);

        // referents outside from-space are stored and read as they are
        for value in [fresh, ObjectRef::NULL] {
            barrier.write_ref_field(cx, holder, field, value);
            assert_eq!(field.word(), RefWord::untagged(value));
            assert_eq!(barrier.atomic_read_ref(cx, holder, field, Ordering::SeqCst), value);
        }

        // a tagged from-space word compares equal to its to-version
        barrier.write_ref_field(cx, holder, field, from_obj);
        assert!(!barrier.compare_and_swap_ref(
            cx,
            holder,
            field,
            from_obj,
            fresh,
            Ordering::SeqCst,
            Ordering::SeqCst
        ));
        assert!(barrier.compare_and_swap_ref(
            cx,
            holder,
            field,
            to,
            fresh,
            Ordering::SeqCst,
            Ordering::SeqCst
        ));
        assert_eq!(barrier.read_ref_field(cx, holder, field), fresh);

        barrier.write_ref_field(cx, holder, field, from_obj);
        assert_eq!(barrier.atomic_swap_ref(cx, holder, field, fresh, Ordering::SeqCst), to);
        assert_eq!(field.word(), RefWord::untagged(fresh));
    }

    #[test]
    fn test_forward_heals_tagged_slots() {
        let (heap, mut proxy, _roots) = create_test_env();
        let from_obj = proxy.new_object(2, NODE_SIZE).expect("from object");
        // SAFETY: see payload
        unsafe { *((from_obj.addr() + PAYLOAD) as *mut u64) = 0xbeef };
        make_from_space(&heap, &mut proxy);
        let holder = proxy.new_object(1, NODE_SIZE).expect("holder");
        let fresh = proxy.new_object(3, NODE_SIZE).expect("fresh object");
        prepare_forwarding(&heap, from_obj);

        let cx = BarrierCx::new(&heap, proxy.mutator());
        let barrier = BarrierKind::Forward.barrier();
        // SAFETY: holder has a slot right after its header
        let field = unsafe { holder.field(HEADER_SIZE) };
        let tagged = RefWord::tagged(from_obj, heap.tag_id());

        field.store(tagged, Ordering::Release);
        let to = barrier.atomic_read_ref(cx, holder, field, Ordering::Acquire);
        assert_ne!(to, from_obj);
        assert_eq!(to, heap.regions.forward_object(from_obj));
        assert_eq!(field.word(), RefWord::untagged(to));
        assert_eq!(payload(to), 0xbeef);
        // healed slots read back without forwarding again
        assert_eq!(barrier.read_ref_field(cx, holder, field), to);

        // to-space values are stored untagged
        for value in [to, fresh, ObjectRef::NULL] {
            barrier.write_ref_field(cx, holder, field, value);
            assert_eq!(field.word(), RefWord::untagged(value));
            assert_eq!(barrier.read_ref_field(cx, holder, field), value);
        }

        field.store(tagged, Ordering::Release);
        assert!(!barrier.compare_and_swap_ref(
            cx,
            holder,
            field,
            fresh,
            ObjectRef::NULL,
            Ordering::SeqCst,
            Ordering::SeqCst
        ));
        assert!(barrier.compare_and_swap_ref(
            cx,
            holder,
            field,
            to,
            fresh,
            Ordering::SeqCst,
            Ordering::SeqCst
        ));
        assert_eq!(field.word(), RefWord::untagged(fresh));

        field.store(tagged, Ordering::Release);
        assert_eq!(barrier.atomic_swap_ref(cx, holder, field, fresh, Ordering::SeqCst), to);
        assert_eq!(barrier.read_ref_field(cx, holder, field), fresh);
    }

    #[test]
    fn test_copy_ref_array_overlapping() {
        let (heap, mut proxy, _roots) = create_test_env();
        let elems: Vec<_> = (0..6)
            .map(|i| proxy.new_object(i, NODE_SIZE).expect("element"))
            .collect();
        let array = proxy.new_array(9, 8, 8).expect("array");
        let cx = BarrierCx::new(&heap, proxy.mutator());
        let barrier = BarrierKind::Trace.barrier();
        for (i, &e) in elems.iter().enumerate() {
            barrier.write_ref_field(cx, array, unsafe { array.array_ref(i) }, e);
        }
        let data = array.array_data();
        // shift [0, 6) up by two slots
        unsafe { barrier.copy_ref_array(cx, array, data.add(16), array, data, 48) };
        let read = |i| barrier.read_ref_field(cx, array, unsafe { array.array_ref(i) });
        assert_eq!(read(0), elems[0]);
        assert_eq!(read(1), elems[1]);
        for (i, &e) in elems.iter().enumerate() {
            assert_eq!(read(i + 2), e);
        }
        // and back down
        unsafe { barrier.copy_ref_array(cx, array, data, array, data.add(16), 48) };
        for (i, &e) in elems.iter().enumerate() {
            assert_eq!(read(i), e);
        }
        assert_eq!(unsafe { array.array_length() }, 8);
        assert_eq!(array.array_data() as usize, array.addr() + ARRAY_HEADER_SIZE);
    }

    #[test]
    fn test_struct_round_trip_untags_copy() {
        let (heap, mut proxy, _roots) = create_test_env();
        let holder = proxy.new_object(1, HEADER_SIZE + 32).expect("holder");
        let target = proxy.new_object(2, NODE_SIZE).expect("target");
        make_from_space(&heap, &mut proxy);

        // word 0 and word 2 are references
        let tib = GcTib::new(4, &[0, 2]);
        let src: [u64; 4] = [target.addr() as u64, 7, 0, 9];
        let cx = BarrierCx::new(&heap, proxy.mutator());
        let barrier = BarrierKind::Trace.barrier();
        let dst_in_obj = (holder.addr() + HEADER_SIZE) as *mut u8;
        unsafe {
            barrier.write_struct(cx, holder, dst_in_obj, src.as_ptr() as *const u8, 32, &tib);
        }
        // the heap copy is tagged, the scalar words are untouched
        let slot = unsafe { holder.field(HEADER_SIZE) };
        assert_eq!(slot.word(), RefWord::tagged(target, heap.tag_id()));
        assert_eq!(unsafe { *((holder.addr() + HEADER_SIZE + 8) as *const u64) }, 7);

        let mut out = [0u64; 4];
        unsafe {
            barrier.read_struct(cx, out.as_mut_ptr() as *mut u8, holder, dst_in_obj, 32, &tib);
        }
        assert_eq!(out, src);
    }

    #[test]
    fn test_generic_copies_between_boxes() {
        let (heap, mut proxy, _roots) = create_test_env();
        let boxed = proxy.new_object(4, HEADER_SIZE + 16).expect("box");
        let holder = proxy.new_object(5, HEADER_SIZE + 16).expect("holder");
        let target = proxy.new_object(6, NODE_SIZE).expect("target");
        let tib = GcTib::new(2, &[1]);
        let cx = BarrierCx::new(&heap, proxy.mutator());
        let barrier = BarrierKind::Idle.barrier();

        unsafe {
            *((boxed.addr() + HEADER_SIZE) as *mut u64) = 42;
            boxed.field(HEADER_SIZE + 8).set_target(target);
            let field = (holder.addr() + HEADER_SIZE) as *mut u8;
            barrier.write_generic(cx, holder, field, boxed, 16, &tib);
            assert_eq!(*(field as *const u64), 42);
            assert_eq!(holder.field(HEADER_SIZE + 8).target(), target);

            // read into an off-heap box
            let mut off_heap = [0u64; 3];
            let dst = ObjectRef::from_ptr(off_heap.as_mut_ptr());
            barrier.read_generic(cx, dst, holder, field, 16, &tib);
            assert_eq!(off_heap[1], 42);
            assert_eq!(off_heap[2], target.addr() as u64);
        }
    }
}
