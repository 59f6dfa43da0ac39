use std::{ptr, sync::atomic::Ordering};

use super::{Barrier, BarrierCx, BarrierKind, retag_struct};
use crate::object::{GcTib, ObjectRef, RefField, RefWord};

/// Barrier between the end of marking and forwarding.
///
/// Marking healed every reachable stale word, so only words tagged for the
/// running cycle may show up. Their targets have not moved yet.
pub(crate) struct PostTraceBarrier;

impl PostTraceBarrier {
    #[inline]
    fn resolve(cx: BarrierCx<'_>, word: RefWord) -> ObjectRef {
        crate::heap_check!(
            !cx.heap.is_old_pointer(word),
            "stale reference {:#x} after marking",
            word.raw()
        );
        word.target()
    }
}

impl Barrier for PostTraceBarrier {
    fn kind(&self) -> BarrierKind {
        BarrierKind::PostTrace
    }

    fn read_ref_field(&self, cx: BarrierCx<'_>, _obj: ObjectRef, field: &RefField) -> ObjectRef {
        Self::resolve(cx, field.load(Ordering::Acquire))
    }

    /// Clears the slot if marking found its referent dead.
    fn read_weak_ref(&self, cx: BarrierCx<'_>, _obj: ObjectRef, field: &RefField) -> ObjectRef {
        loop {
            let word = field.load(Ordering::Acquire);
            let target = Self::resolve(cx, word);
            if !cx.heap.is_dead_candidate(target) {
                return target;
            }
            if field.compare_exchange(word, RefWord::NULL) {
                log::trace!("weak referent {:#x} cleared", target.addr());
                return ObjectRef::NULL;
            }
        }
    }

    fn write_ref_field(&self, cx: BarrierCx<'_>, _obj: ObjectRef, field: &RefField, new: ObjectRef) {
        field.store(cx.heap.get_and_try_tag(new), Ordering::Release);
    }

    fn atomic_read_ref(
        &self,
        cx: BarrierCx<'_>,
        _obj: ObjectRef,
        field: &RefField,
        order: Ordering,
    ) -> ObjectRef {
        Self::resolve(cx, field.load(order))
    }

    fn atomic_write_ref(
        &self,
        cx: BarrierCx<'_>,
        _obj: ObjectRef,
        field: &RefField,
        new: ObjectRef,
        order: Ordering,
    ) {
        field.store(cx.heap.get_and_try_tag(new), order);
    }

    fn atomic_swap_ref(
        &self,
        cx: BarrierCx<'_>,
        _obj: ObjectRef,
        field: &RefField,
        new: ObjectRef,
        order: Ordering,
    ) -> ObjectRef {
        Self::resolve(cx, field.exchange(cx.heap.get_and_try_tag(new), order))
    }

    fn compare_and_swap_ref(
        &self,
        cx: BarrierCx<'_>,
        _obj: ObjectRef,
        field: &RefField,
        old: ObjectRef,
        new: ObjectRef,
        success: Ordering,
        failure: Ordering,
    ) -> bool {
        let tagged = cx.heap.get_and_try_tag(new);
        loop {
            let word = field.load(Ordering::Acquire);
            if Self::resolve(cx, word) != old {
                return false;
            }
            if field.compare_exchange_with(word, tagged, success, failure) {
                return true;
            }
        }
    }

    unsafe fn write_struct(
        &self,
        cx: BarrierCx<'_>,
        _obj: ObjectRef,
        dst: *mut u8,
        src: *const u8,
        len: usize,
        tib: &GcTib,
    ) {
        // SAFETY: guaranteed by caller
        unsafe {
            ptr::copy_nonoverlapping(src, dst, len);
            retag_struct(cx.heap, dst, len, tib);
        }
    }
}
