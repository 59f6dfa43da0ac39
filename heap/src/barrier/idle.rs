use std::{ptr, sync::atomic::Ordering};

use super::{Barrier, BarrierCx, BarrierKind};
use crate::object::{GcTib, ObjectRef, RefField, RefWord};

/// Barrier outside of a cycle. Tagged words the last cycle left behind are
/// healed in place by the first read.
pub(crate) struct IdleBarrier;

impl IdleBarrier {
    fn read(cx: BarrierCx<'_>, field: &RefField, order: Ordering) -> ObjectRef {
        loop {
            let word = field.load(order);
            if !word.is_tagged() {
                return word.target();
            }
            if let Some(to) = cx.heap.try_update_ref_field(field, word) {
                return to;
            }
            if let Some(obj) = cx.heap.try_untag_ref_field(field, word) {
                return obj;
            }
        }
    }

    fn resolve(cx: BarrierCx<'_>, word: RefWord) -> ObjectRef {
        if word.is_tagged() {
            cx.heap.find_latest_version(word.target())
        } else {
            word.target()
        }
    }
}

impl Barrier for IdleBarrier {
    fn kind(&self) -> BarrierKind {
        BarrierKind::Idle
    }

    fn read_ref_field(&self, cx: BarrierCx<'_>, _obj: ObjectRef, field: &RefField) -> ObjectRef {
        Self::read(cx, field, Ordering::Acquire)
    }

    fn write_ref_field(&self, _cx: BarrierCx<'_>, _obj: ObjectRef, field: &RefField, new: ObjectRef) {
        field.store(RefWord::untagged(new), Ordering::Release);
    }

    fn atomic_read_ref(
        &self,
        cx: BarrierCx<'_>,
        _obj: ObjectRef,
        field: &RefField,
        order: Ordering,
    ) -> ObjectRef {
        Self::read(cx, field, order)
    }

    fn atomic_write_ref(
        &self,
        _cx: BarrierCx<'_>,
        _obj: ObjectRef,
        field: &RefField,
        new: ObjectRef,
        order: Ordering,
    ) {
        field.store(RefWord::untagged(new), order);
    }

    fn atomic_swap_ref(
        &self,
        cx: BarrierCx<'_>,
        _obj: ObjectRef,
        field: &RefField,
        new: ObjectRef,
        order: Ordering,
    ) -> ObjectRef {
        Self::resolve(cx, field.exchange(RefWord::untagged(new), order))
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
        loop {
            let word = field.load(Ordering::Acquire);
            if Self::resolve(cx, word) != old {
                return false;
            }
            if field.compare_exchange_with(word, RefWord::untagged(new), success, failure) {
                return true;
            }
        }
    }

    unsafe fn write_struct(
        &self,
        _cx: BarrierCx<'_>,
        _obj: ObjectRef,
        dst: *mut u8,
        src: *const u8,
        len: usize,
        _tib: &GcTib,
    ) {
        // SAFETY: guaranteed by caller
        unsafe { ptr::copy_nonoverlapping(src, dst, len) };
    }
}
