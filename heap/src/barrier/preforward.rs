use std::{
    ptr,
    sync::atomic::{Ordering, fence},
};

use super::{
    Barrier, BarrierCx, BarrierKind,
    forward::{forwarding_compare_and_swap, forwarding_read, forwarding_resolve},
};
use crate::object::{GcTib, ObjectRef, RefField};

/// Barrier of the light sync that hands roots over to to-space.
///
/// Reads forward like the forward barrier. Stores are fenced, since the gc
/// forwards static slots concurrently with mutators that already resumed.
pub(crate) struct PreForwardBarrier;

impl Barrier for PreForwardBarrier {
    fn kind(&self) -> BarrierKind {
        BarrierKind::PreForward
    }

    fn read_ref_field(&self, cx: BarrierCx<'_>, _obj: ObjectRef, field: &RefField) -> ObjectRef {
        forwarding_read(cx, field, Ordering::Acquire)
    }

    fn write_ref_field(&self, cx: BarrierCx<'_>, _obj: ObjectRef, field: &RefField, new: ObjectRef) {
        fence(Ordering::SeqCst);
        field.store(cx.heap.get_and_try_tag(new), Ordering::Release);
    }

    fn atomic_read_ref(
        &self,
        cx: BarrierCx<'_>,
        _obj: ObjectRef,
        field: &RefField,
        order: Ordering,
    ) -> ObjectRef {
        forwarding_read(cx, field, order)
    }

    fn atomic_write_ref(
        &self,
        cx: BarrierCx<'_>,
        _obj: ObjectRef,
        field: &RefField,
        new: ObjectRef,
        order: Ordering,
    ) {
        fence(Ordering::SeqCst);
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
        fence(Ordering::SeqCst);
        forwarding_resolve(cx, field.exchange(cx.heap.get_and_try_tag(new), order))
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
        fence(Ordering::SeqCst);
        let new = cx.heap.get_and_try_tag(new);
        forwarding_compare_and_swap(cx, field, old, new, success, failure)
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
        fence(Ordering::SeqCst);
        // SAFETY: guaranteed by caller
        unsafe { ptr::copy_nonoverlapping(src, dst, len) };
    }
}
