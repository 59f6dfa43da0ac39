use std::sync::atomic::Ordering;

use super::{
    Barrier, BarrierCx, BarrierKind, satb_compare_and_swap, satb_store, satb_swap,
    satb_write_struct,
};
use crate::object::{GcTib, ObjectRef, RefField};

/// Barrier while mutators hand over their roots.
///
/// Mutators give up their roots one handshake at a time, so no single
/// snapshot exists yet. Every referent that passes through here is
/// remembered, loaded ones included.
pub(crate) struct EnumBarrier;

impl Barrier for EnumBarrier {
    fn kind(&self) -> BarrierKind {
        BarrierKind::Enum
    }

    fn read_ref_field(&self, cx: BarrierCx<'_>, _obj: ObjectRef, field: &RefField) -> ObjectRef {
        let obj = cx.heap.decode_latest(field.load(Ordering::Acquire));
        cx.remember(obj);
        obj
    }

    fn write_ref_field(&self, cx: BarrierCx<'_>, _obj: ObjectRef, field: &RefField, new: ObjectRef) {
        satb_store(cx, field, new, Ordering::Release);
    }

    fn atomic_read_ref(
        &self,
        cx: BarrierCx<'_>,
        _obj: ObjectRef,
        field: &RefField,
        order: Ordering,
    ) -> ObjectRef {
        let obj = cx.heap.decode_latest(field.load(order));
        cx.remember(obj);
        obj
    }

    fn atomic_write_ref(
        &self,
        cx: BarrierCx<'_>,
        _obj: ObjectRef,
        field: &RefField,
        new: ObjectRef,
        order: Ordering,
    ) {
        satb_store(cx, field, new, order);
    }

    fn atomic_swap_ref(
        &self,
        cx: BarrierCx<'_>,
        _obj: ObjectRef,
        field: &RefField,
        new: ObjectRef,
        order: Ordering,
    ) -> ObjectRef {
        satb_swap(cx, field, new, order)
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
        satb_compare_and_swap(cx, field, old, new, success, failure)
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
        unsafe { satb_write_struct(cx, dst, src, len, tib) };
    }
}
