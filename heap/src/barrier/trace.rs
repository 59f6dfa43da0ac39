use std::sync::atomic::{Ordering, fence};

use super::{
    Barrier, BarrierCx, BarrierKind, satb_compare_and_swap, satb_store, satb_swap,
    satb_write_struct,
};
use crate::object::{GcTib, ObjectRef, RefField};

/// Snapshot-at-the-beginning barrier of concurrent marking.
///
/// Reads resolve stale words without touching the field. Stores remember
/// the overwritten and the new referent before the store is published.
pub(crate) struct TraceBarrier;

impl Barrier for TraceBarrier {
    fn kind(&self) -> BarrierKind {
        BarrierKind::Trace
    }

    fn read_ref_field(&self, cx: BarrierCx<'_>, _obj: ObjectRef, field: &RefField) -> ObjectRef {
        cx.heap.decode_latest(field.load(Ordering::Acquire))
    }

    /// A weak referent handed to the mutator becomes strongly reachable.
    fn read_weak_ref(&self, cx: BarrierCx<'_>, obj: ObjectRef, field: &RefField) -> ObjectRef {
        let target = self.read_ref_field(cx, obj, field);
        cx.remember(target);
        target
    }

    fn write_ref_field(&self, cx: BarrierCx<'_>, _obj: ObjectRef, field: &RefField, new: ObjectRef) {
        satb_store(cx, field, new, Ordering::Release);
    }

    /// Static slots were enumerated before tracing started, so their old
    /// referents are in the root set already.
    fn write_static_ref(&self, cx: BarrierCx<'_>, field: &RefField, new: ObjectRef) {
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
        cx.heap.decode_latest(field.load(order))
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
