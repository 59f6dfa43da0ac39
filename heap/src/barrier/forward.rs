use std::{ptr, sync::atomic::Ordering};

use super::{Barrier, BarrierCx, BarrierKind};
use crate::object::{GcTib, ObjectRef, RefField, RefWord};

/// Loads a slot while from-space is being evacuated. A tagged word is
/// forwarded and the slot republished untagged; whoever loses the race
/// retries with the winner's word. Exempted regions never move, so words
/// into them are only untagged.
pub(super) fn forwarding_read(cx: BarrierCx<'_>, field: &RefField, order: Ordering) -> ObjectRef {
    loop {
        let word = field.load(order);
        if !word.is_tagged() {
            return word.target();
        }
        crate::heap_check!(
            !cx.heap.is_old_pointer(word),
            "stale reference {:#x} while forwarding",
            word.raw()
        );
        let resolved = if cx.heap.is_unmovable_from_object(word.target()) {
            cx.heap.try_untag_ref_field(field, word)
        } else {
            cx.heap.try_forward_ref_field(field, word)
        };
        if let Some(obj) = resolved {
            return obj;
        }
    }
}

/// The referent of `word` without touching the slot it came from.
pub(super) fn forwarding_resolve(cx: BarrierCx<'_>, word: RefWord) -> ObjectRef {
    let target = word.target();
    if !word.is_tagged() || cx.heap.is_unmovable_from_object(target) {
        return target;
    }
    cx.heap.regions.forward_object(target)
}

pub(super) fn forwarding_compare_and_swap(
    cx: BarrierCx<'_>,
    field: &RefField,
    old: ObjectRef,
    new: RefWord,
    success: Ordering,
    failure: Ordering,
) -> bool {
    loop {
        let word = field.load(Ordering::Acquire);
        if forwarding_resolve(cx, word) != old {
            return false;
        }
        if field.compare_exchange_with(word, new, success, failure) {
            return true;
        }
    }
}

/// Barrier while the gc evacuates from-space. Every mutator has forwarded
/// its roots already, so stored values are final.
pub(crate) struct ForwardBarrier;

impl Barrier for ForwardBarrier {
    fn kind(&self) -> BarrierKind {
        BarrierKind::Forward
    }

    fn read_ref_field(&self, cx: BarrierCx<'_>, _obj: ObjectRef, field: &RefField) -> ObjectRef {
        forwarding_read(cx, field, Ordering::Acquire)
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
        forwarding_read(cx, field, order)
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
        forwarding_resolve(cx, field.exchange(RefWord::untagged(new), order))
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
        forwarding_compare_and_swap(cx, field, old, RefWord::untagged(new), success, failure)
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
