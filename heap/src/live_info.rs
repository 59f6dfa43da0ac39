//! Mark bitmaps and per-region live data.
//!
//! A [`RegionBitmap`] keeps one bit per 8 bytes of a region. Marking an
//! object sets every bit it covers, so counting set bits before an offset
//! gives the live bytes in front of it: that count is the object's offset in
//! its destination.

use std::{
    mem, ptr,
    sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering},
};

use crate::{
    cartesian_tree::UnitIndex,
    forward_data::ForwardDataManager,
    object::{OBJECT_ALIGNMENT, ObjectRef},
    region_info::{RegionFlags, RegionType, UnitInfo},
};

const BYTES_PER_BIT: usize = OBJECT_ALIGNMENT;
const BITS_PER_WORD: usize = 64;
const BYTES_PER_WORD: usize = BYTES_PER_BIT * BITS_PER_WORD;
const PARTS: usize = 16;

/// Placeholder published while the winner of an install race allocates.
pub const TEMPORARY_PTR: usize = 0x1234;

// ── RegionBitmap ──────────────────────────────────────────────────────

/// Header of a bitmap; the words follow it in memory.
#[repr(C)]
pub struct RegionBitmap {
    /// Set bits per partition of `words_per_part` words.
    part_live_bits: [AtomicU32; PARTS],
    live_bytes: AtomicUsize,
    word_count: usize,
    words_per_part: usize,
}

impl RegionBitmap {
    #[inline]
    fn word_count_for(region_size: usize) -> usize {
        region_size.div_ceil(BYTES_PER_WORD)
    }

    /// Bytes needed for the bitmap of a region of `region_size` bytes.
    pub fn byte_size(region_size: usize) -> usize {
        mem::size_of::<Self>() + Self::word_count_for(region_size) * 8
    }

    /// Writes an empty bitmap for a region of `region_size` bytes.
    ///
    /// # Safety
    /// `addr` must be 8-aligned and valid for
    /// [`RegionBitmap::byte_size`]`(region_size)` bytes.
    pub unsafe fn init_at(addr: *mut u8, region_size: usize) -> *mut RegionBitmap {
        let word_count = Self::word_count_for(region_size);
        let bitmap = addr as *mut RegionBitmap;
        // SAFETY: guaranteed by caller
        unsafe {
            bitmap.write(RegionBitmap {
                part_live_bits: Default::default(),
                live_bytes: AtomicUsize::new(0),
                word_count,
                words_per_part: word_count.div_ceil(PARTS).max(1),
            });
            addr.add(mem::size_of::<Self>()).write_bytes(0, word_count * 8);
        }
        bitmap
    }

    #[inline(always)]
    fn word(&self, idx: usize) -> &AtomicU64 {
        debug_assert!(idx < self.word_count);
        // SAFETY: `init_at` laid out `word_count` words after the header
        unsafe {
            let base = (self as *const Self as *const u8).add(mem::size_of::<Self>());
            &*(base as *const AtomicU64).add(idx)
        }
    }

    #[inline(always)]
    fn part_of(&self, word_idx: usize) -> &AtomicU32 {
        &self.part_live_bits[word_idx / self.words_per_part]
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }

    /// Sets the bits of `[start, start + size)`. Returns whether the range
    /// was marked already; only the first caller sees false.
    pub fn mark_bits(&self, start: usize, size: usize) -> bool {
        let head_idx = start / BYTES_PER_WORD;
        let head_bit = (start / BYTES_PER_BIT) % BITS_PER_WORD;
        let bit_count = size / BYTES_PER_BIT;
        let head_bits = BITS_PER_WORD - head_bit;

        let (head_mask, tail_words, last_mask) = if bit_count >= head_bits {
            let tail_bits = bit_count - head_bits;
            (
                !((1u64 << head_bit) - 1),
                tail_bits.div_ceil(BITS_PER_WORD),
                (1u64 << (tail_bits % BITS_PER_WORD)) - 1,
            )
        } else {
            let end = head_bit + bit_count;
            (((1u64 << end) - 1) >> head_bit << head_bit, 0, 0)
        };

        let head = self.word(head_idx);
        if head.load(Ordering::Acquire) & head_mask != 0 {
            return true;
        }
        if head.fetch_or(head_mask, Ordering::AcqRel) & head_mask != 0 {
            return true;
        }
        self.part_of(head_idx)
            .fetch_add(head_mask.count_ones(), Ordering::AcqRel);
        self.live_bytes.fetch_add(size, Ordering::AcqRel);

        if tail_words > 0 {
            let last_idx = head_idx + tail_words;
            let full_end = if last_mask != 0 { last_idx } else { last_idx + 1 };
            for idx in head_idx + 1..full_end {
                let old = self.word(idx).fetch_or(!0, Ordering::AcqRel);
                debug_assert_eq!(old, 0);
                self.part_of(idx)
                    .fetch_add(BITS_PER_WORD as u32, Ordering::AcqRel);
            }
            if last_mask != 0 {
                self.word(last_idx).fetch_or(last_mask, Ordering::AcqRel);
                self.part_of(last_idx)
                    .fetch_add(last_mask.count_ones(), Ordering::AcqRel);
            }
        }
        false
    }

    #[inline]
    pub fn is_marked(&self, offset: usize) -> bool {
        let idx = offset / BYTES_PER_WORD;
        let bit = (offset / BYTES_PER_BIT) % BITS_PER_WORD;
        self.word(idx).load(Ordering::Acquire) & (1 << bit) != 0
    }

    /// Live bytes marked before `offset`.
    pub fn pre_live_bytes(&self, offset: usize) -> usize {
        let idx = offset / BYTES_PER_WORD;
        let part = idx / self.words_per_part;
        let part_start = part * self.words_per_part;

        let mut bits: usize = self.part_live_bits[..part]
            .iter()
            .map(|p| p.load(Ordering::Acquire) as usize)
            .sum();
        for w in part_start..idx {
            bits += self.word(w).load(Ordering::Acquire).count_ones() as usize;
        }
        let bit = (offset / BYTES_PER_BIT) % BITS_PER_WORD;
        let mask = (1u64 << bit) - 1;
        bits += (self.word(idx).load(Ordering::Acquire) & mask).count_ones() as usize;
        bits * BYTES_PER_BIT
    }
}

// ── LiveInfo ──────────────────────────────────────────────────────────

/// Live data of one region for one cycle.
#[repr(C)]
pub struct LiveInfo {
    bound_region: AtomicU32,
    mark_bitmap: AtomicPtr<RegionBitmap>,
    resurrect_bitmap: AtomicPtr<RegionBitmap>,
    enqueue_bitmap: AtomicPtr<RegionBitmap>,
}

impl LiveInfo {
    /// # Safety
    /// `addr` must be 8-aligned and valid for `size_of::<LiveInfo>()` bytes.
    pub unsafe fn init_at(addr: *mut u8, region: UnitIndex) -> *mut LiveInfo {
        let info = addr as *mut LiveInfo;
        // SAFETY: guaranteed by caller
        unsafe {
            info.write(LiveInfo {
                bound_region: AtomicU32::new(region),
                mark_bitmap: AtomicPtr::new(ptr::null_mut()),
                resurrect_bitmap: AtomicPtr::new(ptr::null_mut()),
                enqueue_bitmap: AtomicPtr::new(ptr::null_mut()),
            })
        };
        info
    }

    #[inline]
    pub fn bound_region(&self) -> UnitIndex {
        self.bound_region.load(Ordering::Acquire)
    }

    #[inline]
    pub fn mark_bitmap(&self) -> Option<&RegionBitmap> {
        load_installed(&self.mark_bitmap)
    }

    #[inline]
    pub fn resurrect_bitmap(&self) -> Option<&RegionBitmap> {
        load_installed(&self.resurrect_bitmap)
    }

    #[inline]
    pub fn enqueue_bitmap(&self) -> Option<&RegionBitmap> {
        load_installed(&self.enqueue_bitmap)
    }

    /// Marked plus resurrected bytes before `offset`.
    pub fn pre_live_bytes(&self, offset: usize) -> usize {
        self.mark_bitmap().map_or(0, |b| b.pre_live_bytes(offset))
            + self.resurrect_bitmap().map_or(0, |b| b.pre_live_bytes(offset))
    }
}

#[inline]
fn load_installed<'a, T>(slot: &AtomicPtr<T>) -> Option<&'a T> {
    let p = slot.load(Ordering::Acquire);
    if p.is_null() || p as usize == TEMPORARY_PTR {
        return None;
    }
    // SAFETY: installed pointers live in forward data that outlives the cycle
    Some(unsafe { &*p })
}

/// Returns the pointer in `slot`, installing one from `alloc` if it is
/// empty. Racing callers spin on [`TEMPORARY_PTR`] until the winner
/// publishes.
fn get_or_install<'a, T>(slot: &AtomicPtr<T>, alloc: impl FnOnce() -> *mut T) -> &'a T {
    let mut alloc = Some(alloc);
    loop {
        let p = slot.load(Ordering::Acquire);
        if p as usize == TEMPORARY_PTR {
            std::hint::spin_loop();
            continue;
        }
        if !p.is_null() {
            // SAFETY: installed pointers live in forward data
            return unsafe { &*p };
        }
        if slot
            .compare_exchange(
                p,
                TEMPORARY_PTR as *mut T,
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            let Some(alloc) = alloc.take() else {
                crate::fatal!("live data installed twice");
            };
            let fresh = alloc();
            slot.store(fresh, Ordering::Release);
            // SAFETY: just allocated
            return unsafe { &*fresh };
        }
    }
}

// ── Region marking ────────────────────────────────────────────────────

impl UnitInfo {
    #[inline]
    pub fn live_info(&self) -> Option<&LiveInfo> {
        load_installed(self.live_info_slot())
    }

    pub fn get_or_alloc_live_info(&self, forward: &ForwardDataManager) -> &LiveInfo {
        get_or_install(self.live_info_slot(), || {
            forward.allocate_live_info(self.index())
        })
    }

    fn mark_in(
        &self,
        obj: ObjectRef,
        flag: RegionFlags,
        slot: impl Fn(&LiveInfo) -> &AtomicPtr<RegionBitmap>,
        forward: &ForwardDataManager,
    ) -> bool {
        if self.is_large_region() {
            return self.test_and_set_flag(flag);
        }
        let info = self.get_or_alloc_live_info(forward);
        let size = self.region_size();
        let bitmap = get_or_install(slot(info), || {
            forward.allocate_region_bitmap(size)
        });
        // SAFETY: callers pass live objects of this region
        let obj_size = unsafe { obj.size() };
        bitmap.mark_bits(obj.addr() - self.start(), obj_size)
    }

    /// Sets the mark bits of `obj`. Returns whether it was marked already.
    pub fn mark_object(&self, obj: ObjectRef, forward: &ForwardDataManager) -> bool {
        self.mark_in(obj, RegionFlags::MARKED, |i| &i.mark_bitmap, forward)
    }

    pub fn resurrect_object(
        &self,
        obj: ObjectRef,
        forward: &ForwardDataManager,
    ) -> bool {
        self.mark_in(
            obj,
            RegionFlags::RESURRECTED,
            |i| &i.resurrect_bitmap,
            forward,
        )
    }

    pub fn enqueue_object(&self, obj: ObjectRef, forward: &ForwardDataManager) -> bool {
        self.mark_in(obj, RegionFlags::ENQUEUED, |i| &i.enqueue_bitmap, forward)
    }

    fn test_in(
        &self,
        obj: ObjectRef,
        flag: RegionFlags,
        bitmap: impl Fn(&LiveInfo) -> Option<&RegionBitmap>,
    ) -> bool {
        if self.is_large_region() {
            return self.has_flag(flag);
        }
        self.live_info()
            .and_then(bitmap)
            .is_some_and(|b| b.is_marked(obj.addr() - self.start()))
    }

    pub fn is_marked_object(&self, obj: ObjectRef) -> bool {
        self.test_in(obj, RegionFlags::MARKED, LiveInfo::mark_bitmap)
    }

    pub fn is_resurrected_object(&self, obj: ObjectRef) -> bool {
        self.test_in(obj, RegionFlags::RESURRECTED, LiveInfo::resurrect_bitmap)
    }

    pub fn is_enqueued_object(&self, obj: ObjectRef) -> bool {
        self.test_in(obj, RegionFlags::ENQUEUED, LiveInfo::enqueue_bitmap)
    }

    /// Marked or resurrected.
    #[inline]
    pub fn is_survived_object(&self, obj: ObjectRef) -> bool {
        self.is_marked_object(obj) || self.is_resurrected_object(obj)
    }

    /// Live bytes in front of `addr` according to the ghost snapshot.
    pub fn ghost_pre_live_bytes(&self, addr: usize) -> usize {
        let info = self.live_info0();
        if info.is_null() || info as usize == TEMPORARY_PTR {
            return 0;
        }
        // SAFETY: ghost live info stays mapped until the ghost is dispelled
        unsafe { (*info).pre_live_bytes(addr - self.start()) }
    }

    /// Detaches `info` if this region is still bound to it.
    pub fn check_and_clear_live_info(&self, info: *mut LiveInfo) {
        if self.region_type() == RegionType::Garbage {
            return;
        }
        if self
            .live_info_slot()
            .compare_exchange(info, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.reset_live_bytes();
        }
    }

    pub fn clear_live_info(&self) {
        self.live_info_slot().store(ptr::null_mut(), Ordering::Release);
        self.reset_live_bytes();
    }

    /// Calls `f` on every surviving object until it returns false. Returns
    /// whether every call returned true.
    pub fn visit_live_objects_until_false(
        &self,
        mut f: impl FnMut(ObjectRef) -> bool,
    ) -> bool {
        if self.live_bytes() == 0 {
            return true;
        }
        let mut all = true;
        let mut pos = self.start();
        let end = self.alloc_ptr();
        while pos < end {
            let obj = ObjectRef::from_addr(pos);
            // SAFETY: objects are laid out back to back up to alloc_ptr
            let size = unsafe { obj.size() };
            crate::heap_check!(size > 0, "zero-sized object at {pos:#x}");
            if self.is_survived_object(obj) && !f(obj) {
                all = false;
                break;
            }
            pos += size;
        }
        all
    }
}
