//! Object model contract between the heap and its embedder.
//!
//! Every heap object starts with a [`BaseObject`] header word holding the
//! object size, an embedder type id and the forwarding state. Reference
//! slots are [`RefField`]s: atomic words that may carry a collector tag
//! next to the address.

use std::sync::atomic::{AtomicU64, Ordering};

// ── Layout constants ──────────────────────────────────────────────────

pub const HEADER_SIZE: usize = 8;
/// Header plus the length word of an array.
pub const ARRAY_HEADER_SIZE: usize = 16;
pub const OBJECT_ALIGNMENT: usize = 8;

#[inline(always)]
pub const fn align_object(size: usize) -> usize {
    (size + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
}

// ── Object state ──────────────────────────────────────────────────────

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Normal = 0,
    /// A thread is copying the object.
    Locked = 1,
    /// The copy is complete; the route of the region gives its address.
    Forwarded = 2,
}

impl From<u64> for ObjectState {
    fn from(val: u64) -> Self {
        match val {
            1 => ObjectState::Locked,
            2 => ObjectState::Forwarded,
            _ => ObjectState::Normal,
        }
    }
}

/// The header word of every heap object.
///
/// Layout: `[ state:2 | unused:14 | type id:16 | size:32 ]`, most
/// significant first.
#[repr(C)]
#[derive(Debug)]
pub struct BaseObject {
    header: AtomicU64,
}

impl BaseObject {
    const SIZE_MASK: u64 = u32::MAX as u64;
    const TYPE_SHIFT: u32 = 32;
    const TYPE_MASK: u64 = u16::MAX as u64;
    const STATE_SHIFT: u32 = 62;
    const STATE_MASK: u64 = 0b11 << Self::STATE_SHIFT;

    #[inline(always)]
    pub const fn encode(size: u32, type_id: u16) -> u64 {
        (size as u64) | ((type_id as u64) << Self::TYPE_SHIFT)
    }

    /// Writes a fresh header. The memory must not be visible to other
    /// threads yet.
    #[inline(always)]
    pub fn init(&self, size: u32, type_id: u16) {
        self.header
            .store(Self::encode(size, type_id), Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn word(&self) -> u64 {
        self.header.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        (self.header.load(Ordering::Relaxed) & Self::SIZE_MASK) as usize
    }

    #[inline(always)]
    pub fn type_id(&self) -> u16 {
        ((self.header.load(Ordering::Relaxed) >> Self::TYPE_SHIFT)
            & Self::TYPE_MASK) as u16
    }

    #[inline(always)]
    pub fn state(&self) -> ObjectState {
        ObjectState::from(self.header.load(Ordering::Acquire) >> Self::STATE_SHIFT)
    }

    #[inline(always)]
    pub fn set_state(&self, state: ObjectState) {
        let mut cur = self.header.load(Ordering::Relaxed);
        loop {
            let next = (cur & !Self::STATE_MASK)
                | ((state as u64) << Self::STATE_SHIFT);
            match self.header.compare_exchange_weak(
                cur,
                next,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Moves the object from `NORMAL` to `LOCKED`. Returns false if another
    /// thread got there first or the object is already forwarded.
    #[inline(always)]
    pub fn try_lock(&self) -> bool {
        let cur = self.header.load(Ordering::Acquire);
        if ObjectState::from(cur >> Self::STATE_SHIFT) != ObjectState::Normal {
            return false;
        }
        let locked = (cur & !Self::STATE_MASK)
            | ((ObjectState::Locked as u64) << Self::STATE_SHIFT);
        self.header
            .compare_exchange(cur, locked, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

// ── ObjectRef ─────────────────────────────────────────────────────────

/// Untagged address of a heap object (or of nothing, see
/// [`ObjectRef::NULL`]).
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectRef(usize);

impl ObjectRef {
    pub const NULL: ObjectRef = ObjectRef(0);

    #[inline(always)]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    #[inline(always)]
    pub const fn addr(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }

    /// # Safety
    /// `self` must point to a live object.
    #[inline(always)]
    pub unsafe fn header<'a>(self) -> &'a BaseObject {
        // SAFETY: guaranteed by caller
        unsafe { &*(self.0 as *const BaseObject) }
    }

    /// # Safety
    /// `self` must point to a live object.
    #[inline(always)]
    pub unsafe fn size(self) -> usize {
        // SAFETY: guaranteed by caller
        unsafe { self.header().size() }
    }

    /// # Safety
    /// `self` must point to a live object.
    #[inline(always)]
    pub unsafe fn type_id(self) -> u16 {
        // SAFETY: guaranteed by caller
        unsafe { self.header().type_id() }
    }

    /// The reference slot `offset` bytes into the object.
    ///
    /// # Safety
    /// `self` must point to a live object with a reference slot at `offset`.
    #[inline(always)]
    pub unsafe fn field<'a>(self, offset: usize) -> &'a RefField {
        debug_assert!(offset.is_multiple_of(OBJECT_ALIGNMENT));
        // SAFETY: guaranteed by caller
        unsafe { RefField::from_addr(self.0 + offset) }
    }

    /// # Safety
    /// `self` must point to a live array.
    #[inline(always)]
    pub unsafe fn array_length(self) -> usize {
        // SAFETY: the length word follows the header
        unsafe { *((self.0 + HEADER_SIZE) as *const u64) as usize }
    }

    /// Start of the array elements.
    #[inline(always)]
    pub fn array_data(self) -> *mut u8 {
        (self.0 + ARRAY_HEADER_SIZE) as *mut u8
    }

    /// Reference element `index` of an array of references.
    ///
    /// # Safety
    /// `self` must point to a live array of references longer than `index`.
    #[inline(always)]
    pub unsafe fn array_ref<'a>(self, index: usize) -> &'a RefField {
        // SAFETY: guaranteed by caller
        unsafe { RefField::from_addr(self.0 + ARRAY_HEADER_SIZE + index * 8) }
    }
}

// ── Reference words ───────────────────────────────────────────────────

/// Value of a reference slot.
///
/// Layout: bits 0..48 address, bit 48 tagged, bit 49 tag id. A tagged word
/// points into a from-region of the cycle named by its tag id and must be
/// resolved before use.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefWord(u64);

impl RefWord {
    pub const ADDRESS_MASK: u64 = (1 << 48) - 1;
    const TAGGED_BIT: u64 = 1 << 48;
    const TAG_ID_SHIFT: u32 = 49;
    pub const NULL: RefWord = RefWord(0);

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub fn untagged(obj: ObjectRef) -> Self {
        debug_assert!(obj.addr() as u64 & !Self::ADDRESS_MASK == 0);
        Self(obj.addr() as u64)
    }

    #[inline(always)]
    pub fn tagged(obj: ObjectRef, tag_id: u8) -> Self {
        debug_assert!(tag_id <= 1);
        Self(
            (obj.addr() as u64 & Self::ADDRESS_MASK)
                | Self::TAGGED_BIT
                | ((tag_id as u64) << Self::TAG_ID_SHIFT),
        )
    }

    #[inline(always)]
    pub const fn is_tagged(self) -> bool {
        self.0 & Self::TAGGED_BIT != 0
    }

    #[inline(always)]
    pub const fn tag_id(self) -> u8 {
        ((self.0 >> Self::TAG_ID_SHIFT) & 1) as u8
    }

    #[inline(always)]
    pub const fn target(self) -> ObjectRef {
        ObjectRef((self.0 & Self::ADDRESS_MASK) as usize)
    }
}

/// An atomic reference slot inside an object, an array or a root table.
#[repr(transparent)]
#[derive(Debug, Default)]
pub struct RefField(AtomicU64);

impl RefField {
    pub const fn new(word: RefWord) -> Self {
        Self(AtomicU64::new(word.raw()))
    }

    /// # Safety
    /// `addr` must be an 8-aligned slot that stays valid for `'a`.
    #[inline(always)]
    pub unsafe fn from_addr<'a>(addr: usize) -> &'a RefField {
        // SAFETY: guaranteed by caller
        unsafe { &*(addr as *const RefField) }
    }

    #[inline(always)]
    pub fn addr(&self) -> usize {
        self as *const RefField as usize
    }

    #[inline(always)]
    pub fn load(&self, order: Ordering) -> RefWord {
        RefWord(self.0.load(order))
    }

    #[inline(always)]
    pub fn word(&self) -> RefWord {
        self.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn target(&self) -> ObjectRef {
        self.word().target()
    }

    #[inline(always)]
    pub fn store(&self, word: RefWord, order: Ordering) {
        self.0.store(word.raw(), order);
    }

    #[inline(always)]
    pub fn set_word(&self, word: RefWord) {
        self.store(word, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn set_target(&self, obj: ObjectRef) {
        self.store(RefWord::untagged(obj), Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn exchange(&self, word: RefWord, order: Ordering) -> RefWord {
        RefWord(self.0.swap(word.raw(), order))
    }

    /// Sequentially consistent compare-and-swap.
    #[inline(always)]
    pub fn compare_exchange(&self, current: RefWord, new: RefWord) -> bool {
        self.compare_exchange_with(
            current,
            new,
            Ordering::SeqCst,
            Ordering::SeqCst,
        )
    }

    #[inline(always)]
    pub fn compare_exchange_with(
        &self,
        current: RefWord,
        new: RefWord,
        success: Ordering,
        failure: Ordering,
    ) -> bool {
        self.0
            .compare_exchange(current.raw(), new.raw(), success, failure)
            .is_ok()
    }
}

// ── Tracing contract ──────────────────────────────────────────────────

/// Visits every reference field of a heap object.
///
/// Supplied by the embedder. The visitor may update the field in place.
///
/// # Safety
///
/// `obj` must point to a valid, live heap object.
pub type TraceFn = unsafe fn(obj: ObjectRef, visitor: &mut dyn FnMut(&RefField));

/// Reference bitmap of an inline struct: bit `i` set means the 8-byte word
/// at offset `8 * i` is a [`RefField`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcTib {
    bits: Vec<u64>,
    words: usize,
}

impl GcTib {
    /// A layout of `words` 8-byte words, references at `ref_words`.
    pub fn new(words: usize, ref_words: &[usize]) -> Self {
        let mut bits = vec![0u64; words.div_ceil(64)];
        for &w in ref_words {
            debug_assert!(w < words);
            bits[w / 64] |= 1 << (w % 64);
        }
        Self { bits, words }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.words * 8
    }

    #[inline]
    pub fn is_ref(&self, word: usize) -> bool {
        word < self.words && self.bits[word / 64] & (1 << (word % 64)) != 0
    }

    pub fn has_refs(&self) -> bool {
        self.bits.iter().any(|&b| b != 0)
    }

    /// Calls `f` with the byte offset of every reference slot in
    /// `[0, len)`.
    pub fn for_each_ref_offset(&self, len: usize, mut f: impl FnMut(usize)) {
        let words = (len / 8).min(self.words);
        for w in 0..words {
            if self.is_ref(w) {
                f(w * 8);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encoding() {
        let obj = BaseObject {
            header: AtomicU64::new(0),
        };
        obj.init(48, 7);
        assert_eq!(obj.size(), 48);
        assert_eq!(obj.type_id(), 7);
        assert_eq!(obj.state(), ObjectState::Normal);

        assert!(obj.try_lock());
        assert!(!obj.try_lock());
        assert_eq!(obj.state(), ObjectState::Locked);
        obj.set_state(ObjectState::Forwarded);
        assert_eq!(obj.state(), ObjectState::Forwarded);
        assert_eq!(obj.size(), 48);
        assert_eq!(obj.type_id(), 7);
    }

    #[test]
    fn test_ref_word_tagging() {
        let obj = ObjectRef::from_addr(0x7f00_1234_5678);
        let plain = RefWord::untagged(obj);
        assert!(!plain.is_tagged());
        assert_eq!(plain.target(), obj);

        for tag in 0..=1 {
            let word = RefWord::tagged(obj, tag);
            assert!(word.is_tagged());
            assert_eq!(word.tag_id(), tag);
            assert_eq!(word.target(), obj);
        }
    }

    #[test]
    fn test_ref_field_cas() {
        let a = ObjectRef::from_addr(0x1000);
        let b = ObjectRef::from_addr(0x2000);
        let field = RefField::new(RefWord::tagged(a, 1));
        assert!(!field.compare_exchange(RefWord::untagged(a), RefWord::untagged(b)));
        assert!(field.compare_exchange(RefWord::tagged(a, 1), RefWord::untagged(b)));
        assert_eq!(field.target(), b);
        assert!(!field.word().is_tagged());
    }

    #[test]
    fn test_gc_tib_offsets() {
        let tib = GcTib::new(70, &[0, 3, 65]);
        let mut offsets = Vec::new();
        tib.for_each_ref_offset(tib.size(), |off| offsets.push(off));
        assert_eq!(offsets, vec![0, 24, 520]);
        assert!(tib.has_refs());
        assert!(!GcTib::new(4, &[]).has_refs());

        offsets.clear();
        tib.for_each_ref_offset(32, |off| offsets.push(off));
        assert_eq!(offsets, vec![0, 24]);
    }
}
