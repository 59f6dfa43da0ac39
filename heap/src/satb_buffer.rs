//! Snapshot-at-the-beginning buffer.
//!
//! Mutators remember overwritten referents in fixed-size nodes while the
//! collector traces. Full nodes are retired to a lock-free list the
//! collector drains; drained nodes go back to the free list.

use std::{
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicU64, Ordering},
};

use parking_lot::Mutex;

use crate::{
    HeapError,
    object::ObjectRef,
    page_pool::PagePool,
    region_manager::RegionManager,
    system::{self, OS_PAGE_SIZE},
};

pub const SATB_NODE_CAPACITY: usize = 64;
const CACHE_LINE: usize = 64;
/// The pool grows past its reservation through fresh mappings.
const POOL_PAGES_PER_INITIAL_PAGE: usize = 4;

struct NodeSlots {
    len: usize,
    objects: [usize; SATB_NODE_CAPACITY],
}

/// A fixed-capacity batch of remembered objects.
///
/// The owning mutator pushes, the collector may drain a node that is still
/// in use, so the slots sit behind a lock.
pub struct SatbNode {
    next: AtomicPtr<SatbNode>,
    slots: Mutex<NodeSlots>,
}

impl SatbNode {
    const STRIDE: usize = system::round_up(mem::size_of::<SatbNode>(), CACHE_LINE);

    fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            slots: Mutex::new(NodeSlots {
                len: 0,
                objects: [0; SATB_NODE_CAPACITY],
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().len == 0
    }

    pub fn is_full(&self) -> bool {
        self.slots.lock().len == SATB_NODE_CAPACITY
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len
    }

    /// Appends `obj`. Returns false if the node is full.
    pub fn push(&self, obj: ObjectRef) -> bool {
        let mut slots = self.slots.lock();
        if slots.len == SATB_NODE_CAPACITY {
            return false;
        }
        let len = slots.len;
        slots.objects[len] = obj.addr();
        slots.len += 1;
        true
    }

    /// Moves the remembered objects into `out` and empties the node.
    pub fn drain_into(&self, out: &mut Vec<ObjectRef>) {
        let mut slots = self.slots.lock();
        let len = slots.len;
        out.extend(slots.objects[..len].iter().map(|&a| ObjectRef::from_addr(a)));
        slots.objects[..len].fill(0);
        slots.len = 0;
    }

    pub fn clear(&self) {
        let mut slots = self.slots.lock();
        let len = slots.len;
        slots.objects[..len].fill(0);
        slots.len = 0;
    }
}

// ── Lock-free node stack ──────────────────────────────────────────────

/// Treiber stack of nodes. The head carries a 16-bit stamp above the
/// 48-bit node address so a pop cannot succeed on a recycled head.
struct NodeStack {
    head: AtomicU64,
}

impl NodeStack {
    const PTR_MASK: u64 = (1 << 48) - 1;
    const STAMP_SHIFT: u32 = 48;

    const fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    fn unpack(word: u64) -> (*mut SatbNode, u64) {
        (
            (word & Self::PTR_MASK) as *mut SatbNode,
            word >> Self::STAMP_SHIFT,
        )
    }

    #[inline(always)]
    fn pack(node: *mut SatbNode, stamp: u64) -> u64 {
        (node as u64 & Self::PTR_MASK) | ((stamp & 0xFFFF) << Self::STAMP_SHIFT)
    }

    fn push(&self, node: NonNull<SatbNode>) {
        let mut cur = self.head.load(Ordering::Acquire);
        loop {
            let (top, stamp) = Self::unpack(cur);
            // SAFETY: nodes live in pages owned by the buffer
            unsafe { node.as_ref() }.next.store(top, Ordering::Relaxed);
            let new = Self::pack(node.as_ptr(), stamp + 1);
            match self.head.compare_exchange_weak(
                cur,
                new,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    fn pop(&self) -> Option<NonNull<SatbNode>> {
        let mut cur = self.head.load(Ordering::Acquire);
        loop {
            let (top, stamp) = Self::unpack(cur);
            let top = NonNull::new(top)?;
            // SAFETY: nodes are never unmapped while the lists are in use
            let next = unsafe { top.as_ref() }.next.load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                cur,
                Self::pack(next, stamp + 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // SAFETY: popped, owned by the caller now
                    unsafe { top.as_ref() }
                        .next
                        .store(ptr::null_mut(), Ordering::Relaxed);
                    return Some(top);
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Detaches the whole chain. Walk it through `next`.
    fn pop_all(&self) -> *mut SatbNode {
        let mut cur = self.head.load(Ordering::Acquire);
        loop {
            let (top, stamp) = Self::unpack(cur);
            match self.head.compare_exchange_weak(
                cur,
                Self::pack(ptr::null_mut(), stamp + 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return top,
                Err(actual) => cur = actual,
            }
        }
    }

    fn is_empty(&self) -> bool {
        Self::unpack(self.head.load(Ordering::Acquire)).0.is_null()
    }

    fn reset(&self) {
        self.head.store(0, Ordering::Release);
    }
}

/// Walks a chain detached by [`NodeStack::pop_all`]. `next` is read before
/// `f` runs, so `f` may push the node elsewhere.
fn for_each_in_chain(mut head: *mut SatbNode, mut f: impl FnMut(NonNull<SatbNode>)) {
    while let Some(node) = NonNull::new(head) {
        // SAFETY: chain members are valid nodes
        head = unsafe { node.as_ref() }.next.load(Ordering::Relaxed);
        f(node);
    }
}

// ── SatbBuffer ────────────────────────────────────────────────────────

pub struct SatbBuffer {
    pool: PagePool,
    initial_bytes: usize,
    /// Every page carved into nodes, as (address, bytes).
    pages: Mutex<Vec<(usize, usize)>>,
    free_nodes: NodeStack,
    retired_nodes: NodeStack,
}

// SAFETY: nodes are shared through the lock-free stacks and their own locks
unsafe impl Send for SatbBuffer {}
// SAFETY: see above
unsafe impl Sync for SatbBuffer {}

impl SatbBuffer {
    pub fn new(initial_pages: usize) -> Result<Self, HeapError> {
        let initial_pages = initial_pages.max(1);
        let pool = PagePool::new(
            "satb-buffer",
            initial_pages * POOL_PAGES_PER_INITIAL_PAGE,
        )?;
        let buffer = Self {
            pool,
            initial_bytes: initial_pages * OS_PAGE_SIZE,
            pages: Mutex::new(Vec::new()),
            free_nodes: NodeStack::new(),
            retired_nodes: NodeStack::new(),
        };
        buffer.init();
        Ok(buffer)
    }

    /// Recycles the retired nodes and makes sure free nodes exist. Must not
    /// race with mutators.
    pub fn init(&self) {
        self.recycle_retired(|_| {});
        if self.free_nodes.is_empty() {
            self.carve_page(self.initial_bytes);
        }
    }

    /// Returns a node with room for one more object: `node` itself if it
    /// has room, otherwise a free one. A full `node` is retired.
    pub fn ensure_good_node(&self, node: *mut SatbNode) -> NonNull<SatbNode> {
        if let Some(node) = NonNull::new(node) {
            // SAFETY: mutators only hold nodes handed out by this buffer
            if !unsafe { node.as_ref() }.is_full() {
                return node;
            }
            self.retired_nodes.push(node);
        }
        loop {
            if let Some(fresh) = self.free_nodes.pop() {
                // SAFETY: just popped
                crate::heap_check!(
                    unsafe { fresh.as_ref() }.is_empty(),
                    "satb free list holds a non-empty node"
                );
                return fresh;
            }
            self.carve_page(OS_PAGE_SIZE);
        }
    }

    pub fn retire_node(&self, node: NonNull<SatbNode>) {
        self.retired_nodes.push(node);
    }

    /// Moves the objects of every retired node into `out`.
    pub fn get_retired_objects(&self, out: &mut Vec<ObjectRef>) {
        self.recycle_retired(|node| node.drain_into(out));
    }

    /// Drops every retired node without looking at its objects.
    pub fn clear_buffer(&self) {
        self.recycle_retired(|_| {});
    }

    fn recycle_retired(&self, mut f: impl FnMut(&SatbNode)) {
        let chain = self.retired_nodes.pop_all();
        for_each_in_chain(chain, |node| {
            // SAFETY: detached from the retired list, owned here
            let n = unsafe { node.as_ref() };
            f(n);
            n.clear();
            self.free_nodes.push(node);
        });
    }

    /// Gives every page back to the pool. No mutator may hold a node.
    pub fn reclaim_all_pages(&self) {
        self.free_nodes.reset();
        self.retired_nodes.reset();
        let pages = mem::take(&mut *self.pages.lock());
        for (addr, bytes) in pages {
            // SAFETY: the address came from get_page
            let page = unsafe { NonNull::new_unchecked(addr as *mut u8) };
            self.pool.return_page(page, bytes);
        }
    }

    pub fn free_node_count(&self) -> usize {
        let chain = self.free_nodes.pop_all();
        let mut count = 0;
        let mut nodes = Vec::new();
        for_each_in_chain(chain, |n| {
            count += 1;
            nodes.push(n);
        });
        for node in nodes.into_iter().rev() {
            self.free_nodes.push(node);
        }
        count
    }

    fn carve_page(&self, bytes: usize) {
        let page = self.pool.get_page(bytes);
        let start = page.as_ptr() as usize;
        self.pages.lock().push((start, bytes));
        let mut pos = start;
        let mut carved = 0;
        while pos + SatbNode::STRIDE <= start + bytes {
            let node = pos as *mut SatbNode;
            // SAFETY: fresh page memory at cache-line stride
            unsafe { node.write(SatbNode::new()) };
            // SAFETY: just written
            self.free_nodes.push(unsafe { NonNull::new_unchecked(node) });
            pos += SatbNode::STRIDE;
            carved += 1;
        }
        log::trace!("satb buffer carved {carved} nodes from {bytes} bytes");
    }

    /// Whether a mutator should remember `obj`: a heap object that is
    /// neither in a trace region, nor marked, nor enqueued before.
    pub fn should_enqueue(regions: &RegionManager, obj: ObjectRef) -> bool {
        if obj.is_null() || !regions.is_heap_address(obj.addr()) {
            return false;
        }
        if regions.is_in_trace_region(obj) || regions.is_marked_object(obj) {
            return false;
        }
        !regions.enqueue_object(obj)
    }
}

impl Drop for SatbBuffer {
    fn drop(&mut self) {
        self.reclaim_all_pages();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{Arc, Barrier},
        thread,
    };

    fn obj(i: usize) -> ObjectRef {
        ObjectRef::from_addr(0x10_0000 + i * 16)
    }

    #[test]
    fn test_node_fills_then_retires() {
        let buffer = SatbBuffer::new(1).unwrap();
        let mut node = ptr::null_mut();
        for i in 0..SATB_NODE_CAPACITY + 3 {
            let good = buffer.ensure_good_node(node);
            assert!(unsafe { good.as_ref() }.push(obj(i)));
            node = good.as_ptr();
        }
        assert_eq!(unsafe { &*node }.len(), 3);

        let mut out = Vec::new();
        buffer.get_retired_objects(&mut out);
        assert_eq!(out.len(), SATB_NODE_CAPACITY);
        assert_eq!(out[0], obj(0));

        // the current node is drained separately
        unsafe { &*node }.drain_into(&mut out);
        assert_eq!(out.len(), SATB_NODE_CAPACITY + 3);
        assert!(unsafe { &*node }.is_empty());
    }

    #[test]
    fn test_clear_buffer_recycles_nodes() {
        let buffer = SatbBuffer::new(1).unwrap();
        let before = buffer.free_node_count();
        let node = buffer.ensure_good_node(ptr::null_mut());
        unsafe { node.as_ref() }.push(obj(1));
        buffer.retire_node(node);
        assert_eq!(buffer.free_node_count(), before - 1);

        buffer.clear_buffer();
        assert_eq!(buffer.free_node_count(), before);
        let mut out = Vec::new();
        buffer.get_retired_objects(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_grows_past_initial_pages() {
        let buffer = SatbBuffer::new(1).unwrap();
        let per_page = buffer.free_node_count();
        let taken: Vec<_> = (0..per_page * 3)
            .map(|_| buffer.ensure_good_node(ptr::null_mut()))
            .collect();
        assert_eq!(taken.len(), per_page * 3);
        assert!(buffer.pages.lock().len() >= 3);
        for node in taken {
            buffer.retire_node(node);
        }
        buffer.init();
        assert!(buffer.free_node_count() >= per_page * 3);
    }

    #[test]
    fn test_concurrent_remembering_loses_nothing() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 5_000;
        let buffer = Arc::new(SatbBuffer::new(2).unwrap());
        let start = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let buffer = buffer.clone();
                let start = start.clone();
                thread::spawn(move || {
                    start.wait();
                    let mut node = ptr::null_mut();
                    for i in 0..PER_THREAD {
                        let good = buffer.ensure_good_node(node);
                        unsafe { good.as_ref() }.push(obj(t * PER_THREAD + i));
                        node = good.as_ptr();
                    }
                    if let Some(node) = NonNull::new(node) {
                        buffer.retire_node(node);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut out = Vec::new();
        buffer.get_retired_objects(&mut out);
        out.sort();
        out.dedup();
        assert_eq!(out.len(), THREADS * PER_THREAD);
    }
}
