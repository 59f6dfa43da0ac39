use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::{
    HeapError,
    cartesian_tree::CartesianTree,
    mem_map::MemMap,
    system::{self, OS_PAGE_SIZE},
};

/// Hands out page multiples from one reserved range.
///
/// Returned pages are released to the OS and merged back into a free-interval
/// tree, so a later request of the same size reuses them. When the reserved
/// range is used up, requests fall back to fresh mappings, which are unmapped
/// again on return.
pub struct PagePool {
    name: &'static str,
    map: MemMap,
    total_pages: usize,
    state: Mutex<PoolState>,
}

struct PoolState {
    free: CartesianTree,
    /// Pages below this index have been handed out at least once.
    cursor: usize,
}

impl PagePool {
    pub fn new(name: &'static str, total_pages: usize) -> Result<Self, HeapError> {
        let map = MemMap::map(total_pages * OS_PAGE_SIZE, name)?;
        Ok(Self {
            name,
            map,
            total_pages,
            state: Mutex::new(PoolState {
                free: CartesianTree::with_capacity(total_pages),
                cursor: 0,
            }),
        })
    }

    #[inline]
    fn page_address(&self, index: usize) -> usize {
        self.map.start() + index * OS_PAGE_SIZE
    }

    /// Returns zeroed memory of at least `bytes` bytes, page aligned.
    /// Aborts if the OS refuses to map more memory.
    pub fn get_page(&self, bytes: usize) -> NonNull<u8> {
        let size = system::round_up(bytes.max(1), OS_PAGE_SIZE);
        let pages = size / OS_PAGE_SIZE;

        {
            let mut state = self.state.lock();
            if let Some(index) = state.free.take_units(pages as u32) {
                let addr = self.page_address(index as usize);
                // SAFETY: inside our own mapping
                return unsafe { NonNull::new_unchecked(addr as *mut u8) };
            }
            if state.cursor + pages <= self.total_pages {
                let addr = self.page_address(state.cursor);
                state.cursor += pages;
                // SAFETY: inside our own mapping
                return unsafe { NonNull::new_unchecked(addr as *mut u8) };
            }
        }

        log::debug!("{}: pool exhausted, mapping {size:#x} bytes", self.name);
        match system::map_memory(size) {
            Some(ptr) => ptr,
            None => crate::fatal!(
                "{}: failed to map {size:#x} bytes, errno {}",
                self.name,
                system::last_os_error()
            ),
        }
    }

    /// Gives back memory obtained from [`PagePool::get_page`] with the same
    /// `bytes`.
    pub fn return_page(&self, ptr: NonNull<u8>, bytes: usize) {
        let size = system::round_up(bytes.max(1), OS_PAGE_SIZE);
        let addr = ptr.as_ptr() as usize;
        if !self.map.contains(addr) {
            system::unmap_memory(ptr, size);
            return;
        }

        self.map.release(addr, size);
        let index = ((addr - self.map.start()) / OS_PAGE_SIZE) as u32;
        let pages = (size / OS_PAGE_SIZE) as u32;
        let mut state = self.state.lock();
        if let Err(err) = state.free.merge_insert(index, pages) {
            crate::fatal!("{}: return of {addr:#x}+{size:#x}: {err}", self.name);
        }
    }

    pub fn free_pages(&self) -> usize {
        let state = self.state.lock();
        state.free.total_count() + (self.total_pages - state.cursor)
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.map.contains(addr)
    }
}
