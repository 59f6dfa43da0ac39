//! The safepoint page pair.
//!
//! Every mutator holds a slot with the address of the page it polls. The
//! first page is readable; the second is mapped `PROT_NONE`. Activating a
//! mutator's safepoint swaps its slot to the trap page, so the next poll
//! faults and the embedder's signal handler can divert the thread into
//! [`crate::Mutator::handle_suspension_request`].

use crate::{
    HeapError,
    mem_map::MemMap,
    system::{OS_PAGE_SIZE, Protection},
};

#[derive(Debug)]
pub struct SafepointPage {
    map: MemMap,
}

impl SafepointPage {
    pub fn new() -> Result<Self, HeapError> {
        let map = MemMap::map(2 * OS_PAGE_SIZE, "safepoint")?;
        map.protect(map.start() + OS_PAGE_SIZE, OS_PAGE_SIZE, Protection::None);
        Ok(Self { map })
    }

    /// The page a mutator polls while nothing is pending.
    #[inline(always)]
    pub fn normal_page(&self) -> usize {
        self.map.start()
    }

    #[inline(always)]
    pub fn trap_page(&self) -> usize {
        self.map.start() + OS_PAGE_SIZE
    }

    /// Whether a fault at `addr` came from polling an active safepoint.
    #[inline]
    pub fn is_trap(&self, addr: usize) -> bool {
        addr >= self.trap_page() && addr < self.trap_page() + OS_PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pages_are_adjacent() {
        let page = SafepointPage::new().expect("safepoint page");
        assert_eq!(page.trap_page() - page.normal_page(), OS_PAGE_SIZE);
        assert!(page.is_trap(page.trap_page()));
        assert!(page.is_trap(page.trap_page() + 8));
        assert!(!page.is_trap(page.normal_page()));
        // the normal page is readable
        let byte = unsafe { std::ptr::read_volatile(page.normal_page() as *const u8) };
        assert_eq!(byte, 0);
    }
}
