use std::ptr::NonNull;

use crate::{
    HeapError,
    system::{self, OS_PAGE_SIZE, Protection},
};

/// An owned anonymous mapping, unmapped on drop.
///
/// The range is reserved without swap; pages are committed lazily on first
/// touch and can be handed back with [`MemMap::release`].
#[derive(Debug)]
pub struct MemMap {
    base: NonNull<u8>,
    size: usize,
    tag: &'static str,
}

// SAFETY: the mapping is plain memory; synchronization of its contents is
// up to the owners of the addresses handed out.
unsafe impl Send for MemMap {}
// SAFETY: see above
unsafe impl Sync for MemMap {}

impl MemMap {
    /// Reserves `size` bytes (rounded up to pages) readable and writable.
    pub fn map(size: usize, tag: &'static str) -> Result<Self, HeapError> {
        Self::map_with(size, tag, Protection::ReadWrite)
    }

    pub fn map_with(
        size: usize,
        tag: &'static str,
        prot: Protection,
    ) -> Result<Self, HeapError> {
        let size = system::round_up(size.max(1), OS_PAGE_SIZE);
        match system::reserve_memory(size, prot) {
            Some(base) => {
                log::trace!("mapped {tag} [{:p}, +{size:#x})", base.as_ptr());
                Ok(Self { base, size, tag })
            }
            None => Err(HeapError::MapFailed {
                size,
                errno: system::last_os_error(),
            }),
        }
    }

    #[inline(always)]
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline(always)]
    pub fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.start() + self.size
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start() && addr < self.end()
    }

    /// Gives the physical pages of `[addr, addr + len)` back to the OS.
    /// The range reads as zero afterwards.
    pub fn release(&self, addr: usize, len: usize) {
        debug_assert!(addr.is_multiple_of(OS_PAGE_SIZE));
        debug_assert!(addr >= self.start() && addr + len <= self.end());
        let Some(ptr) = NonNull::new(addr as *mut u8) else {
            return;
        };
        if !system::release_memory(ptr, len) {
            // SAFETY: range lies inside this mapping
            unsafe { ptr.as_ptr().write_bytes(0, len) };
        }
    }

    /// Changes protection of a page-aligned subrange.
    pub fn protect(&self, addr: usize, len: usize, prot: Protection) {
        debug_assert!(addr >= self.start() && addr + len <= self.end());
        let Some(ptr) = NonNull::new(addr as *mut u8) else {
            return;
        };
        if !system::protect_memory(ptr, len, prot) {
            crate::fatal!(
                "mprotect {} [{addr:#x}, +{len:#x}) failed, errno {}",
                self.tag,
                system::last_os_error()
            );
        }
    }
}

impl Drop for MemMap {
    fn drop(&mut self) {
        system::unmap_memory(self.base, self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rounds_to_pages() {
        let map = MemMap::map(10, "test").expect("map");
        assert_eq!(map.size(), OS_PAGE_SIZE);
        assert!(map.start().is_multiple_of(OS_PAGE_SIZE));
        assert!(map.contains(map.start()));
        assert!(!map.contains(map.end()));
    }

    #[test]
    fn test_release_reads_zero() {
        let map = MemMap::map(OS_PAGE_SIZE * 4, "test").expect("map");
        unsafe { map.base().write_bytes(7, map.size()) };
        map.release(map.start() + OS_PAGE_SIZE, OS_PAGE_SIZE);
        unsafe {
            assert_eq!(*map.base(), 7);
            assert_eq!(*map.base().add(OS_PAGE_SIZE), 0);
            assert_eq!(*map.base().add(2 * OS_PAGE_SIZE), 7);
        }
    }
}
