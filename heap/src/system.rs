use std::ptr::NonNull;

#[cfg(unix)]
#[allow(unused)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_NONE: i32 = 0x0;
    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    #[cfg(target_os = "linux")]
    pub const MAP_NORESERVE: i32 = 0x4000;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_NORESERVE: i32 = 0x40;

    pub const MAP_FAILED: isize = -1;

    pub const MADV_DONTNEED: i32 = 4;

    /// posix mmap, munmap, mprotect and madvise
    /// # Safety
    /// see valid mmap and munmap usage online
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;

        pub fn mprotect(addr: *mut c_void, length: usize, prot: i32) -> i32;

        pub fn madvise(addr: *mut c_void, length: usize, advice: i32) -> i32;
    }

    /// posix memory allocation using mmap
    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn anonymous_mmap(len: usize, prot: i32, flags: i32) -> *mut u8 {
        // SAFETY: safe if contract holds
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                prot,
                MAP_PRIVATE | MAP_ANON | flags,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// posix memory deallocation using munmap
    /// # Safety
    /// must be allocated by mmmap
    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

/// Access rights of a mapped range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    None,
    Read,
    ReadWrite,
}

impl Protection {
    fn bits(self) -> i32 {
        match self {
            Protection::None => unix::PROT_NONE,
            Protection::Read => unix::PROT_READ,
            Protection::ReadWrite => unix::PROT_READ | unix::PROT_WRITE,
        }
    }
}

#[inline]
pub const fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: this is safe
    let ptr = unsafe {
        unix::anonymous_mmap(size, Protection::ReadWrite.bits(), 0)
    };
    NonNull::new(ptr)
}

/// Maps `size` bytes without reserving swap. Pages are only backed once
/// they are touched.
#[must_use]
pub fn reserve_memory(size: usize, prot: Protection) -> Option<NonNull<u8>> {
    // SAFETY: fresh anonymous mapping, checked for failure below
    let ptr = unsafe {
        unix::anonymous_mmap(size, prot.bits(), unix::MAP_NORESERVE)
    };
    NonNull::new(ptr)
}

pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr must be from mmap allocation
    unsafe { unix::anonymous_munmap(ptr.as_ptr(), size) };
}

/// Changes the protection of a page-aligned range.
pub fn protect_memory(ptr: NonNull<u8>, size: usize, prot: Protection) -> bool {
    // SAFETY: caller passes a range inside a live mapping
    unsafe { unix::mprotect(ptr.as_ptr().cast(), size, prot.bits()) == 0 }
}

/// Returns the physical pages of a range to the OS. Anonymous private
/// pages read back as zero afterwards.
pub fn release_memory(ptr: NonNull<u8>, size: usize) -> bool {
    // SAFETY: caller passes a range inside a live mapping
    unsafe {
        unix::madvise(ptr.as_ptr().cast(), size, unix::MADV_DONTNEED) == 0
    }
}

pub fn last_os_error() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_memory_zeroes_pages() {
        let size = OS_PAGE_SIZE * 2;
        let ptr = map_memory(size).expect("map");
        unsafe { ptr.as_ptr().write_bytes(0xAB, size) };
        assert!(release_memory(ptr, size));
        let first = unsafe { *ptr.as_ptr() };
        let last = unsafe { *ptr.as_ptr().add(size - 1) };
        assert_eq!(first, 0);
        assert_eq!(last, 0);
        unmap_memory(ptr, size);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(1, OS_PAGE_SIZE), OS_PAGE_SIZE);
        assert_eq!(round_up(OS_PAGE_SIZE, OS_PAGE_SIZE), OS_PAGE_SIZE);
        assert_eq!(round_up(0, 8), 0);
        assert_eq!(round_up(9, 8), 16);
    }
}
