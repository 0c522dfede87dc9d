//! Page mappings backing segment storage.

use std::ptr::NonNull;

#[cfg(unix)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    pub const MAP_FAILED: isize = -1;

    // Only ever called through `anonymous_mmap`/`anonymous_munmap`, one
    // private mapping per segment.
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
    }

    /// Maps `len` zero-filled bytes for one segment's blocks.
    /// # Safety
    /// `len` must be non-zero. Returns null if the kernel refuses.
    #[inline]
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        // SAFETY: no fixed address and no file, so nothing else is affected
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
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

    /// Returns a segment's pages to the OS.
    /// # Safety
    /// `ptr` and `len` must describe a live mapping from `anonymous_mmap`.
    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        // SAFETY: forwarded from the caller
        let _ = unsafe { munmap(ptr.cast(), len) };
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

#[cfg(unix)]
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: `SegmentMemory::map` rejects zero sizes
    let ptr = unsafe { unix::anonymous_mmap(size) };
    NonNull::new(ptr)
}

#[cfg(unix)]
pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: only called from `SegmentMemory::drop` with its own mapping
    unsafe { unix::anonymous_munmap(ptr.as_ptr(), size) };
}

#[cfg(not(unix))]
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    let layout =
        std::alloc::Layout::from_size_align(size, OS_PAGE_SIZE).ok()?;
    // SAFETY: size is non-zero, checked by the settings
    NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
}

#[cfg(not(unix))]
pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: same layout as in `map_memory`
    unsafe {
        let layout =
            std::alloc::Layout::from_size_align_unchecked(size, OS_PAGE_SIZE);
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

/// Block storage of one segment, backed by its own anonymous mapping.
///
/// Released back to the OS when dropped.
#[derive(Debug)]
pub struct SegmentMemory {
    start: NonNull<u8>,
    size: usize,
}

// SAFETY: the mapping is owned by exactly one `SegmentStorage`, which only
// hands it out under its lock.
unsafe impl Send for SegmentMemory {}
// SAFETY: shared access is read-only.
unsafe impl Sync for SegmentMemory {}

impl SegmentMemory {
    /// Maps `size` fresh, zeroed bytes.
    #[must_use]
    pub fn map(size: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let start = map_memory(size)?;
        debug_assert!((start.as_ptr() as usize).is_multiple_of(OS_PAGE_SIZE));
        Some(Self { start, size })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `size` bytes were mapped read/write and stay mapped for
        // the lifetime of `self`
        unsafe { std::slice::from_raw_parts(self.start.as_ptr(), self.size) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity
        unsafe {
            std::slice::from_raw_parts_mut(self.start.as_ptr(), self.size)
        }
    }
}

impl Drop for SegmentMemory {
    fn drop(&mut self) {
        unmap_memory(self.start, self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_mapping_is_zeroed_and_writable() {
        let mut memory = SegmentMemory::map(OS_PAGE_SIZE).unwrap();
        assert_eq!(memory.size(), OS_PAGE_SIZE);
        assert!(memory.as_slice().iter().all(|&b| b == 0));

        memory.as_mut_slice()[17] = 0xAB;
        assert_eq!(memory.as_slice()[17], 0xAB);
    }

    #[test]
    fn sub_page_mapping() {
        let mut memory = SegmentMemory::map(64).unwrap();
        assert_eq!(memory.as_slice().len(), 64);
        memory.as_mut_slice().fill(1);
        assert!(memory.as_slice().iter().all(|&b| b == 1));
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(SegmentMemory::map(0).is_none());
    }
}
