//! Fiber stack allocation.
//!
//! Stacks are mapped directly from the OS with a `PROT_NONE` guard page at
//! the bottom, so an overflowing fiber faults instead of silently corrupting
//! a neighbouring allocation.

#[cfg(windows)]
use std::ffi::c_void;

#[cfg(windows)]
#[link(name = "kernel32")]
extern "system" {
    fn VirtualAlloc(addr: *mut c_void, size: usize, alloc_type: u32, protect: u32) -> *mut c_void;
    fn VirtualProtect(addr: *mut c_void, size: usize, new_protect: u32, old_protect: *mut u32)
        -> i32;
    fn VirtualFree(addr: *mut c_void, size: usize, free_type: u32) -> i32;
}

#[cfg(windows)]
const MEM_COMMIT: u32 = 0x1000;
#[cfg(windows)]
const MEM_RESERVE: u32 = 0x2000;
#[cfg(windows)]
const MEM_RELEASE: u32 = 0x8000;
#[cfg(windows)]
const PAGE_READWRITE: u32 = 0x04;
#[cfg(windows)]
const PAGE_NOACCESS: u32 = 0x01;

/// Granularity used for rounding stack sizes and sizing the guard region.
const PAGE_SIZE: usize = 4 * 1024;

/// An owned, page-rounded fiber stack with a guard page at the bottom.
///
/// The mapping lives until `Drop`; fibers only ever borrow the region.
pub(crate) struct FiberStack {
    /// Base of the mapping (the guard page starts here).
    base: *mut u8,
    /// Total mapping size, guard page included.
    alloc_size: usize,
}

// SAFETY: The mapping is exclusively owned by this value and only the fiber
// currently executing on it touches the memory. Moving ownership to another
// thread hands over that exclusivity.
unsafe impl Send for FiberStack {}

impl FiberStack {
    /// Maps a stack with `usable` bytes (rounded up to whole pages) plus a
    /// guard page. Returns `None` if the OS refuses the mapping.
    pub(crate) fn new(usable: usize) -> Option<Self> {
        let usable = usable.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let alloc_size = PAGE_SIZE + usable;

        #[cfg(unix)]
        let base = {
            // SAFETY: anonymous private mapping, no file backing; the
            // standard fd = -1 / offset = 0 form.
            let base = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    alloc_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if base == libc::MAP_FAILED {
                return None;
            }

            // SAFETY: `base` is a live mapping and the guard page lies
            // entirely inside it.
            let ret = unsafe { libc::mprotect(base, PAGE_SIZE, libc::PROT_NONE) };
            if ret != 0 {
                // SAFETY: matches the mmap above.
                unsafe { libc::munmap(base, alloc_size) };
                return None;
            }
            base.cast::<u8>()
        };

        #[cfg(windows)]
        let base = {
            // SAFETY: reserves and commits a fresh region; no aliasing.
            let base = unsafe {
                VirtualAlloc(
                    std::ptr::null_mut(),
                    alloc_size,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_READWRITE,
                )
            };
            if base.is_null() {
                return None;
            }

            let mut old_protect: u32 = 0;
            // SAFETY: the guard page lies inside the fresh allocation.
            let ret = unsafe { VirtualProtect(base, PAGE_SIZE, PAGE_NOACCESS, &mut old_protect) };
            if ret == 0 {
                // SAFETY: matches the VirtualAlloc above.
                unsafe { VirtualFree(base, 0, MEM_RELEASE) };
                return None;
            }
            base.cast::<u8>()
        };

        Some(FiberStack { base, alloc_size })
    }

    /// One past the highest usable byte; stacks grow downward from here.
    pub(crate) fn top(&self) -> *mut u8 {
        // SAFETY: one-past-the-end pointers are valid to form, and the
        // context primitive aligns downward before the first store.
        unsafe { self.base.add(self.alloc_size) }
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        #[cfg(unix)]
        // SAFETY: `base`/`alloc_size` describe a mapping we still own.
        unsafe {
            libc::munmap(self.base.cast::<libc::c_void>(), self.alloc_size);
        }
        #[cfg(windows)]
        // SAFETY: `base` came from VirtualAlloc with MEM_RESERVE.
        unsafe {
            VirtualFree(self.base.cast(), 0, MEM_RELEASE);
        }
    }
}
