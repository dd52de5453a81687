//! Page-granular memory straight from the kernel. Nothing in here touches an
//! allocator, so it is safe to use from inside one (or from a fault handler).

use std::{
    ptr::{self, NonNull},
    slice,
    sync::LazyLock,
};

use libc::{
    mmap, mprotect, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE, PROT_NONE,
    PROT_READ, PROT_WRITE,
};

use crate::{
    error::{Error, Result},
    util::{hint::cold, num::round_up},
};

static PAGE_SIZE: LazyLock<usize> = LazyLock::new(page_size::get);

/// The OS page size. Looked up once.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Reserve `size` bytes of address space with no access rights. `size` must be
/// a multiple of the page size. Touching the result faults until some of it is
/// [`commit`]ed.
pub fn reserve(size: usize) -> Result<NonNull<u8>> {
    debug_assert!(size > 0 && size % page_size() == 0);
    map(size, PROT_NONE)
}

/// Make `[ptr, ptr + size)` readable and writable
///
/// # Safety
///
/// - `ptr` must be page-aligned and the range must lie inside a mapping
///   obtained from [`reserve`] or [`map_rw`]
pub unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<()> {
    protect(ptr, size, PROT_READ | PROT_WRITE, "mprotect(rw)")
}

/// Make `[ptr, ptr + size)` inaccessible. Contents are kept.
///
/// # Safety
///
/// - Same as [`commit`], and nothing may hold a reference into the range
pub unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<()> {
    protect(ptr, size, PROT_NONE, "mprotect(none)")
}

/// Give `[ptr, ptr + size)` back to the OS
///
/// # Safety
///
/// - `ptr` must be page-aligned and the whole range must be a mapping (or a
///   set of mappings) this process owns and no longer references
pub unsafe fn release(ptr: NonNull<u8>, size: usize) {
    // SAFETY: requirement passed to caller. `munmap` of a valid range can only
    // fail with EINVAL, which would mean the caller broke the contract.
    let rc = unsafe { munmap(ptr.as_ptr() as _, size) };
    debug_assert_eq!(rc, 0, "munmap({:p}, {size}) failed", ptr);
}

/// `mmap()` `size` bytes of zero-filled read/write memory, rounded up to whole
/// pages
pub fn map_rw(size: usize) -> Result<NonNull<u8>> {
    map(round_up(size.max(1), page_size()), PROT_READ | PROT_WRITE)
}

fn map(size: usize, prot: libc::c_int) -> Result<NonNull<u8>> {
    // SAFETY: an anonymous private mapping with no fixed address cannot alias
    // anything we already own
    let ptr = unsafe {
        mmap(
            ptr::null_mut(),
            size,
            prot,
            MAP_NORESERVE | MAP_ANONYMOUS | MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == MAP_FAILED {
        // super duper unlikely (it's basically always ENOMEM)
        return cold(|| Err(Error::last_os("mmap")));
    }
    NonNull::new(ptr as *mut u8).ok_or(Error::Os {
        op: "mmap",
        errno: 0,
    })
}

unsafe fn protect(ptr: NonNull<u8>, size: usize, prot: libc::c_int, op: &'static str) -> Result<()> {
    debug_assert!(ptr.as_ptr() as usize % page_size() == 0);
    // SAFETY: requirement passed to caller
    if unsafe { mprotect(ptr.as_ptr() as _, size, prot) } != 0 {
        return cold(|| Err(Error::last_os(op)));
    }
    Ok(())
}

/// A read/write, page-aligned arena that is `munmap()`ed on drop.
pub struct MmapRegion {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: the region is uniquely owned, same as a `Box<[u8]>`
unsafe impl Send for MmapRegion {}

impl MmapRegion {
    /// `mmap()` a read/write, page-aligned arena of memory of `size` bytes (or
    /// more -- the resulting arena is always whole pages). This always maps at
    /// least 1 page.
    pub fn map(size: usize) -> Result<MmapRegion> {
        let size = round_up(size.max(1), page_size());
        let ptr = map_rw(size)?;
        Ok(MmapRegion { ptr, size })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the whole mapping is ours and readable/writable
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY:
        // - The address must be a multiple of the page size (but length
        //   need not be). This is guaranteed true because we can only construct
        //   this region as page-aligned
        // - All pages containing a part of the indicated range are unmapped.
        //   This is fine, because we requested a region of exactly `self.size`
        //   bytes and never handed out anything that outlives `self`.
        unsafe { release(self.ptr, self.size) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmap_region_is_whole_zeroed_pages() {
        let mut region = MmapRegion::map(100).unwrap();
        assert_eq!(region.len(), page_size());
        assert_eq!(region.as_ptr() as usize % page_size(), 0);
        assert!(region.as_mut_slice().iter().all(|&b| b == 0));
        region.as_mut_slice()[99] = 7;
    }

    #[test]
    fn reserve_then_commit_makes_pages_writable() {
        let page = page_size();
        let base = reserve(2 * page).unwrap();
        unsafe {
            commit(base, page).unwrap();
            base.as_ptr().write_bytes(0xab, page);
            assert_eq!(*base.as_ptr().add(page - 1), 0xab);
            decommit(base, page).unwrap();
            release(base, 2 * page);
        }
    }
}
