//! The allocator contract, the process-wide allocator instance, and the entry
//! points the rest of a program allocates through.

pub mod global;
pub mod leak;
pub mod page;
pub(crate) mod pool;
pub(crate) mod ring;
pub mod system;

use std::{mem, ptr::NonNull};

use thiserror::Error;

use crate::{os, util::num::align_up};

pub use global::{get_instance, set_instance, KernelAlloc};
pub use leak::{dump_memory, is_tracking_leaks, set_leak_tracking, LeakTracker};
pub use page::DebugPageAllocator;
pub use system::DefaultAllocator;

/// An allocation could not be satisfied. Deliberately carries nothing: the
/// allocation path reports failure as a null check and nothing else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("memory allocation failed")]
pub struct AllocError;

/// The allocator contract every allocator in this crate implements and the
/// SDK entry points route through.
///
/// Unlike [`std::alloc::GlobalAlloc`], blocks are freed without a `Layout`: an
/// allocator has to know the size of its own blocks.
///
/// # Safety
///
/// - `alloc*` must return blocks valid for reads and writes of the requested
///   size, aligned to at least [`MIN_ALIGN`] (or the requested alignment), that
///   do not overlap any other live block
/// - A block stays valid until it is passed to `free`/`realloc` of the same
///   allocator
pub unsafe trait Allocator: Send + Sync {
    /// Allocate `size` bytes. `alloc(0)` succeeds with a unique pointer that
    /// must still be freed.
    fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError>;

    /// Like [`Allocator::alloc`], tagged with the call site. Allocators that
    /// don't record call sites just allocate.
    fn alloc_debug(
        &self,
        size: usize,
        file: &'static str,
        line: u32,
    ) -> Result<NonNull<u8>, AllocError> {
        let _ = (file, line);
        self.alloc(size)
    }

    /// Resize a block. `None` behaves as `alloc(new_size)`; a `new_size` of
    /// zero frees the block and returns `Ok(None)`. On failure the original
    /// block is untouched and still owned by the caller.
    ///
    /// # Safety
    ///
    /// - `ptr` must be `None` or a live block from this allocator's
    ///   `alloc`/`alloc_debug`/`realloc`
    unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError>;

    /// # Safety
    ///
    /// - `ptr` must be a live block from this allocator's
    ///   `alloc`/`alloc_debug`/`realloc`, and must not be used afterwards
    unsafe fn free(&self, ptr: NonNull<u8>);

    /// Allocate `size` bytes aligned to `align` (a power of two).
    ///
    /// The default over-allocates by `align`, rounds up, and keeps the distance
    /// back to the real block in the word just below the returned pointer:
    ///
    /// ```plaintext
    /// raw                      aligned
    /// |  ...padding...  |offset| user data (size bytes) ...
    /// ```
    fn alloc_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(align.is_power_of_two());
        let align = align.max(mem::size_of::<usize>());
        let raw = self.alloc(size.checked_add(align).ok_or(AllocError)?)?;
        let mut aligned = align_up(raw.as_ptr() as usize, align);
        if aligned == raw.as_ptr() as usize {
            // there must always be room for the offset word
            aligned += align;
        }
        let offset = aligned - raw.as_ptr() as usize;
        // SAFETY:
        // - `offset` is in `1..=align`, and the block is `size + align` bytes,
        //   so `aligned + size` stays inside it
        // - the offset word lives in `[aligned - word, aligned)`, which is
        //   inside the block because `offset >= word` (raw blocks are at least
        //   word aligned and `align` is a multiple of a word)
        unsafe {
            let aligned = raw.as_ptr().add(offset);
            (aligned.sub(mem::size_of::<usize>()) as *mut usize).write_unaligned(offset);
            Ok(NonNull::new_unchecked(aligned))
        }
    }

    /// # Safety
    ///
    /// - `ptr` must be a live block from this allocator's `alloc_aligned`
    unsafe fn free_aligned(&self, ptr: NonNull<u8>) {
        // SAFETY: requirement passed to caller -- `alloc_aligned` stored the
        // offset back to the raw block right below `ptr`
        unsafe {
            let offset = (ptr.as_ptr().sub(mem::size_of::<usize>()) as *const usize).read_unaligned();
            self.free(NonNull::new_unchecked(ptr.as_ptr().sub(offset)));
        }
    }

    /// Called by [`crate::System::destroy`] right before the instance is
    /// uninstalled.
    fn on_system_shutdown(&self) {}
}

/// Alignment every allocator in this crate guarantees for plain `alloc`
pub const MIN_ALIGN: usize = 2 * mem::size_of::<usize>();

/// Allocate through the process-wide allocator
pub fn alloc(size: usize) -> Result<NonNull<u8>, AllocError> {
    get_instance().alloc(size)
}

/// Allocate through the process-wide allocator, recording the call site. See
/// [`kdiag_alloc!`](crate::kdiag_alloc).
pub fn alloc_debug(size: usize, file: &'static str, line: u32) -> Result<NonNull<u8>, AllocError> {
    get_instance().alloc_debug(size, file, line)
}

/// # Safety
///
/// - Same as [`Allocator::realloc`], for the process-wide allocator
pub unsafe fn realloc(
    ptr: Option<NonNull<u8>>,
    new_size: usize,
) -> Result<Option<NonNull<u8>>, AllocError> {
    // SAFETY: requirement passed to caller
    unsafe { get_instance().realloc(ptr, new_size) }
}

/// # Safety
///
/// - Same as [`Allocator::free`], for the process-wide allocator
pub unsafe fn free(ptr: NonNull<u8>) {
    // SAFETY: requirement passed to caller
    unsafe { get_instance().free(ptr) }
}

pub fn alloc_aligned(size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
    get_instance().alloc_aligned(size, align)
}

/// # Safety
///
/// - Same as [`Allocator::free_aligned`], for the process-wide allocator
pub unsafe fn free_aligned(ptr: NonNull<u8>) {
    // SAFETY: requirement passed to caller
    unsafe { get_instance().free_aligned(ptr) }
}

/// `alloc_debug(size, file!(), line!())`
#[macro_export]
macro_rules! kdiag_alloc {
    ($size:expr) => {
        $crate::alloc::alloc_debug($size, ::std::file!(), ::std::line!())
    };
}

/// Zero-filled pages straight from the OS, bypassing every allocator (and the
/// leak tracker). For scratch space in code that inspects allocators.
pub fn safe_mmap_alloc(size: usize) -> Option<NonNull<u8>> {
    os::mem::map_rw(size).ok()
}

/// # Safety
///
/// - `ptr`/`size` must come from one [`safe_mmap_alloc`] call
pub unsafe fn safe_mmap_free(ptr: NonNull<u8>, size: usize) {
    let size = crate::util::num::round_up(size.max(1), os::mem::page_size());
    // SAFETY: requirement passed to caller
    unsafe { os::mem::release(ptr, size) }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::ptr::NonNull;

    /// Fill `[ptr, ptr + len)` with a pattern derived from `seed`
    pub unsafe fn fill(ptr: NonNull<u8>, len: usize, seed: u8) {
        for i in 0..len {
            unsafe { ptr.as_ptr().add(i).write(seed.wrapping_add(i as u8)) };
        }
    }

    /// Check the pattern written by [`fill`]
    pub unsafe fn check(ptr: NonNull<u8>, len: usize, seed: u8) -> bool {
        (0..len).all(|i| unsafe { ptr.as_ptr().add(i).read() } == seed.wrapping_add(i as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::{test_util::*, *};

    #[test]
    fn default_aligned_alloc_honours_alignment() {
        let a = DefaultAllocator::new();
        for shift in 0..12 {
            let align = 1usize << shift;
            for size in [0, 1, 7, 64, 4097] {
                let p = a.alloc_aligned(size, align).unwrap();
                assert_eq!(p.as_ptr() as usize % align, 0);
                unsafe {
                    fill(p, size, shift as u8);
                    assert!(check(p, size, shift as u8));
                    a.free_aligned(p);
                }
            }
        }
    }

    #[test]
    fn safe_mmap_round_trip() {
        let p = safe_mmap_alloc(10_000).unwrap();
        unsafe {
            fill(p, 10_000, 3);
            assert!(check(p, 10_000, 3));
            safe_mmap_free(p, 10_000);
        }
    }
}
