use std::ptr::NonNull;

use super::{leak, AllocError, Allocator, LeakTracker};
use crate::util::hint::cold;

mod c {
    use libc::{c_void, size_t};

    extern "C" {
        pub fn malloc(size: size_t) -> *mut c_void;
        pub fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void;
        pub fn free(ptr: *mut c_void);
    }
}

/// A thin wrapper around the C heap. This is what the process-wide allocator
/// is until something else is installed.
pub struct DefaultAllocator {
    tracker: Option<&'static LeakTracker>,
}

impl DefaultAllocator {
    /// Report to the process-wide leak tracker
    pub const fn new() -> Self {
        Self { tracker: None }
    }

    /// Report to `tracker` instead of the process-wide one
    pub const fn with_tracker(tracker: &'static LeakTracker) -> Self {
        Self {
            tracker: Some(tracker),
        }
    }

    fn tracker(&self) -> &LeakTracker {
        self.tracker.unwrap_or(&leak::TRACKER)
    }
}

impl Default for DefaultAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: `malloc` returns distinct blocks aligned for any fundamental type
// (at least `MIN_ALIGN`), valid until `free`/`realloc`
unsafe impl Allocator for DefaultAllocator {
    fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        // `malloc(0)` is allowed to return null, which would read as failure
        // SAFETY: plain libc call
        let data = unsafe { c::malloc(size.max(1)) } as *mut u8;
        let Some(data) = NonNull::new(data) else {
            return cold(|| Err(AllocError));
        };
        self.tracker().track_alloc(data, size);
        Ok(data)
    }

    unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(ptr) = ptr else {
            return self.alloc(new_size).map(Some);
        };
        if new_size == 0 {
            // SAFETY: requirement passed to caller
            unsafe { self.free(ptr) };
            return Ok(None);
        }
        // SAFETY: `ptr` is a live `malloc` block (caller contract). On failure
        // C `realloc` leaves it alone, which is exactly our contract.
        let data = unsafe { c::realloc(ptr.as_ptr() as _, new_size) } as *mut u8;
        let Some(data) = NonNull::new(data) else {
            return cold(|| Err(AllocError));
        };
        self.tracker().untrack_alloc(ptr);
        self.tracker().track_alloc(data, new_size);
        Ok(Some(data))
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        self.tracker().untrack_alloc(ptr);
        // SAFETY: requirement passed to caller
        unsafe { c::free(ptr.as_ptr() as _) }
    }
}
