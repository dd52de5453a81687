//! The process-wide allocator instance, and [`KernelAlloc`], which lets Rust's
//! own allocations go through it.

use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::RwLock,
};

use super::{Allocator, DefaultAllocator, MIN_ALIGN};

static DEFAULT: DefaultAllocator = DefaultAllocator::new();

/// `None` until first use or until [`set_instance`] installs something
static INSTANCE: RwLock<Option<&'static dyn Allocator>> = RwLock::new(None);

/// The allocator the SDK entry points route to. Falls back to (and installs)
/// [`DefaultAllocator`] if nothing has been installed yet.
pub fn get_instance() -> &'static dyn Allocator {
    if let Some(a) = *INSTANCE.read().unwrap_or_else(|e| e.into_inner()) {
        return a;
    }
    let mut slot = INSTANCE.write().unwrap_or_else(|e| e.into_inner());
    *slot.get_or_insert(&DEFAULT)
}

/// Install (or with `None`, clear) the process-wide allocator. Blocks from the
/// previous instance must all have been freed: nothing re-routes them.
pub fn set_instance(allocator: Option<&'static dyn Allocator>) {
    *INSTANCE.write().unwrap_or_else(|e| e.into_inner()) = allocator;
}

/// Whether an allocator has been installed (explicitly, or by first use)
pub fn has_instance() -> bool {
    INSTANCE.read().unwrap_or_else(|e| e.into_inner()).is_some()
}

/// A [`GlobalAlloc`] that forwards to one of our allocators. Allocation
/// failure comes back as null, and Rust's runtime turns that into
/// `handle_alloc_error`.
///
/// ```ignore
/// static PAGES: DebugPageAllocator = DebugPageAllocator::new();
///
/// #[global_allocator]
/// static GLOBAL: KernelAlloc = KernelAlloc::with(&PAGES);
/// ```
///
/// An allocator can't be swapped underneath the Rust runtime (it has
/// allocated before `main`), so a `KernelAlloc` is bound to one allocator for
/// the life of the process: either a fixed one, or whatever
/// [`get_instance`] returns the first time it is asked.
pub struct KernelAlloc {
    fixed: Option<&'static dyn Allocator>,
}

impl KernelAlloc {
    /// Forward to the process-wide instance
    pub const fn new() -> Self {
        Self { fixed: None }
    }

    /// Forward to `allocator`
    pub const fn with(allocator: &'static dyn Allocator) -> Self {
        Self {
            fixed: Some(allocator),
        }
    }

    fn allocator(&self) -> &'static dyn Allocator {
        match self.fixed {
            Some(a) => a,
            None => get_instance(),
        }
    }
}

impl Default for KernelAlloc {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for KernelAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let a = self.allocator();
        let data = if layout.align() <= MIN_ALIGN {
            a.alloc(layout.size())
        } else {
            a.alloc_aligned(layout.size(), layout.align())
        };
        data.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: the caller passes a pointer this allocator returned, and no
        // allocator returns null as an allocation
        let ptr = unsafe { NonNull::new_unchecked(ptr) };
        let a = self.allocator();
        // SAFETY: `layout` is the one it was allocated with, so this picks the
        // same path as `alloc`
        unsafe {
            if layout.align() <= MIN_ALIGN {
                a.free(ptr)
            } else {
                a.free_aligned(ptr)
            }
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > MIN_ALIGN || new_size == 0 {
            // SAFETY: same contract as ours; the default does alloc + copy + dealloc
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            let new = unsafe { self.alloc(new_layout) };
            if !new.is_null() {
                unsafe {
                    ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
                    self.dealloc(ptr, layout);
                }
            }
            return new;
        }
        // SAFETY: `ptr` is live and from `alloc` (not `alloc_aligned`)
        match unsafe { self.allocator().realloc(NonNull::new(ptr), new_size) } {
            Ok(Some(p)) => p.as_ptr(),
            _ => ptr::null_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_defaults_lazily() {
        let _guard = crate::test_lock();
        let a = get_instance();
        assert!(has_instance());
        let p = a.alloc(16).unwrap();
        unsafe { a.free(p) };
    }

    #[test]
    fn kernel_alloc_handles_over_aligned_layouts() {
        static A: DefaultAllocator = DefaultAllocator::new();
        let k = KernelAlloc::with(&A);
        unsafe {
            let layout = Layout::from_size_align(100, 256).unwrap();
            let p = k.alloc(layout);
            assert_eq!(p as usize % 256, 0);
            p.write_bytes(0x5a, 100);
            let q = k.realloc(p, layout, 300);
            assert_eq!(q as usize % 256, 0);
            assert_eq!(*q.add(99), 0x5a);
            k.dealloc(q, Layout::from_size_align(300, 256).unwrap());

            let small = Layout::from_size_align(10, 8).unwrap();
            let p = k.alloc(small);
            let q = k.realloc(p, small, 20);
            assert!(!q.is_null());
            k.dealloc(q, Layout::from_size_align(20, 8).unwrap());
        }
    }
}
