//! A pool of fixed-size slots carved out of `mmap`ed chunks. Used for the leak
//! tracker's records, which must never come from a tracked allocator.
//!
//! Within a chunk allocation is just a bump of `sp`; freed slots go on an
//! intrusive free list and are handed out again before bumping. Chunks are only
//! returned to the OS when the whole pool is dropped.

use std::{
    marker::PhantomData,
    mem,
    ptr::{self, NonNull},
};

use crate::{os::mem as os_mem, util::num::round_up};

/// Bytes per chunk, before rounding to whole pages
const CHUNK_BYTES: usize = 256 * 1024;

struct FreeSlot {
    next: *mut FreeSlot,
}

/// Sits at the start of every chunk
struct ChunkHeader {
    next: *mut ChunkHeader,
    size: usize,
}

pub(crate) struct SlotPool<T> {
    free: *mut FreeSlot,
    chunks: *mut ChunkHeader,
    /// Bump pointer into the newest chunk
    sp: usize,
    /// End of the newest chunk
    end: usize,
    live: usize,
    _marker: PhantomData<T>,
}

// SAFETY: the pool owns its chunks outright; raw pointers are only followed
// while the pool is borrowed mutably
unsafe impl<T: Send> Send for SlotPool<T> {}

impl<T> SlotPool<T> {
    const SLOT: usize = {
        let size = if mem::size_of::<T>() > mem::size_of::<FreeSlot>() {
            mem::size_of::<T>()
        } else {
            mem::size_of::<FreeSlot>()
        };
        let align = Self::ALIGN;
        (size + align - 1) / align * align
    };

    const ALIGN: usize = if mem::align_of::<T>() > mem::align_of::<FreeSlot>() {
        mem::align_of::<T>()
    } else {
        mem::align_of::<FreeSlot>()
    };

    pub const fn new() -> Self {
        Self {
            free: ptr::null_mut(),
            chunks: ptr::null_mut(),
            sp: 0,
            end: 0,
            live: 0,
            _marker: PhantomData,
        }
    }

    /// Hand out an uninitialized slot for a `T`, or `None` if the OS is out of
    /// pages.
    pub fn acquire(&mut self) -> Option<NonNull<T>> {
        if let Some(slot) = NonNull::new(self.free) {
            // SAFETY: every pointer on the free list is a released slot of ours
            self.free = unsafe { slot.as_ref().next };
            self.live += 1;
            return Some(slot.cast());
        }
        if self.sp + Self::SLOT > self.end {
            self.grow()?;
        }
        let slot = self.sp as *mut T;
        self.sp += Self::SLOT;
        self.live += 1;
        NonNull::new(slot)
    }

    /// Return a slot. Whatever `T` was in it must already have been dropped
    /// (or be trivially droppable).
    ///
    /// # Safety
    ///
    /// - `slot` must have come from `acquire` on this pool and not been
    ///   released since
    pub unsafe fn release(&mut self, slot: NonNull<T>) {
        let slot = slot.cast::<FreeSlot>();
        // SAFETY: slots are big enough and aligned for a `FreeSlot`
        unsafe { slot.as_ptr().write(FreeSlot { next: self.free }) };
        self.free = slot.as_ptr();
        self.live -= 1;
    }

    /// Number of slots handed out and not released
    pub fn live(&self) -> usize {
        self.live
    }

    fn grow(&mut self) -> Option<()> {
        let size = round_up(CHUNK_BYTES, os_mem::page_size());
        let chunk = os_mem::map_rw(size).ok()?.cast::<ChunkHeader>();
        // SAFETY: fresh read/write mapping, page-aligned
        unsafe {
            chunk.as_ptr().write(ChunkHeader {
                next: self.chunks,
                size,
            })
        };
        self.chunks = chunk.as_ptr();
        let start = chunk.as_ptr() as usize;
        self.sp = round_up(start + mem::size_of::<ChunkHeader>(), Self::ALIGN);
        self.end = start + size;
        Some(())
    }
}

impl<T> Drop for SlotPool<T> {
    fn drop(&mut self) {
        let mut chunk = self.chunks;
        while let Some(c) = NonNull::new(chunk) {
            // SAFETY: each chunk header was written by `grow` and the chunk is
            // owned by us alone
            unsafe {
                let ChunkHeader { next, size } = c.as_ptr().read();
                os_mem::release(c.cast(), size);
                chunk = next;
            }
        }
    }
}
