//! An allocator that turns memory-safety bugs into immediate faults.
//!
//! Every allocation gets its own run of pages. With overrun detection on, the
//! user's bytes end as close as alignment allows to the end of the committed
//! pages, and the page after them is reserved but never committed, so reading
//! or writing one byte too far faults. That is exact for sizes that are a
//! multiple of [`DEFAULT_ALIGNMENT`]. For other sizes up to
//! `DEFAULT_ALIGNMENT - 1` bytes of slack sit before the guard page, and an
//! overrun into them is only caught by the guard bytes (when enabled), at
//! `free`. Freed blocks are made inaccessible and parked in a FIFO ring
//! before being unmapped, so a stale pointer faults too.
//!
//! ```plaintext
//!  block                                        committed end   block end
//!  |                                                   |            |
//!  | ...unused... |user_size|block_size| user data |0xFD|  guard page |
//!                 '---- header ----'   ^ returned pointer
//! ```
//!
//! This is a diagnostic tool. Every operation takes one mutex and at least one
//! syscall.

use std::{
    mem,
    ptr::{self, NonNull},
    sync::Mutex,
};

use super::{
    leak,
    ring::{DelayedFreeRing, FreedBlock},
    AllocError, Allocator, LeakTracker,
};
use crate::{
    error::{Error, Result},
    os::mem as os_mem,
    util::{
        hint::cold,
        lock,
        num::{align_down, align_up, round_up},
    },
};

/// Alignment of every block that doesn't ask for more
pub const DEFAULT_ALIGNMENT: usize = 2 * mem::size_of::<usize>();

/// Largest alignment `alloc_aligned` supports. Half a 4 KiB page: past this,
/// alignment padding would eat the page we put the user's data in.
pub const MAX_ALIGNMENT: usize = 2048;

/// Bytes of header (`user_size`, `block_size`) right before every user pointer
pub const SIZE_STORAGE_SIZE: usize = DEFAULT_ALIGNMENT;

/// What the padding between the end of the user's data and the guard page is
/// filled with
pub const GUARD_FILL_BYTE: u8 = 0xFD;

pub const DEFAULT_MAX_DELAYED_FREE_COUNT: usize = 16384;

struct PageState {
    ring: DelayedFreeRing,
    /// `false` until the first allocation (or an explicit size change)
    ring_ready: bool,
    max_delayed_free_count: usize,
    overrun_detection: bool,
    guard_bytes: bool,
    allocation_count: usize,
}

/// A page-granular debug allocator. See the module docs for the layout.
pub struct DebugPageAllocator {
    state: Mutex<PageState>,
    tracker: Option<&'static LeakTracker>,
}

/// Where a block's pieces are, given its user pointer and header
#[derive(Clone, Copy, Debug)]
struct BlockLayout {
    block: usize,
    block_size: usize,
    user: usize,
    user_size: usize,
    committed_end: usize,
}

impl DebugPageAllocator {
    /// Overrun detection on, guard bytes on in debug builds, and a
    /// delayed-free ring of [`DEFAULT_MAX_DELAYED_FREE_COUNT`] blocks.
    /// Reports to the process-wide leak tracker.
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(PageState {
                ring: DelayedFreeRing::empty(),
                ring_ready: false,
                max_delayed_free_count: DEFAULT_MAX_DELAYED_FREE_COUNT,
                overrun_detection: true,
                guard_bytes: cfg!(debug_assertions),
                allocation_count: 0,
            }),
            tracker: None,
        }
    }

    /// Like [`DebugPageAllocator::new`], reporting to `tracker`
    pub const fn with_tracker(tracker: &'static LeakTracker) -> Self {
        let mut this = Self::new();
        this.tracker = Some(tracker);
        this
    }

    fn tracker(&self) -> &LeakTracker {
        self.tracker.unwrap_or(&leak::TRACKER)
    }

    /// Set up the delayed-free ring now, instead of on first allocation
    pub fn init(&self) -> Result<()> {
        let mut state = lock(&self.state);
        Self::ensure_ring(&mut state)
    }

    /// Release every delay-freed block and stop delaying frees. Live blocks
    /// stay valid.
    pub fn shutdown(&self) {
        let mut state = lock(&self.state);
        Self::drain_ring(&mut state);
        state.ring = DelayedFreeRing::empty();
        state.max_delayed_free_count = 0;
        state.ring_ready = true;
    }

    pub fn page_size(&self) -> usize {
        os_mem::page_size()
    }

    /// Number of blocks handed out and not yet freed
    pub fn allocation_count(&self) -> usize {
        lock(&self.state).allocation_count
    }

    pub fn max_delayed_free_count(&self) -> usize {
        lock(&self.state).max_delayed_free_count
    }

    /// Number of freed blocks still protected in the ring
    pub fn delayed_free_len(&self) -> usize {
        lock(&self.state).ring.len()
    }

    /// Is `addr` inside a freed block that is still protected in the ring?
    pub fn is_delay_freed(&self, addr: usize) -> bool {
        lock(&self.state).ring.contains(addr)
    }

    pub fn overrun_detection(&self) -> (bool, bool) {
        let state = lock(&self.state);
        (state.overrun_detection, state.guard_bytes)
    }

    /// Choose whether blocks are laid out against a guard page, and whether
    /// the slack before it is filled with [`GUARD_FILL_BYTE`]. Guard bytes
    /// only make sense with overrun detection. Only allowed while nothing is
    /// allocated.
    pub fn enable_overrun_detection(&self, detection: bool, guard_bytes: bool) -> Result<()> {
        let mut state = lock(&self.state);
        if state.allocation_count != 0 {
            let count = state.allocation_count;
            drop(state);
            log::error!("enable_overrun_detection with {count} live allocation(s)");
            return Err(Error::LiveAllocations { count });
        }
        state.overrun_detection = detection;
        state.guard_bytes = detection && guard_bytes;
        Ok(())
    }

    /// Resize the delayed-free ring (zero turns delayed freeing off). Blocks
    /// already in the ring are released. Only allowed while nothing is
    /// allocated.
    pub fn set_max_delayed_free_count(&self, count: usize) -> Result<()> {
        let mut state = lock(&self.state);
        if state.allocation_count != 0 {
            let live = state.allocation_count;
            drop(state);
            log::error!("set_max_delayed_free_count with {live} live allocation(s)");
            return Err(Error::LiveAllocations { count: live });
        }
        Self::drain_ring(&mut state);
        state.ring = DelayedFreeRing::with_capacity(count)?;
        state.max_delayed_free_count = count;
        state.ring_ready = true;
        Ok(())
    }

    /// The size the block at `ptr` was allocated with
    ///
    /// # Safety
    ///
    /// - `ptr` must be a live block from this allocator
    pub unsafe fn alloc_size(&self, ptr: NonNull<u8>) -> usize {
        // SAFETY: requirement passed to caller
        unsafe { read_header(ptr).0 }
    }

    /// Are the guard bytes after the block at `ptr` intact? Always `true` for
    /// blocks laid out without guard bytes.
    ///
    /// # Safety
    ///
    /// - `ptr` must be a live block from this allocator
    pub unsafe fn check_guard_bytes(&self, ptr: NonNull<u8>) -> bool {
        let (overrun, guard) = self.overrun_detection();
        if !(overrun && guard) {
            return true;
        }
        // SAFETY: requirement passed to caller
        let layout = unsafe { self.layout_of(ptr, overrun) };
        let len = layout.committed_end - (layout.user + layout.user_size);
        // SAFETY: the padding lies inside the committed pages of a live block
        let padding = unsafe {
            std::slice::from_raw_parts((layout.user + layout.user_size) as *const u8, len)
        };
        padding.iter().all(|&b| b == GUARD_FILL_BYTE)
    }

    /// Resize an aligned block. Always moves: the old block is freed (and so
    /// protected), which is the point.
    ///
    /// # Safety
    ///
    /// - `ptr` must be `None` or a live block from this allocator
    pub unsafe fn realloc_aligned(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        align: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(old) = ptr else {
            return self.alloc_aligned(new_size, align).map(Some);
        };
        if new_size == 0 {
            // SAFETY: requirement passed to caller
            unsafe { self.free(old) };
            return Ok(None);
        }
        let new = self.alloc_aligned(new_size, align)?;
        // SAFETY: both blocks are live, distinct, and at least `min` bytes
        unsafe {
            let old_size = read_header(old).0;
            ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_size.min(new_size));
            self.free(old);
        }
        Ok(Some(new))
    }

    fn ensure_ring(state: &mut PageState) -> Result<()> {
        if !state.ring_ready {
            state.ring = DelayedFreeRing::with_capacity(state.max_delayed_free_count)?;
            state.ring_ready = true;
        }
        Ok(())
    }

    fn drain_ring(state: &mut PageState) {
        while let Some(block) = state.ring.pop_front() {
            // SAFETY: ring entries are whole mappings nobody may touch
            unsafe { os_mem::release(block.ptr, block.size) };
        }
    }

    /// Total mapping size for a block of `size` bytes aligned to `align`
    fn block_size(size: usize, align: usize, overrun: bool) -> usize {
        let page = os_mem::page_size();
        if overrun {
            round_up(SIZE_STORAGE_SIZE + align_up(size, align), page) + page
        } else {
            round_up(SIZE_STORAGE_SIZE.max(align) + size, page)
        }
    }

    /// Work out where everything is from a user pointer, using its header.
    ///
    /// # Safety
    ///
    /// - `ptr` must be a live block from this allocator, laid out with the
    ///   current overrun setting
    unsafe fn layout_of(&self, ptr: NonNull<u8>, overrun: bool) -> BlockLayout {
        let page = os_mem::page_size();
        // SAFETY: requirement passed to caller
        let (user_size, block_size) = unsafe { read_header(ptr) };
        let user = ptr.as_ptr() as usize;
        if overrun {
            let committed_end = align_up(user + user_size, page);
            BlockLayout {
                block: committed_end + page - block_size,
                block_size,
                user,
                user_size,
                committed_end,
            }
        } else {
            let block = align_down(user - SIZE_STORAGE_SIZE, page);
            BlockLayout {
                block,
                block_size,
                user,
                user_size,
                committed_end: block + block_size,
            }
        }
    }

    /// Get `block_size` bytes of address space with the first `committed`
    /// bytes accessible, recycling the oldest ring entry if the ring is full
    /// anyway and it is exactly the right size.
    fn map_block(
        state: &mut PageState,
        block_size: usize,
        committed: usize,
    ) -> Result<NonNull<u8>> {
        let recycle = state.ring.capacity() > 0
            && state.ring.is_full()
            && state.ring.front().is_some_and(|b| b.size == block_size);
        let block = match recycle.then(|| state.ring.pop_front()).flatten() {
            Some(FreedBlock { ptr, .. }) => ptr,
            None => os_mem::reserve(block_size)?,
        };
        // SAFETY: the first `committed` bytes of our own reservation
        if let Err(e) = unsafe { os_mem::commit(block, committed) } {
            // SAFETY: never handed out
            unsafe { os_mem::release(block, block_size) };
            return Err(e);
        }
        Ok(block)
    }
}

impl Default for DebugPageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// `(user_size, block_size)` from the header right before `ptr`
///
/// # Safety
///
/// - `ptr` must be a live block from a [`DebugPageAllocator`]
unsafe fn read_header(ptr: NonNull<u8>) -> (usize, usize) {
    // SAFETY: requirement passed to caller. The header is two words, aligned,
    // immediately before the user pointer.
    unsafe {
        let header = ptr.as_ptr().sub(SIZE_STORAGE_SIZE) as *const usize;
        (header.read(), header.add(1).read())
    }
}

// SAFETY: every block is its own fresh (or fully recycled) mapping, aligned
// as requested, and stays mapped read/write until freed
unsafe impl Allocator for DebugPageAllocator {
    fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.alloc_aligned(size, DEFAULT_ALIGNMENT)
    }

    fn alloc_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
        debug_assert!(align <= MAX_ALIGNMENT, "alignment {align} > {MAX_ALIGNMENT}");
        let align = align.max(DEFAULT_ALIGNMENT);
        if size > isize::MAX as usize / 2 {
            return cold(|| Err(AllocError));
        }
        let page = os_mem::page_size();

        let user = {
            let mut state = lock(&self.state);
            if Self::ensure_ring(&mut state).is_err() {
                return cold(|| Err(AllocError));
            }
            let overrun = state.overrun_detection;
            let block_size = Self::block_size(size, align, overrun);
            let committed = if overrun { block_size - page } else { block_size };
            let Ok(block) = Self::map_block(&mut state, block_size, committed) else {
                return cold(|| Err(AllocError));
            };
            let block = block.as_ptr() as usize;
            let user = if overrun {
                align_down(block + committed - size, align)
            } else {
                align_up(block + SIZE_STORAGE_SIZE, align)
            };
            debug_assert!(user - SIZE_STORAGE_SIZE >= block);
            debug_assert!(user + size <= block + committed);
            // SAFETY: header and padding are inside the committed pages
            unsafe {
                let header = (user - SIZE_STORAGE_SIZE) as *mut usize;
                header.write(size);
                header.add(1).write(block_size);
                if overrun && state.guard_bytes {
                    let pad = (block + committed) - (user + size);
                    ptr::write_bytes((user + size) as *mut u8, GUARD_FILL_BYTE, pad);
                }
            }
            state.allocation_count += 1;
            user
        };
        // SAFETY: `user` is inside a mapping, so non-null
        let user = unsafe { NonNull::new_unchecked(user as *mut u8) };
        self.tracker().track_alloc(user, size);
        Ok(user)
    }

    unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        // SAFETY: requirement passed to caller
        unsafe { self.realloc_aligned(ptr, new_size, DEFAULT_ALIGNMENT) }
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        // SAFETY: requirement passed to caller
        debug_assert!(
            unsafe { self.check_guard_bytes(ptr) },
            "guard bytes after the block at {ptr:p} were overwritten"
        );
        self.tracker().untrack_alloc(ptr);

        let mut state = lock(&self.state);
        // SAFETY: requirement passed to caller
        let layout = unsafe { self.layout_of(ptr, state.overrun_detection) };
        // SAFETY: `layout.block` is the start of the mapping we handed out
        let block = FreedBlock {
            ptr: unsafe { NonNull::new_unchecked(layout.block as *mut u8) },
            size: layout.block_size,
        };
        state.allocation_count -= 1;
        if state.ring.capacity() == 0 {
            // SAFETY: the caller gave the block up
            unsafe { os_mem::release(block.ptr, block.size) };
            return;
        }
        // SAFETY: the caller gave the block up; from here on any touch faults
        if unsafe { os_mem::decommit(block.ptr, block.size) }.is_err() {
            unsafe { os_mem::release(block.ptr, block.size) };
            return;
        }
        if let Some(evicted) = state.ring.push_back(block) {
            // SAFETY: aged out of the ring, nobody may reference it
            unsafe { os_mem::release(evicted.ptr, evicted.size) };
        }
    }

    unsafe fn free_aligned(&self, ptr: NonNull<u8>) {
        // SAFETY: requirement passed to caller -- aligned blocks carry the same
        // header as any other
        unsafe { self.free(ptr) }
    }

    fn on_system_shutdown(&self) {
        self.shutdown();
    }
}
