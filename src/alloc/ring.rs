//! The delayed-free ring: a fixed-capacity FIFO of protected blocks waiting to
//! be given back to the OS. Its storage comes straight from `mmap`, since it
//! lives inside an allocator.

use std::ptr::NonNull;

use crate::{error::Result, os::mem::MmapRegion};

/// One delay-freed block: the whole mapping, guard page included
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FreedBlock {
    pub ptr: NonNull<u8>,
    pub size: usize,
}

impl FreedBlock {
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.ptr.as_ptr() as usize;
        addr >= base && addr - base < self.size
    }
}

pub(crate) struct DelayedFreeRing {
    storage: Option<MmapRegion>,
    capacity: usize,
    head: usize,
    len: usize,
}

// SAFETY: the entries are addresses of blocks the owning allocator manages
// under its own lock
unsafe impl Send for DelayedFreeRing {}

impl DelayedFreeRing {
    pub const fn empty() -> Self {
        Self {
            storage: None,
            capacity: 0,
            head: 0,
            len: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Ok(Self::empty());
        }
        let storage = MmapRegion::map(capacity * std::mem::size_of::<FreedBlock>())?;
        Ok(Self {
            storage: Some(storage),
            capacity,
            head: 0,
            len: 0,
        })
    }

    fn slots(&self) -> *mut FreedBlock {
        self.storage
            .as_ref()
            .map_or(std::ptr::null_mut(), |s| s.as_ptr() as *mut FreedBlock)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    /// The oldest entry
    pub fn front(&self) -> Option<FreedBlock> {
        if self.len == 0 {
            return None;
        }
        // SAFETY: `head < capacity` and the slot is initialized while len > 0
        Some(unsafe { self.slots().add(self.head).read() })
    }

    pub fn pop_front(&mut self) -> Option<FreedBlock> {
        let block = self.front()?;
        self.head = (self.head + 1) % self.capacity;
        self.len -= 1;
        Some(block)
    }

    /// Append `block`. If the ring is full the oldest entry is pushed out and
    /// returned, and the caller must release it.
    pub fn push_back(&mut self, block: FreedBlock) -> Option<FreedBlock> {
        if self.capacity == 0 {
            return Some(block);
        }
        let evicted = if self.is_full() { self.pop_front() } else { None };
        let tail = (self.head + self.len) % self.capacity;
        // SAFETY: `tail < capacity`, inside our storage
        unsafe { self.slots().add(tail).write(block) };
        self.len += 1;
        evicted
    }

    pub fn contains(&self, addr: usize) -> bool {
        (0..self.len).any(|i| {
            // SAFETY: the first `len` slots from `head` are initialized
            let block = unsafe { self.slots().add((self.head + i) % self.capacity).read() };
            block.contains(addr)
        })
    }
}
