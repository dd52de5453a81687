//! Leak tracking: a registry of every live allocation made while tracking is
//! on, each with the backtrace of the call that made it.
//!
//! The registry is a fixed table of [`BUCKET_COUNT`] buckets, each an intrusive
//! doubly-linked list of records, keyed by a mixed hash of the pointer. It is
//! never resized, so very large numbers of live allocations make chains long
//! rather than making tracking block on a rehash.
//!
//! Nothing in here allocates through an allocator: records come from a
//! [`SlotPool`] of raw pages, and the report is built in `mmap`ed scratch.
//! Symbol resolution during a report may allocate; those allocations (and
//! anything else this thread allocates while inside the tracker) are not
//! tracked.

use std::{
    cell::Cell,
    fmt::{self, Write},
    ptr::{self, NonNull},
    slice,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use super::pool::SlotPool;
use crate::{
    os::mem::MmapRegion,
    symbol::{SymbolLookup, MAX_BACKTRACE_FRAMES},
    util::{fixed::{FixedStr, FixedWriter}, lock, num::fmix64},
};

pub const BUCKET_COUNT: usize = 1024;

/// Frames of the tracker and allocator themselves at the top of every captured
/// backtrace
const TRACK_SKIP_FRAMES: usize = 2;

/// Room for one formatted leak block (header plus every frame line)
const BLOCK_TEXT_BYTES: usize = 96 * 1024;

const MAX_IGNORE_PATTERNS: usize = 32;
const IGNORE_PATTERN_LEN: usize = 128;

/// Allocations the Rust runtime and our own dependencies make once and keep
/// for the life of the process
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    "std::rt::init",
    "std::io::stdio::stdout",
    "std::io::stdio::stderr",
    "std::thread::current",
    "std::sys::thread_local",
    "backtrace::symbolize",
    "log::set_boxed_logger",
    "env_logger::logger::Builder::try_init",
];

struct Record {
    ptr: usize,
    size: usize,
    frame_count: usize,
    frames: [usize; MAX_BACKTRACE_FRAMES],
    prev: *mut Record,
    next: *mut Record,
}

/// A record as copied out for reporting
#[derive(Clone, Copy)]
struct Snapshot {
    ptr: usize,
    size: usize,
    frame_count: usize,
    frames: [usize; MAX_BACKTRACE_FRAMES],
}

struct Table {
    buckets: [*mut Record; BUCKET_COUNT],
    pool: SlotPool<Record>,
    /// Allocations we could not record because the pool ran out of pages
    dropped: usize,
}

// SAFETY: records are only reached through the table, which is behind a mutex
unsafe impl Send for Table {}

impl Table {
    const fn new() -> Self {
        Self {
            buckets: [ptr::null_mut(); BUCKET_COUNT],
            pool: SlotPool::new(),
            dropped: 0,
        }
    }

    fn bucket(ptr: usize) -> usize {
        (fmix64(ptr as u64) % BUCKET_COUNT as u64) as usize
    }

    fn find(&self, ptr: usize) -> Option<NonNull<Record>> {
        let mut rec = self.buckets[Self::bucket(ptr)];
        while let Some(r) = NonNull::new(rec) {
            // SAFETY: every record on a chain is live and owned by the table
            let r_ref = unsafe { r.as_ref() };
            if r_ref.ptr == ptr {
                return Some(r);
            }
            rec = r_ref.next;
        }
        None
    }

    fn insert(&mut self, ptr: usize, size: usize, frames: &[usize]) {
        if let Some(mut existing) = self.find(ptr) {
            // the block was freed while tracking was off and the address has
            // come round again: one record per pointer, so overwrite
            // SAFETY: live record owned by the table
            let rec = unsafe { existing.as_mut() };
            rec.size = size;
            rec.frame_count = frames.len();
            rec.frames[..frames.len()].copy_from_slice(frames);
            return;
        }
        let Some(slot) = self.pool.acquire() else {
            self.dropped += 1;
            return;
        };
        let bucket = Self::bucket(ptr);
        let head = self.buckets[bucket];
        let mut rec = Record {
            ptr,
            size,
            frame_count: frames.len(),
            frames: [0; MAX_BACKTRACE_FRAMES],
            prev: ptr::null_mut(),
            next: head,
        };
        rec.frames[..frames.len()].copy_from_slice(frames);
        // SAFETY: `slot` is an unused slot from our pool; `head` (if any) is a
        // live record
        unsafe {
            slot.as_ptr().write(rec);
            if let Some(mut head) = NonNull::new(head) {
                head.as_mut().prev = slot.as_ptr();
            }
        }
        self.buckets[bucket] = slot.as_ptr();
    }

    fn remove(&mut self, ptr: usize) -> bool {
        let Some(rec) = self.find(ptr) else {
            return false;
        };
        // SAFETY: `rec` and its neighbours are live records of this table
        unsafe {
            let Record { prev, next, .. } = *rec.as_ptr();
            match NonNull::new(prev) {
                Some(mut prev) => prev.as_mut().next = next,
                None => self.buckets[Self::bucket(ptr)] = next,
            }
            if let Some(mut next) = NonNull::new(next) {
                next.as_mut().prev = prev;
            }
            self.pool.release(rec);
        }
        true
    }

    fn for_each<F: FnMut(&Record)>(&self, mut f: F) {
        for &head in &self.buckets {
            let mut rec = head;
            while let Some(r) = NonNull::new(rec) {
                // SAFETY: live record on a chain
                let r = unsafe { r.as_ref() };
                f(r);
                rec = r.next;
            }
        }
    }
}

#[derive(Clone, Copy)]
struct IgnoreList {
    patterns: [FixedStr<IGNORE_PATTERN_LEN>; MAX_IGNORE_PATTERNS],
    count: usize,
}

impl IgnoreList {
    const fn new() -> Self {
        Self {
            patterns: [FixedStr::new(); MAX_IGNORE_PATTERNS],
            count: 0,
        }
    }

    fn matches(&self, text: &str) -> bool {
        DEFAULT_IGNORE_PATTERNS.iter().any(|p| text.contains(p))
            || self.patterns[..self.count]
                .iter()
                .any(|p| text.contains(p.as_str()))
    }
}

thread_local! {
    static IN_TRACKER: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside the tracker, so allocations it makes
/// meanwhile are not tracked (and cannot recurse back in).
struct ReentrancyGuard(());

impl ReentrancyGuard {
    fn enter() -> Option<Self> {
        IN_TRACKER
            .try_with(|busy| (!busy.replace(true)).then_some(ReentrancyGuard(())))
            .ok()
            .flatten()
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        let _ = IN_TRACKER.try_with(|busy| busy.set(false));
    }
}

/// A registry of live allocations. Allocators call [`LeakTracker::track_alloc`]
/// and [`LeakTracker::untrack_alloc`] from their own alloc/free paths; the
/// table has its own lock, independent of any allocator's.
pub struct LeakTracker {
    enabled: AtomicBool,
    table: Mutex<Table>,
    ignore: Mutex<IgnoreList>,
}

pub(crate) static TRACKER: LeakTracker = LeakTracker::new();

/// The process-wide tracker that allocators report to unless they were given
/// their own
pub fn tracker() -> &'static LeakTracker {
    &TRACKER
}

pub fn set_leak_tracking(enabled: bool) {
    TRACKER.set_enabled(enabled);
}

pub fn is_tracking_leaks() -> bool {
    TRACKER.is_enabled()
}

/// Log every live allocation in the process-wide tracker. Returns the number
/// reported.
pub fn dump_memory() -> usize {
    TRACKER.dump_memory()
}

impl LeakTracker {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            table: Mutex::new(Table::new()),
            ignore: Mutex::new(IgnoreList::new()),
        }
    }

    /// Turn tracking on or off. While off, tracking and untracking are no-ops;
    /// records made earlier are kept.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Record that `ptr` (`size` bytes) was just allocated, with the current
    /// backtrace.
    pub fn track_alloc(&self, ptr: NonNull<u8>, size: usize) {
        if !self.is_enabled() {
            return;
        }
        let Some(_guard) = ReentrancyGuard::enter() else {
            return;
        };
        let mut frames = [0usize; MAX_BACKTRACE_FRAMES];
        let count = SymbolLookup::get_backtrace(&mut frames, TRACK_SKIP_FRAMES, None, None);
        lock(&self.table).insert(ptr.as_ptr() as usize, size, &frames[..count]);
    }

    /// Forget `ptr`. Pointers we never saw (e.g. allocated before tracking
    /// was turned on) are ignored.
    pub fn untrack_alloc(&self, ptr: NonNull<u8>) {
        if !self.is_enabled() {
            return;
        }
        lock(&self.table).remove(ptr.as_ptr() as usize);
    }

    /// Number of live records
    pub fn live_count(&self) -> usize {
        lock(&self.table).pool.live()
    }

    pub fn is_tracked(&self, ptr: NonNull<u8>) -> bool {
        lock(&self.table).find(ptr.as_ptr() as usize).is_some()
    }

    /// The number of frames captured for `ptr`, if it is tracked
    pub fn backtrace_len(&self, ptr: NonNull<u8>) -> Option<usize> {
        let table = lock(&self.table);
        // SAFETY: live record owned by the (locked) table
        table
            .find(ptr.as_ptr() as usize)
            .map(|r| unsafe { r.as_ref().frame_count })
    }

    /// Allocations that went unrecorded because record storage ran out
    pub fn dropped_count(&self) -> usize {
        lock(&self.table).dropped
    }

    /// Leaks whose report contains `pattern` are left out of
    /// [`LeakTracker::dump_memory`]. Returns `false` if the list is full.
    pub fn add_ignore_pattern(&self, pattern: &str) -> bool {
        let mut ignore = lock(&self.ignore);
        if ignore.count == MAX_IGNORE_PATTERNS {
            return false;
        }
        let i = ignore.count;
        ignore.patterns[i] = FixedStr::from_str_truncate(pattern);
        ignore.count += 1;
        true
    }

    /// Log every live allocation through `log`, one leak block per entry.
    /// Returns the number of leaks reported.
    pub fn dump_memory(&self) -> usize {
        let mut sink = LogLines::new();
        let count = self.dump_memory_to(&mut sink);
        sink.flush();
        if count > 0 {
            log::warn!(target: "kdiag::leak", "{count} leaked allocation(s)");
        }
        count
    }

    /// Write a leak block for every live allocation that doesn't match an
    /// ignore pattern to `out`. Returns the number of blocks written.
    pub fn dump_memory_to(&self, out: &mut dyn fmt::Write) -> usize {
        let Some(_guard) = ReentrancyGuard::enter() else {
            return 0;
        };
        let Some(mut scratch) = self.snapshot() else {
            return 0;
        };
        let snapshots = scratch.records();
        snapshots.sort_unstable_by_key(|s| s.ptr);
        let ignore = *lock(&self.ignore);

        let Ok(mut text) = MmapRegion::map(BLOCK_TEXT_BYTES) else {
            return 0;
        };
        let mut block = FixedWriter::new(text.as_mut_slice());
        let symbols = SymbolLookup::is_initialized();
        let mut reported = 0;
        for snap in snapshots.iter() {
            block.clear();
            let _ = write_leak_block(&mut block, snap, symbols);
            if ignore.matches(block.as_str()) {
                continue;
            }
            let _ = out.write_str(block.as_str());
            reported += 1;
        }
        reported
    }

    /// Copy every record into fresh scratch pages, holding the table lock
    /// only for the copy.
    fn snapshot(&self) -> Option<SnapshotBuf> {
        let table = lock(&self.table);
        let len = table.pool.live();
        if len == 0 {
            return None;
        }
        let region = MmapRegion::map(len * std::mem::size_of::<Snapshot>()).ok()?;
        let base = region.as_ptr() as *mut Snapshot;
        let mut i = 0;
        table.for_each(|r| {
            if i < len {
                // SAFETY: `i < len` and the region holds `len` snapshots
                unsafe {
                    base.add(i).write(Snapshot {
                        ptr: r.ptr,
                        size: r.size,
                        frame_count: r.frame_count,
                        frames: r.frames,
                    })
                };
                i += 1;
            }
        });
        Some(SnapshotBuf { region, len: i })
    }
}

impl Default for LeakTracker {
    fn default() -> Self {
        Self::new()
    }
}

struct SnapshotBuf {
    region: MmapRegion,
    len: usize,
}

impl SnapshotBuf {
    fn records(&mut self) -> &mut [Snapshot] {
        // SAFETY: the first `len` snapshots were written by `snapshot`
        unsafe { slice::from_raw_parts_mut(self.region.as_ptr() as *mut Snapshot, self.len) }
    }
}

fn write_leak_block(out: &mut dyn fmt::Write, snap: &Snapshot, symbols: bool) -> fmt::Result {
    writeln!(
        out,
        "[Leak] ** Detected leaked allocation at {:#x} (size = {}) ({} frames)",
        snap.ptr, snap.size, snap.frame_count
    )?;
    for &addr in &snap.frames[..snap.frame_count] {
        if !symbols {
            writeln!(out, "    {addr:#x} (symbols unavailable)")?;
            continue;
        }
        let sym = SymbolLookup::lookup_symbol(addr);
        let function = if sym.function.is_empty() {
            "(unknown function)"
        } else {
            sym.function.as_str()
        };
        if sym.file_path.is_empty() {
            writeln!(out, "    {addr:#x} (unknown source file): {function}")?;
        } else {
            writeln!(
                out,
                "    {}({}): {}",
                sym.file_path, sym.file_line_number, function
            )?;
        }
    }
    Ok(())
}

/// Forwards whole lines to `log`
struct LogLines {
    line: FixedStr<1024>,
}

impl LogLines {
    fn new() -> Self {
        Self {
            line: FixedStr::new(),
        }
    }

    fn flush(&mut self) {
        if !self.line.is_empty() {
            log::warn!(target: "kdiag::leak", "{}", self.line);
            self.line.clear();
        }
    }
}

impl fmt::Write for LogLines {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut rest = s;
        while let Some(i) = rest.find('\n') {
            self.line.push_str(&rest[..i]);
            self.flush();
            rest = &rest[i + 1..];
        }
        self.line.push_str(rest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: usize) -> NonNull<u8> {
        NonNull::new((n * 16) as *mut u8).unwrap()
    }

    #[test]
    fn disabled_tracker_records_nothing() {
        let t = LeakTracker::new();
        t.track_alloc(addr(1), 8);
        assert_eq!(t.live_count(), 0);
    }

    #[test]
    fn track_untrack_with_colliding_buckets() {
        let t = LeakTracker::new();
        t.set_enabled(true);
        // far more records than buckets, so chains are long
        for i in 1..=5000 {
            t.track_alloc(addr(i), i);
        }
        assert_eq!(t.live_count(), 5000);
        for i in (1..=5000).step_by(2) {
            t.untrack_alloc(addr(i));
        }
        assert_eq!(t.live_count(), 2500);
        assert!(!t.is_tracked(addr(1)));
        assert!(t.is_tracked(addr(2)));
        // unknown pointers are fine
        t.untrack_alloc(addr(999_999));
        assert_eq!(t.live_count(), 2500);
    }

    #[test]
    fn one_record_per_pointer() {
        let t = LeakTracker::new();
        t.set_enabled(true);
        t.track_alloc(addr(7), 1);
        t.track_alloc(addr(7), 2);
        assert_eq!(t.live_count(), 1);
        let mut out = String::new();
        assert_eq!(t.dump_memory_to(&mut out), 1);
        assert!(out.contains("(size = 2)"), "{out}");
    }

    #[test]
    fn records_have_a_backtrace() {
        let t = LeakTracker::new();
        t.set_enabled(true);
        t.track_alloc(addr(3), 64);
        assert!(t.backtrace_len(addr(3)).unwrap() > 0);
    }

    #[test]
    fn dump_formats_leak_blocks_and_honours_ignore_list() {
        let t = LeakTracker::new();
        t.set_enabled(true);
        t.track_alloc(addr(1), 64);
        t.track_alloc(addr(2), 128);

        let mut out = String::new();
        assert_eq!(t.dump_memory_to(&mut out), 2);
        assert!(out.contains("[Leak] ** Detected leaked allocation at 0x10 (size = 64)"));
        assert!(out.contains("(size = 128)"));

        // every block mentions "[Leak]", so this hides everything
        assert!(t.add_ignore_pattern("[Leak]"));
        let mut out = String::new();
        assert_eq!(t.dump_memory_to(&mut out), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn log_lines_splits_on_newlines() {
        let mut sink = LogLines::new();
        sink.write_str("abc\ndef").unwrap();
        assert_eq!(sink.line, "def");
        sink.flush();
        assert!(sink.line.is_empty());
    }
}
