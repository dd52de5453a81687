//! Leak tracking through the process-wide allocator entry points.

mod common;

use common::serial;
use kdiag::{
    alloc::{self, leak, DebugPageAllocator, LeakTracker, Allocator},
    kdiag_alloc,
    symbol::SymbolLookup,
};

#[test]
fn one_survivor_out_of_a_thousand() {
    let _guard = serial();
    SymbolLookup::initialize();
    alloc::set_leak_tracking(true);

    let blocks: Vec<_> = (0..1000).map(|i| alloc::alloc(8 + i % 64).unwrap()).collect();
    let survivor = blocks[517];
    for (i, &p) in blocks.iter().enumerate() {
        if i != 517 {
            // SAFETY: live, from `alloc`
            unsafe { alloc::free(p) };
        }
    }

    let mut out = String::new();
    assert_eq!(leak::tracker().dump_memory_to(&mut out), 1);
    assert!(leak::tracker().backtrace_len(survivor).unwrap() > 0);
    assert!(out.contains("[Leak] ** Detected leaked allocation at"), "{out}");
    assert!(out.lines().count() > 1, "no frames in:\n{out}");
    assert_eq!(alloc::dump_memory(), 1);

    // SAFETY: live
    unsafe { alloc::free(survivor) };
    assert_eq!(alloc::dump_memory(), 0);

    alloc::set_leak_tracking(false);
    SymbolLookup::shutdown();
}

#[test]
fn named_block_shows_up_in_the_dump() {
    let _guard = serial();
    SymbolLookup::initialize();
    alloc::set_leak_tracking(true);
    assert!(alloc::is_tracking_leaks());

    let p = kdiag_alloc!(64).unwrap();
    let mut out = String::new();
    assert_eq!(leak::tracker().dump_memory_to(&mut out), 1);
    assert!(out.contains("(size = 64)"), "{out}");
    assert!(
        out.contains("): ") || out.contains("(unknown source file)") || out.contains("(symbols unavailable)"),
        "no frame lines in:\n{out}"
    );

    // SAFETY: live
    unsafe { alloc::free(p) };
    assert_eq!(alloc::dump_memory(), 0);
    alloc::set_leak_tracking(false);
    SymbolLookup::shutdown();
}

#[test]
fn debug_page_allocator_reports_to_its_own_tracker() {
    static TRACKER: LeakTracker = LeakTracker::new();
    static PAGES: DebugPageAllocator = DebugPageAllocator::with_tracker(&TRACKER);
    TRACKER.set_enabled(true);

    let a = PAGES.alloc(300).unwrap();
    let b = PAGES.alloc_aligned(40, 256).unwrap();
    assert_eq!(TRACKER.live_count(), 2);
    // SAFETY: live
    unsafe { PAGES.free(a) };
    assert!(!TRACKER.is_tracked(a));
    assert!(TRACKER.is_tracked(b));

    let mut out = String::new();
    assert_eq!(TRACKER.dump_memory_to(&mut out), 1);
    assert!(out.contains("(size = 40)"), "{out}");
    // SAFETY: live
    unsafe { PAGES.free_aligned(b) };
    assert_eq!(TRACKER.live_count(), 0);
}

#[test]
fn nothing_is_recorded_while_tracking_is_off() {
    let _guard = serial();
    assert!(!alloc::is_tracking_leaks());
    let p = alloc::alloc(128).unwrap();
    assert!(!leak::tracker().is_tracked(p));
    alloc::set_leak_tracking(true);
    // allocated before tracking: freeing it is ignored
    // SAFETY: live
    unsafe { alloc::free(p) };
    assert_eq!(leak::tracker().live_count(), 0);
    alloc::set_leak_tracking(false);
}
