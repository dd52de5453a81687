//! Memory-safety bugs in blocks from the debug page allocator fault, every
//! time.

mod common;

use std::ptr::{self, NonNull};

use common::{run_in_child, serial, ChildExit};
use kdiag::{
    alloc::{page::DEFAULT_ALIGNMENT, Allocator, DebugPageAllocator},
    util::num::align_up,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn allocator() -> &'static DebugPageAllocator {
    Box::leak(Box::new(DebugPageAllocator::new()))
}

/// The first byte past the usable end of a block of `size` bytes. Blocks are
/// aligned to [`DEFAULT_ALIGNMENT`], so up to that many bytes of slack sit
/// between the user's last byte and the guard page.
fn first_guard_byte(p: NonNull<u8>, size: usize) -> *mut u8 {
    p.as_ptr().wrapping_add(align_up(size, DEFAULT_ALIGNMENT))
}

#[test]
fn writing_one_past_an_aligned_size_faults() {
    let _guard = serial();
    for size in [0, 16, 48, 4080, 4096, 8192 + 32] {
        let exit = run_in_child(|| {
            let a = allocator();
            let p = a.alloc(size).unwrap();
            // SAFETY: in bounds
            unsafe { ptr::write_bytes(p.as_ptr(), 0x11, size) };
            // SAFETY: not at all; this is the overrun under test
            unsafe { ptr::write_volatile(p.as_ptr().add(size), 0x22) };
        });
        assert!(exit.is_memory_fault(), "size {size}: {exit:?}");
    }
}

#[test]
fn writing_past_the_slack_of_an_odd_size_faults() {
    let _guard = serial();
    for size in [1, 17, 4095, 8191] {
        let exit = run_in_child(|| {
            let a = allocator();
            let p = a.alloc(size).unwrap();
            // SAFETY: in bounds
            unsafe { ptr::write_bytes(p.as_ptr(), 0x11, size) };
            // SAFETY: not at all; this is the overrun under test
            unsafe { ptr::write_volatile(first_guard_byte(p, size), 0x22) };
        });
        assert!(exit.is_memory_fault(), "size {size}: {exit:?}");
    }
}

#[test]
fn reading_past_the_slack_faults_for_any_size() {
    let _guard = serial();
    let mut rng = StdRng::seed_from_u64(0x6b64_6961);
    for _ in 0..8 {
        let size = rng.gen_range(1..20_000);
        let exit = run_in_child(|| {
            let a = allocator();
            let p = a.alloc(size).unwrap();
            // SAFETY: the overrun under test
            let _ = unsafe { ptr::read_volatile(first_guard_byte(p, size)) };
        });
        assert!(exit.is_memory_fault(), "size {size}: {exit:?}");
    }
}

#[test]
fn in_bounds_writes_never_fault() {
    let _guard = serial();
    let exit = run_in_child(|| {
        let a = allocator();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let size = rng.gen_range(0..10_000);
            let align = 1 << rng.gen_range(0..=11);
            let p = a.alloc_aligned(size, align).unwrap();
            assert_eq!(p.as_ptr() as usize % align, 0);
            // SAFETY: exactly `size` bytes from `p`
            unsafe {
                ptr::write_bytes(p.as_ptr(), 0x5a, size);
                a.free_aligned(p);
            }
        }
    });
    assert_eq!(exit, ChildExit::Exited(0));
}

#[test]
fn use_after_free_faults() {
    let _guard = serial();
    for touch_write in [false, true] {
        let exit = run_in_child(|| {
            let a = allocator();
            let p = a.alloc(64).unwrap();
            // SAFETY: `p` is live
            unsafe {
                p.as_ptr().write(1);
                a.free(p);
            }
            // SAFETY: the use-after-free under test
            unsafe {
                if touch_write {
                    ptr::write_volatile(p.as_ptr(), 2);
                } else {
                    let _ = ptr::read_volatile(p.as_ptr());
                }
            }
        });
        assert!(exit.is_memory_fault(), "write {touch_write}: {exit:?}");
    }
}

#[test]
fn every_block_in_the_ring_stays_protected() {
    let _guard = serial();
    const N: usize = 8;
    let exit = run_in_child(|| {
        let a = allocator();
        a.set_max_delayed_free_count(N).unwrap();
        let blocks: Vec<_> = (0..N).map(|_| a.alloc(100).unwrap()).collect();
        for &p in &blocks {
            // SAFETY: live
            unsafe { a.free(p) };
        }
        assert_eq!(a.delayed_free_len(), N);
        assert!(blocks.iter().all(|p| a.is_delay_freed(p.as_ptr() as usize)));
        // SAFETY: the oldest freed block; still in the ring, so this faults
        let _ = unsafe { ptr::read_volatile(blocks[0].as_ptr()) };
    });
    assert!(exit.is_memory_fault(), "{exit:?}");
}

#[test]
fn the_block_after_capacity_evicts_the_oldest() {
    let _guard = serial();
    const N: usize = 4;
    let a = allocator();
    a.set_max_delayed_free_count(N).unwrap();
    let blocks: Vec<_> = (0..=N).map(|_| a.alloc(32).unwrap()).collect();
    for &p in &blocks {
        // SAFETY: live
        unsafe { a.free(p) };
    }
    assert_eq!(a.delayed_free_len(), N);
    assert!(!a.is_delay_freed(blocks[0].as_ptr() as usize));
    assert!(blocks[1..].iter().all(|p| a.is_delay_freed(p.as_ptr() as usize)));
}

#[test]
fn zero_sized_blocks_leave_neighbours_alone() {
    let _guard = serial();
    let a = allocator();
    let before = a.alloc(32).unwrap();
    // SAFETY: live, 32 bytes
    unsafe { ptr::write_bytes(before.as_ptr(), 0xB1, 32) };
    let empty = a.alloc(0).unwrap();
    let after = a.alloc(32).unwrap();
    // SAFETY: live, 32 bytes
    unsafe { ptr::write_bytes(after.as_ptr(), 0xA1, 32) };
    // SAFETY: live
    unsafe { a.free(empty) };
    // SAFETY: both still live
    unsafe {
        assert!(std::slice::from_raw_parts(before.as_ptr(), 32).iter().all(|&b| b == 0xB1));
        assert!(std::slice::from_raw_parts(after.as_ptr(), 32).iter().all(|&b| b == 0xA1));
        a.free(before);
        a.free(after);
    }
    assert_eq!(a.allocation_count(), 0);
}

#[test]
fn realloc_keeps_the_common_prefix() {
    let _guard = serial();
    let a = allocator();
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..50 {
        let small = rng.gen_range(1..3000);
        let big = small + rng.gen_range(1..9000);
        let p = a.alloc(small).unwrap();
        // SAFETY: each pointer is live and at least as big as what we touch
        unsafe {
            for i in 0..small {
                p.as_ptr().add(i).write(i as u8 ^ 0x3c);
            }
            let q = a.realloc(Some(p), big).unwrap().unwrap();
            let r = a.realloc(Some(q), small).unwrap().unwrap();
            assert!((0..small).all(|i| r.as_ptr().add(i).read() == i as u8 ^ 0x3c));
            assert_eq!(a.realloc(Some(r), 0), Ok(None));
        }
    }
    assert_eq!(a.allocation_count(), 0);
}

#[test]
fn without_overrun_detection_blocks_still_fault_after_free() {
    let _guard = serial();
    let exit = run_in_child(|| {
        let a = allocator();
        a.enable_overrun_detection(false, false).unwrap();
        assert_eq!(a.overrun_detection(), (false, false));
        let p = a.alloc(256).unwrap();
        // SAFETY: live; then the use-after-free under test
        unsafe {
            ptr::write_bytes(p.as_ptr(), 0, 256);
            a.free(p);
            let _ = ptr::read_volatile(p.as_ptr().add(128));
        }
    });
    assert!(exit.is_memory_fault(), "{exit:?}");
}
