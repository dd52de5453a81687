//! Rust's own allocations going through the debug page allocator. This has
//! to be its own test binary: a global allocator is for the whole program.

mod common;

use std::collections::HashMap;

use common::{run_in_child, serial};
use kdiag::alloc::{DebugPageAllocator, KernelAlloc};

static PAGES: DebugPageAllocator = DebugPageAllocator::new();

#[global_allocator]
static GLOBAL: KernelAlloc = KernelAlloc::with(&PAGES);

#[test]
fn collections_work_on_guarded_pages() {
    let _guard = serial();
    let mut map = HashMap::new();
    for i in 0..500u32 {
        map.insert(i, format!("value {i}"));
    }
    let mut v: Vec<u64> = (0..10_000).collect();
    v.retain(|x| x % 3 == 0);
    v.shrink_to_fit();
    assert_eq!(v.len(), 3334);
    assert_eq!(map[&321], "value 321");
    assert!(PAGES.allocation_count() > 0);
}

#[test]
fn over_aligned_boxes() {
    #[repr(align(1024))]
    struct Big([u8; 3000]);

    let _guard = serial();
    let b = Box::new(Big([9; 3000]));
    assert_eq!(&*b as *const Big as usize % 1024, 0);
    assert!(b.0.iter().all(|&x| x == 9));
}

#[test]
fn vec_overrun_through_raw_pointer_faults() {
    let _guard = serial();
    let exit = run_in_child(|| {
        let v: Vec<u8> = Vec::with_capacity(4096);
        let p = v.as_ptr();
        // SAFETY: the overrun under test
        let _ = unsafe { std::ptr::read_volatile(p.add(4096)) };
    });
    assert!(exit.is_memory_fault(), "{exit:?}");
}

#[test]
fn dropped_box_faults_when_read() {
    let _guard = serial();
    let exit = run_in_child(|| {
        let b = Box::new([7u8; 100]);
        let p = &*b as *const [u8; 100] as *const u8;
        drop(b);
        // SAFETY: the use-after-free under test
        let _ = unsafe { std::ptr::read_volatile(p) };
    });
    assert!(exit.is_memory_fault(), "{exit:?}");
}
