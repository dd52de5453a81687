//! C entry points, for SDK consumers that aren't written in Rust. All of them
//! route through the process-wide allocator; failure is a null return.

use std::{
    ffi::{c_char, c_int, CStr},
    ptr::{self, NonNull},
};

use libc::{c_void, size_t};

use crate::alloc;

fn into_raw(p: Result<NonNull<u8>, alloc::AllocError>) -> *mut c_void {
    p.map_or(ptr::null_mut(), |p| p.as_ptr().cast())
}

#[no_mangle]
pub extern "C" fn kdiag_alloc(size: size_t) -> *mut c_void {
    into_raw(alloc::alloc(size))
}

/// # Safety
///
/// - `file` must be null or a NUL-terminated string that lives as long as the
///   process (a `__FILE__` literal)
#[no_mangle]
pub unsafe extern "C" fn kdiag_alloc_debug(
    size: size_t,
    file: *const c_char,
    line: c_int,
) -> *mut c_void {
    let file: &'static str = if file.is_null() {
        "?"
    } else {
        // SAFETY: requirement passed to caller
        unsafe { CStr::from_ptr(file) }.to_str().unwrap_or("?")
    };
    into_raw(alloc::alloc_debug(size, file, line.max(0) as u32))
}

/// `null` allocates; a `size` of zero frees and returns null. On failure the
/// old block is untouched and null is returned.
///
/// # Safety
///
/// - `ptr` must be null or a live block from `kdiag_alloc`/`kdiag_alloc_debug`/
///   `kdiag_realloc`
#[no_mangle]
pub unsafe extern "C" fn kdiag_realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    // SAFETY: requirement passed to caller
    match unsafe { alloc::realloc(NonNull::new(ptr.cast()), size) } {
        Ok(Some(p)) => p.as_ptr().cast(),
        _ => ptr::null_mut(),
    }
}

/// # Safety
///
/// - `ptr` must be null or a live block from `kdiag_alloc`/`kdiag_alloc_debug`/
///   `kdiag_realloc`
#[no_mangle]
pub unsafe extern "C" fn kdiag_free(ptr: *mut c_void) {
    if let Some(p) = NonNull::new(ptr.cast()) {
        // SAFETY: requirement passed to caller
        unsafe { alloc::free(p) }
    }
}

#[no_mangle]
pub extern "C" fn kdiag_alloc_aligned(size: size_t, align: size_t) -> *mut c_void {
    if !align.is_power_of_two() {
        return ptr::null_mut();
    }
    into_raw(alloc::alloc_aligned(size, align))
}

/// # Safety
///
/// - `ptr` must be null or a live block from `kdiag_alloc_aligned`
#[no_mangle]
pub unsafe extern "C" fn kdiag_free_aligned(ptr: *mut c_void) {
    if let Some(p) = NonNull::new(ptr.cast()) {
        // SAFETY: requirement passed to caller
        unsafe { alloc::free_aligned(p) }
    }
}

#[no_mangle]
pub extern "C" fn kdiag_set_leak_tracking(enabled: bool) {
    alloc::set_leak_tracking(enabled);
}

#[no_mangle]
pub extern "C" fn kdiag_is_tracking_leaks() -> bool {
    alloc::is_tracking_leaks()
}

/// Logs every live tracked allocation and returns how many there were
#[no_mangle]
pub extern "C" fn kdiag_dump_memory() -> c_int {
    c_int::try_from(alloc::dump_memory()).unwrap_or(c_int::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_round_trip() {
        let _guard = crate::test_lock();
        unsafe {
            let p = kdiag_alloc(32) as *mut u8;
            assert!(!p.is_null());
            p.write_bytes(7, 32);
            let q = kdiag_realloc(p.cast(), 64) as *mut u8;
            assert!(!q.is_null());
            assert_eq!(*q.add(31), 7);
            assert!(kdiag_realloc(q.cast(), 0).is_null());

            let file = c"externc.c";
            let p = kdiag_alloc_debug(8, file.as_ptr(), 12);
            assert!(!p.is_null());
            kdiag_free(p);
            kdiag_free(ptr::null_mut());

            let p = kdiag_alloc_aligned(100, 512);
            assert_eq!(p as usize % 512, 0);
            kdiag_free_aligned(p);
            assert!(kdiag_alloc_aligned(8, 3).is_null());
        }
    }
}
