//! The thin platform layer. Every `cfg(target_os)` branch in the crate lives
//! under here; the rest of the crate talks to these modules only.

#[cfg(not(unix))]
compile_error!("kdiag only supports unix targets");

pub mod mem;
pub mod modules;
pub mod signal;
pub mod thread;

use libc::{EACCES, EAGAIN, EBADF, EEXIST, EFAULT, EINTR, EINVAL, ENFILE, ENOENT, ENOMEM, EPERM};

/// Name an `errno` value without touching `strerror` (which is not
/// async-signal-safe and may allocate for its locale tables).
pub fn errno_name(errno: i32) -> &'static str {
    match errno {
        ENOMEM => "ENOMEM",
        EACCES => "EACCES",
        EAGAIN => "EAGAIN",
        EBADF => "EBADF",
        EINVAL => "EINVAL",
        ENFILE => "ENFILE",
        ENOENT => "ENOENT",
        EEXIST => "EEXIST",
        EFAULT => "EFAULT",
        EINTR => "EINTR",
        EPERM => "EPERM",
        _ => "unknown",
    }
}

/// Read the file at `path` into `buf` using raw syscalls. Returns the number of
/// bytes read, stopping when `buf` is full.
pub(crate) fn read_file_into(path: &std::ffi::CStr, buf: &mut [u8]) -> Option<usize> {
    // SAFETY: `path` is NUL-terminated
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return None;
    }
    let mut total = 0;
    while total < buf.len() {
        // SAFETY: we read into the unfilled tail of `buf`
        let n = unsafe {
            libc::read(
                fd,
                buf[total..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - total,
            )
        };
        if n < 0 {
            if std::io::Error::last_os_error().raw_os_error() == Some(EINTR) {
                continue;
            }
            break;
        }
        if n == 0 {
            break;
        }
        total += n as usize;
    }
    // SAFETY: `fd` was opened above and is not shared
    unsafe { libc::close(fd) };
    Some(total)
}
