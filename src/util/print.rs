//! Printing that never goes near the allocator. Everything here ends up in a
//! `write(2)`, so it is fine to call from a signal handler or while an
//! allocator lock is held.

use std::{fmt, os::fd::RawFd};

/// Write `s` to stderr verbatim
pub fn eputs(s: &str) {
    write_all(libc::STDERR_FILENO, s.as_bytes());
}

/// Write all of `buf` to `fd`, retrying on `EINTR` and short writes. Returns
/// `false` if the descriptor stopped accepting bytes.
pub fn write_all(fd: RawFd, mut buf: &[u8]) -> bool {
    while !buf.is_empty() {
        // SAFETY: `buf` is a valid slice for `buf.len()` bytes of reads
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return false;
        }
        if n == 0 {
            return false;
        }
        buf = &buf[n as usize..];
    }
    true
}

/// An `fmt::Write` that goes straight to a file descriptor. It does not own the
/// descriptor.
pub struct FdWriter {
    fd: RawFd,
    failed: bool,
}

impl FdWriter {
    pub const fn new(fd: RawFd) -> Self {
        Self { fd, failed: false }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Did any write fail? Formatting keeps going after a failure, so that a
    /// half-broken report still gets as far as it can.
    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn write_bytes(&mut self, buf: &[u8]) {
        if !write_all(self.fd, buf) {
            self.failed = true;
        }
    }
}

impl fmt::Write for FdWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Basically just `eprintln!()` but never allocates. Output longer than the
/// internal line buffer is truncated.
#[macro_export]
macro_rules! raw_eprintln {
    ($($arg:tt)*) => {{
        use ::std::fmt::Write as _;
        let mut line = $crate::util::fixed::FixedStr::<512>::new();
        let _ = ::std::write!(line, $($arg)*);
        let _ = line.write_char('\n');
        $crate::util::print::eputs(line.as_str());
    }};
}
