//! Fixed-capacity text buffers. These are how we build strings in places where
//! the allocator is off-limits: inside a fault handler, while the leak table is
//! locked, or while the allocator we would be calling into is the thing being
//! inspected.

use std::{fmt, str};

/// A string of at most `N` bytes, stored inline. Writes past the capacity are
/// silently truncated on a `char` boundary.
#[derive(Clone, Copy)]
pub struct FixedStr<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> FixedStr<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
        }
    }

    /// Construct from `s`, truncating if it does not fit
    pub fn from_str_truncate(s: &str) -> Self {
        let mut out = Self::new();
        out.push_str(s);
        out
    }

    /// Construct from raw bytes, replacing the string with nothing if the
    /// bytes are not valid UTF-8 up to the first invalid sequence.
    pub fn from_bytes_lossy(bytes: &[u8]) -> Self {
        let valid = match str::from_utf8(bytes) {
            Ok(s) => s,
            // SAFETY: `valid_up_to` is the length of the valid prefix
            Err(e) => unsafe { str::from_utf8_unchecked(&bytes[..e.valid_up_to()]) },
        };
        Self::from_str_truncate(valid)
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: we only ever copy in whole `char`s from `&str`s
        unsafe { str::from_utf8_unchecked(&self.buf[..self.len]) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Append as much of `s` as fits. Returns `false` if anything was cut off.
    pub fn push_str(&mut self, s: &str) -> bool {
        let room = N - self.len;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        take == s.len()
    }

    /// Shorten to `len` bytes, rounding down to a `char` boundary
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            let mut len = len;
            while !self.as_str().is_char_boundary(len) {
                len -= 1;
            }
            self.len = len;
        }
    }

    /// The contents as a NUL-terminated C string, for handing to libc. This
    /// copies into `out`, which needs one spare byte.
    pub fn to_cstr_buf<'a>(&self, out: &'a mut [u8; N]) -> Option<&'a std::ffi::CStr> {
        if self.len >= N || self.as_bytes().contains(&0) {
            return None;
        }
        out[..self.len].copy_from_slice(self.as_bytes());
        out[self.len] = 0;
        std::ffi::CStr::from_bytes_with_nul(&out[..=self.len]).ok()
    }
}

impl<const N: usize> Default for FixedStr<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for FixedStr<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_str(s);
        Ok(())
    }
}

impl<const N: usize> fmt::Display for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl<const N: usize> PartialEq for FixedStr<N> {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl<const N: usize> Eq for FixedStr<N> {}

impl<const N: usize> PartialEq<str> for FixedStr<N> {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl<const N: usize> PartialEq<&str> for FixedStr<N> {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// `fmt::Write` over a borrowed byte buffer. Used when the buffer is larger
/// than we'd like to keep on the stack (e.g. scratch pages from `mmap`).
pub struct FixedWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
    truncated: bool,
}

impl<'a> FixedWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            len: 0,
            truncated: false,
        }
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: only whole `char`s are ever written
        unsafe { str::from_utf8_unchecked(&self.buf[..self.len]) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.truncated = false;
    }
}

impl fmt::Write for FixedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        if take != s.len() {
            self.truncated = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn fixed_str_truncates_on_char_boundary() {
        let mut s = FixedStr::<5>::new();
        assert!(!s.push_str("ab\u{e9}\u{e9}"));
        // 'a' 'b' then one two-byte char, the second doesn't fit
        assert_eq!(s.as_str(), "ab\u{e9}");
        assert_eq!(s.len(), 4);
    }

    #[test]
    fn fixed_str_formats() {
        let mut s = FixedStr::<64>::new();
        write!(s, "{:#x} ({} frames)", 0xdead_usize, 3).unwrap();
        assert_eq!(s, "0xdead (3 frames)");
        s.truncate(6);
        assert_eq!(s, "0xdead");
    }

    #[test]
    fn fixed_str_to_cstr() {
        let s = FixedStr::<16>::from_str_truncate("/tmp/x");
        let mut buf = [0u8; 16];
        assert_eq!(s.to_cstr_buf(&mut buf).unwrap().to_bytes(), b"/tmp/x");

        let full = FixedStr::<4>::from_str_truncate("abcd");
        let mut buf = [0u8; 4];
        assert!(full.to_cstr_buf(&mut buf).is_none());
    }

    #[test]
    fn fixed_writer_reports_truncation() {
        let mut buf = [0u8; 8];
        let mut w = FixedWriter::new(&mut buf);
        write!(w, "0123456789").unwrap();
        assert!(w.truncated());
        assert_eq!(w.as_str(), "01234567");
    }

    #[test]
    fn from_bytes_lossy_keeps_valid_prefix() {
        let s = FixedStr::<16>::from_bytes_lossy(b"ok\xffnope");
        assert_eq!(s, "ok");
    }
}
