//! Enumerating the modules (executable + shared objects) mapped into this
//! process.

use crate::util::fixed::FixedStr;

pub const MODULE_PATH_LEN: usize = 512;
pub const MODULE_NAME_LEN: usize = 32;

/// One loaded module. Plain data, fixed size, so snapshots can live in static
/// storage and be read from a fault handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Where the module's lowest mapping starts
    pub base_address: usize,
    /// Bytes from `base_address` to the end of the module's highest mapping
    pub size: usize,
    pub file_path: FixedStr<MODULE_PATH_LEN>,
    /// The last component of `file_path`
    pub name: FixedStr<MODULE_NAME_LEN>,
    /// Permissions of the first mapping, `/proc/self/maps` style (`r-xp`)
    pub permissions: FixedStr<8>,
}

impl ModuleInfo {
    pub const EMPTY: ModuleInfo = ModuleInfo {
        base_address: 0,
        size: 0,
        file_path: FixedStr::new(),
        name: FixedStr::new(),
        permissions: FixedStr::new(),
    };

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base_address && addr - self.base_address < self.size
    }

    fn set_path(&mut self, path: &str) {
        self.file_path = FixedStr::from_str_truncate(path);
        let name = path.rsplit('/').next().unwrap_or(path);
        self.name = FixedStr::from_str_truncate(name);
    }
}

impl Default for ModuleInfo {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Fill `out` with the modules of this process, returning how many were
/// written. Modules past `out.len()` are dropped.
pub fn enumerate(out: &mut [ModuleInfo]) -> usize {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        enumerate_proc_maps(out)
    }
    #[cfg(target_vendor = "apple")]
    {
        enumerate_dyld(out)
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_vendor = "apple")))]
    {
        let _ = out;
        0
    }
}

/// Read `/proc/self/maps` in page-sized chunks, merging consecutive mappings of
/// the same file into one module.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn enumerate_proc_maps(out: &mut [ModuleInfo]) -> usize {
    // SAFETY: the path is NUL-terminated
    let fd = unsafe { libc::open(c"/proc/self/maps".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return 0;
    }
    let mut count = 0;
    let mut chunk = [0u8; 4096];
    // a single maps line never gets near this long in practice; longer lines
    // are cut and their path ends up truncated
    let mut line = [0u8; 1024];
    let mut line_len = 0;
    loop {
        // SAFETY: reading into a local buffer of the given length
        let n = unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len()) };
        if n <= 0 {
            break;
        }
        for &b in &chunk[..n as usize] {
            if b == b'\n' {
                add_maps_line(&line[..line_len], out, &mut count);
                line_len = 0;
            } else if line_len < line.len() {
                line[line_len] = b;
                line_len += 1;
            }
        }
    }
    if line_len > 0 {
        add_maps_line(&line[..line_len], out, &mut count);
    }
    // SAFETY: opened above
    unsafe { libc::close(fd) };
    count
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn add_maps_line(line: &[u8], out: &mut [ModuleInfo], count: &mut usize) {
    let Some(entry) = MapsEntry::parse(line) else {
        return;
    };
    // anonymous mappings, [stack], [heap], [vdso] ... aren't modules
    if !entry.path.starts_with('/') {
        return;
    }
    if *count > 0 {
        let last = &mut out[*count - 1];
        if last.file_path == entry.path {
            last.size = entry.end.max(last.base_address + last.size) - last.base_address;
            return;
        }
    }
    if *count == out.len() {
        return;
    }
    let module = &mut out[*count];
    *module = ModuleInfo::EMPTY;
    module.base_address = entry.start;
    module.size = entry.end - entry.start;
    module.set_path(entry.path);
    module.permissions = FixedStr::from_str_truncate(entry.perms);
    *count += 1;
}

/// One parsed line of `/proc/<pid>/maps`
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct MapsEntry<'a> {
    pub start: usize,
    pub end: usize,
    pub perms: &'a str,
    pub path: &'a str,
}

impl<'a> MapsEntry<'a> {
    /// `start-end perms offset dev inode [path]`
    pub fn parse(line: &'a [u8]) -> Option<Self> {
        let line = std::str::from_utf8(line).ok()?;
        let mut fields = line.splitn(6, ' ');
        let range = fields.next()?;
        let perms = fields.next()?;
        let _offset = fields.next()?;
        let _dev = fields.next()?;
        let _inode = fields.next()?;
        let path = fields.next().unwrap_or("").trim_start();
        let (start, end) = range.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        if end <= start {
            return None;
        }
        Some(Self {
            start,
            end,
            perms,
            path,
        })
    }
}

#[cfg(target_vendor = "apple")]
fn enumerate_dyld(out: &mut [ModuleInfo]) -> usize {
    use std::ffi::CStr;

    // SAFETY: dyld's image list is safe to read from any thread; images can
    // come and go underneath us, in which case we get nulls and skip them
    let images = unsafe { libc::_dyld_image_count() } as usize;
    let mut count = 0;
    for i in 0..images {
        if count == out.len() {
            break;
        }
        let (header, name) = unsafe {
            (
                libc::_dyld_get_image_header(i as u32),
                libc::_dyld_get_image_name(i as u32),
            )
        };
        if header.is_null() || name.is_null() {
            continue;
        }
        // SAFETY: dyld hands out NUL-terminated paths that live as long as the
        // image does
        let path = unsafe { CStr::from_ptr(name) };
        let path = FixedStr::<MODULE_PATH_LEN>::from_bytes_lossy(path.to_bytes());
        let module = &mut out[count];
        *module = ModuleInfo::EMPTY;
        module.base_address = header as usize;
        module.set_path(path.as_str());
        module.permissions = FixedStr::from_str_truncate("r-x");
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_file_backed_mapping() {
        let line = b"7f2c1a000000-7f2c1a021000 r-xp 00000000 fd:01 1234   /usr/lib/libc.so.6";
        let e = MapsEntry::parse(line).unwrap();
        assert_eq!(e.start, 0x7f2c1a000000);
        assert_eq!(e.end, 0x7f2c1a021000);
        assert_eq!(e.perms, "r-xp");
        assert_eq!(e.path, "/usr/lib/libc.so.6");
    }

    #[test]
    fn parses_an_anonymous_mapping() {
        let e = MapsEntry::parse(b"00400000-00452000 rw-p 00000000 00:00 0").unwrap();
        assert_eq!(e.path, "");
        assert!(MapsEntry::parse(b"garbage").is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn our_own_code_is_inside_some_module() {
        let mut modules = vec![ModuleInfo::EMPTY; 256];
        let n = enumerate(&mut modules);
        assert!(n > 0);
        let here = our_own_code_is_inside_some_module as usize;
        let m = modules[..n].iter().find(|m| m.contains(here)).unwrap();
        assert!(!m.name.is_empty());
        assert!(m.file_path.as_str().ends_with(m.name.as_str()));
    }
}
