//! Thread and process introspection. All of this works without allocating so
//! that the fault handler can use it.

use std::ffi::CStr;

use crate::util::fixed::FixedStr;

/// The kernel's id for a thread (`gettid()` on Linux, the 64-bit thread id on
/// Apple platforms). This is what debuggers and `/proc` show.
pub type ThreadSysId = u64;

pub const THREAD_NAME_LEN: usize = 32;

/// The calling thread's kernel id
pub fn current_thread_sys_id() -> ThreadSysId {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        // SAFETY: gettid takes no arguments and cannot fail
        unsafe { libc::syscall(libc::SYS_gettid) as ThreadSysId }
    }
    #[cfg(target_vendor = "apple")]
    {
        let mut id = 0u64;
        // SAFETY: a null thread means the calling thread
        unsafe { libc::pthread_threadid_np(0 as libc::pthread_t, &mut id) };
        id
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_vendor = "apple")))]
    {
        // SAFETY: pthread_self cannot fail
        unsafe { libc::pthread_self() as usize as ThreadSysId }
    }
}

/// The calling thread's name, as the OS sees it
pub fn current_thread_name() -> FixedStr<THREAD_NAME_LEN> {
    let mut buf = [0u8; THREAD_NAME_LEN];
    #[cfg(any(target_os = "linux", target_os = "android"))]
    // SAFETY: PR_GET_NAME writes at most 16 bytes including the NUL
    let ok = unsafe { libc::prctl(libc::PR_GET_NAME, buf.as_mut_ptr()) } == 0;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    // SAFETY: the buffer length is passed along
    let ok = unsafe {
        libc::pthread_getname_np(libc::pthread_self(), buf.as_mut_ptr() as *mut _, buf.len())
    } == 0;
    if !ok {
        return FixedStr::new();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    FixedStr::from_bytes_lossy(&buf[..len])
}

/// The name of thread `tid` in this process, if it can be read
pub fn thread_name(tid: ThreadSysId) -> FixedStr<THREAD_NAME_LEN> {
    if tid == current_thread_sys_id() {
        return current_thread_name();
    }
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        use std::fmt::Write;
        let mut path = FixedStr::<64>::new();
        let _ = write!(path, "/proc/self/task/{tid}/comm");
        let mut path_buf = [0u8; 64];
        let mut buf = [0u8; THREAD_NAME_LEN];
        if let Some(path) = path.to_cstr_buf(&mut path_buf) {
            if let Some(n) = super::read_file_into(path, &mut buf) {
                let name = &buf[..n];
                let name = name.strip_suffix(b"\n").unwrap_or(name);
                return FixedStr::from_bytes_lossy(name);
            }
        }
    }
    FixedStr::new()
}

/// Fill `out` with the ids of this process's threads. Returns the total
/// number of threads, which may exceed `out.len()`; only the first
/// `out.len()` are written.
pub fn thread_list(out: &mut [ThreadSysId]) -> usize {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let mut n = 0;
        for_each_numeric_dir_entry(c"/proc/self/task", |id| {
            if let Some(slot) = out.get_mut(n) {
                *slot = id;
            }
            n += 1;
        });
        if n > 0 {
            return n;
        }
    }
    // Without /proc all we can see is ourselves
    if out.is_empty() {
        return 0;
    }
    out[0] = current_thread_sys_id();
    1
}

/// Call `f(pid, name)` for every process visible to us. Returns `false` if the
/// process table cannot be enumerated on this platform.
pub fn for_each_process<F>(mut f: F) -> bool
where
    F: FnMut(u64, &str),
{
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        use std::fmt::Write;
        let mut any = false;
        for_each_numeric_dir_entry(c"/proc", |pid| {
            any = true;
            let mut path = FixedStr::<64>::new();
            let _ = write!(path, "/proc/{pid}/comm");
            let mut path_buf = [0u8; 64];
            let mut name = [0u8; 64];
            let len = path
                .to_cstr_buf(&mut path_buf)
                .and_then(|p| super::read_file_into(p, &mut name))
                .unwrap_or(0);
            let name = &name[..len];
            let name = FixedStr::<64>::from_bytes_lossy(name.strip_suffix(b"\n").unwrap_or(name));
            f(pid, name.as_str());
        });
        any
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = &mut f;
        false
    }
}

/// Walk a directory with `getdents64`, calling `f` for every entry whose name is
/// a decimal number. `opendir` would allocate its `DIR` buffer, so we don't
/// use it.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn for_each_numeric_dir_entry<F>(path: &CStr, mut f: F)
where
    F: FnMut(u64),
{
    // SAFETY: `path` is NUL-terminated
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return;
    }
    // `linux_dirent64` needs 8-byte alignment
    let mut buf = [0u64; 512];
    loop {
        // SAFETY: `buf` is a writable buffer of the given byte length
        let n = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                fd,
                buf.as_mut_ptr(),
                std::mem::size_of_val(&buf),
            )
        };
        if n <= 0 {
            break;
        }
        let bytes = &buf as *const [u64; 512] as *const u8;
        let mut off = 0usize;
        while off < n as usize {
            // struct linux_dirent64 { u64 d_ino; i64 d_off; u16 d_reclen; u8 d_type; char d_name[]; }
            // SAFETY: the kernel wrote a whole record at `off`
            let (reclen, name) = unsafe {
                let rec = bytes.add(off);
                let reclen = (rec.add(16) as *const u16).read_unaligned() as usize;
                let name = CStr::from_ptr(rec.add(19) as *const libc::c_char);
                (reclen, name)
            };
            if let Some(id) = parse_decimal(name.to_bytes()) {
                f(id);
            }
            if reclen == 0 {
                break;
            }
            off += reclen;
        }
    }
    // SAFETY: opened above
    unsafe { libc::close(fd) };
}

fn parse_decimal(s: &[u8]) -> Option<u64> {
    if s.is_empty() {
        return None;
    }
    let mut v = 0u64;
    for &c in s {
        if !c.is_ascii_digit() {
            return None;
        }
        v = v.checked_mul(10)?.checked_add((c - b'0') as u64)?;
    }
    Some(v)
}

/// The calling thread's stack as `(low, high)` addresses
pub fn stack_bounds() -> Option<(usize, usize)> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let mut attr = std::mem::MaybeUninit::<libc::pthread_attr_t>::uninit();
        // SAFETY: pthread_getattr_np initializes `attr` on success, and we
        // destroy it on every path after that
        unsafe {
            if libc::pthread_getattr_np(libc::pthread_self(), attr.as_mut_ptr()) != 0 {
                return None;
            }
            let mut addr = std::ptr::null_mut();
            let mut size = 0;
            let rc = libc::pthread_attr_getstack(attr.as_ptr(), &mut addr, &mut size);
            libc::pthread_attr_destroy(attr.as_mut_ptr());
            if rc != 0 {
                return None;
            }
            Some((addr as usize, addr as usize + size))
        }
    }
    #[cfg(target_vendor = "apple")]
    {
        // SAFETY: both calls only query the calling thread
        unsafe {
            let this = libc::pthread_self();
            let high = libc::pthread_get_stackaddr_np(this) as usize;
            let size = libc::pthread_get_stacksize_np(this);
            Some((high - size, high))
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_vendor = "apple")))]
    {
        None
    }
}

/// Is a debugger (or any tracer) attached to this process?
pub fn is_debugger_present() -> bool {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let mut buf = [0u8; 4096];
        let Some(n) = super::read_file_into(c"/proc/self/status", &mut buf) else {
            return false;
        };
        buf[..n]
            .split(|&b| b == b'\n')
            .find_map(|line| line.strip_prefix(b"TracerPid:"))
            .map(|rest| {
                let rest: &[u8] = rest.trim_ascii();
                parse_decimal(rest).is_some_and(|pid| pid != 0)
            })
            .unwrap_or(false)
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_thread_shows_up_in_thread_list() {
        let me = current_thread_sys_id();
        let mut ids = [0; 256];
        let n = thread_list(&mut ids);
        assert!(n >= 1);
        assert!(ids[..n.min(ids.len())].contains(&me));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn short_buffer_still_counts_every_thread() {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let parked = std::thread::spawn(move || rx.recv());
        let mut one = [0; 1];
        let total = thread_list(&mut one);
        assert!(total >= 2, "{total}");
        assert_ne!(one[0], 0);
        assert!(thread_list(&mut []) >= 2);
        tx.send(()).unwrap();
        parked.join().unwrap().unwrap();
    }

    #[test]
    fn named_threads_report_their_name() {
        let name = std::thread::Builder::new()
            .name("kdiag-named".into())
            .spawn(|| current_thread_name())
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(name, "kdiag-named");
    }

    #[test]
    fn stack_bounds_contain_a_local() {
        let local = 0u8;
        let (lo, hi) = stack_bounds().unwrap();
        let addr = &local as *const u8 as usize;
        assert!(lo <= addr && addr < hi);
    }

    #[test]
    fn parse_decimal_rejects_names() {
        assert_eq!(parse_decimal(b"1234"), Some(1234));
        assert_eq!(parse_decimal(b"self"), None);
        assert_eq!(parse_decimal(b""), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn process_list_contains_us() {
        let me = std::process::id() as u64;
        let mut found = false;
        assert!(for_each_process(|pid, _| found |= pid == me));
        assert!(found);
    }
}
