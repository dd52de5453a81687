//! Backtraces, symbol resolution and the module list.
//!
//! There are two resolution paths. With memory allocation allowed (the
//! default) addresses go through full debug-info symbolication, cached by
//! address. With it disallowed, which is what fault handling does, resolution
//! falls back to `dladdr` plus the module snapshot, both of which only touch
//! fixed-size storage.

use std::{
    ffi::{c_void, CStr},
    fmt::{self, Write},
    mem::MaybeUninit,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
};

use hashbrown::HashMap;

use crate::{
    exception::info::CpuContext,
    os::{
        modules::{self, ModuleInfo, MODULE_NAME_LEN, MODULE_PATH_LEN},
        thread::{self, ThreadSysId},
    },
    util::{fixed::FixedStr, lock},
};

/// Frames captured per backtrace
pub const MAX_BACKTRACE_FRAMES: usize = 64;

/// Entries in the module snapshot
pub const MAX_MODULES: usize = 256;

pub const FUNCTION_NAME_LEN: usize = 128;

/// Threads covered by [`SymbolLookup::report_thread_callstacks`]
pub const MAX_THREADS: usize = 64;

const MAX_SOURCE_DIRS: usize = 8;

/// Cached resolutions before the cache is thrown away and started again
const CACHE_LIMIT: usize = 4096;

/// What is known about one code address
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SymbolInfo {
    pub address: usize,
    /// Size of the function, when known
    pub size: usize,
    pub module_name: FixedStr<MODULE_NAME_LEN>,
    pub module_base: usize,
    pub file_path: FixedStr<MODULE_PATH_LEN>,
    pub file_line_number: u32,
    pub function: FixedStr<FUNCTION_NAME_LEN>,
    /// `address` minus the start of `function`
    pub function_offset: usize,
}

impl SymbolInfo {
    pub const EMPTY: SymbolInfo = SymbolInfo {
        address: 0,
        size: 0,
        module_name: FixedStr::new(),
        module_base: 0,
        file_path: FixedStr::new(),
        file_line_number: 0,
        function: FixedStr::new(),
        function_offset: 0,
    };

    /// Did resolution find anything beyond the address?
    pub fn is_resolved(&self) -> bool {
        !self.function.is_empty() || !self.module_name.is_empty()
    }
}

impl Default for SymbolInfo {
    fn default() -> Self {
        Self::EMPTY
    }
}

struct ModuleSnapshot {
    modules: [ModuleInfo; MAX_MODULES],
    count: usize,
    fresh: bool,
}

impl ModuleSnapshot {
    fn refresh(&mut self) {
        self.count = modules::enumerate(&mut self.modules);
        self.fresh = true;
    }

    fn find(&self, addr: usize) -> Option<&ModuleInfo> {
        self.modules[..self.count].iter().find(|m| m.contains(addr))
    }
}

struct SourceDirs {
    dirs: [FixedStr<MODULE_PATH_LEN>; MAX_SOURCE_DIRS],
    count: usize,
}

static INIT_COUNT: AtomicUsize = AtomicUsize::new(0);
static ALLOW_ALLOC: AtomicBool = AtomicBool::new(true);
static MODULES: Mutex<ModuleSnapshot> = Mutex::new(ModuleSnapshot {
    modules: [ModuleInfo::EMPTY; MAX_MODULES],
    count: 0,
    fresh: false,
});
static CACHE: Mutex<Option<HashMap<usize, SymbolInfo>>> = Mutex::new(None);
static SOURCE_DIRS: Mutex<SourceDirs> = Mutex::new(SourceDirs {
    dirs: [FixedStr::new(); MAX_SOURCE_DIRS],
    count: 0,
});

/// Process-wide symbol services. All state is shared, so this is a namespace
/// rather than something to construct.
pub struct SymbolLookup;

impl SymbolLookup {
    /// Prepare for symbol lookups. Repeated calls only count: resources are
    /// set up by the first and released by the matching last
    /// [`SymbolLookup::shutdown`].
    pub fn initialize() -> bool {
        if INIT_COUNT.fetch_add(1, Ordering::AcqRel) == 0 {
            lock(&MODULES).refresh();
            log::debug!(target: "kdiag::symbol", "symbol lookup initialized");
        }
        true
    }

    pub fn is_initialized() -> bool {
        INIT_COUNT.load(Ordering::Acquire) > 0
    }

    pub fn shutdown() {
        let prev = INIT_COUNT
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        if prev == 1 {
            *lock(&CACHE) = None;
            let mut snapshot = lock(&MODULES);
            snapshot.count = 0;
            snapshot.fresh = false;
            log::debug!(target: "kdiag::symbol", "symbol lookup shut down");
        }
    }

    /// Re-read the module list, and forget cached resolutions (a module may
    /// have been unloaded and something else mapped at its addresses).
    pub fn refresh() {
        lock(&MODULES).refresh();
        if let Some(cache) = lock(&CACHE).as_mut() {
            cache.clear();
        }
    }

    /// Allow or forbid lookups to allocate. Fault handling turns this off for
    /// its duration.
    pub fn enable_memory_allocation(enabled: bool) {
        ALLOW_ALLOC.store(enabled, Ordering::Release);
    }

    pub fn memory_allocation_enabled() -> bool {
        ALLOW_ALLOC.load(Ordering::Acquire)
    }

    /// Fill `out` with return addresses of the current call stack, innermost
    /// first, leaving out `skip` frames above our caller. Returns how many
    /// were written.
    ///
    /// With a `context` (the registers of an interrupted frame, e.g. from a
    /// signal) the trace starts at the interrupted instruction instead. With a
    /// `thread` other than the calling one nothing can be walked and this
    /// returns 0. Never allocates.
    #[inline(never)]
    pub fn get_backtrace(
        out: &mut [usize],
        skip: usize,
        context: Option<&CpuContext>,
        thread: Option<ThreadSysId>,
    ) -> usize {
        if out.is_empty() {
            return 0;
        }
        if thread.is_some_and(|t| t != thread::current_thread_sys_id()) {
            return 0;
        }
        let mut raw = [0usize; MAX_BACKTRACE_FRAMES + 32];
        let mut len = 0;
        let mut start = None;
        let this_fn = Self::get_backtrace as usize;
        // SAFETY: the callback neither allocates nor panics, and only touches
        // locals. Unsynchronized tracing is what lets this run inside the
        // allocator and inside a signal handler.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                if start.is_none() && frame.symbol_address() as usize == this_fn {
                    start = Some(len + 1);
                }
                raw[len] = frame.ip() as usize;
                len += 1;
                len < raw.len()
            })
        };
        let raw = &raw[..len];

        let from = match context.and_then(CpuContext::instruction_pointer) {
            Some(ip) => match raw.iter().position(|&a| a == ip) {
                Some(i) => i,
                None => {
                    // the unwinder could not get through the signal frame;
                    // report the faulting instruction then what we have
                    out[0] = ip;
                    let from = start.unwrap_or(0).saturating_add(skip).min(raw.len());
                    let n = (raw.len() - from).min(out.len() - 1);
                    out[1..=n].copy_from_slice(&raw[from..from + n]);
                    return n + 1;
                }
            },
            None => start.unwrap_or(0).saturating_add(skip).min(raw.len()),
        };
        let n = (raw.len() - from).min(out.len());
        out[..n].copy_from_slice(&raw[from..from + n]);
        n
    }

    /// [`SymbolLookup::get_backtrace`] for `thread`. Only the calling thread
    /// can be walked.
    pub fn get_backtrace_from_thread_sys_id(
        out: &mut [usize],
        skip: usize,
        thread: ThreadSysId,
    ) -> usize {
        Self::get_backtrace(out, skip + 1, None, Some(thread))
    }

    /// Copy the current module list into `out`. Returns the number of modules
    /// the process has, which may exceed `out.len()`.
    pub fn get_module_info_array(out: &mut [ModuleInfo]) -> usize {
        let mut snapshot = lock(&MODULES);
        snapshot.refresh();
        let n = snapshot.count.min(out.len());
        out[..n].copy_from_slice(&snapshot.modules[..n]);
        snapshot.count
    }

    /// The ids of this process's threads. Returns the total count, which may
    /// exceed `out.len()`; only the first `out.len()` ids are written.
    pub fn get_thread_list(out: &mut [ThreadSysId]) -> usize {
        thread::thread_list(out)
    }

    /// The module containing `addr`, from the last snapshot. The snapshot is
    /// taken on first use, and retaken once on a miss in case a module was
    /// loaded since.
    pub fn get_module_info_for_address(addr: usize) -> Option<ModuleInfo> {
        let mut snapshot = Self::modules()?;
        if !snapshot.fresh {
            snapshot.refresh();
        }
        if let Some(m) = snapshot.find(addr) {
            return Some(*m);
        }
        snapshot.refresh();
        snapshot.find(addr).copied()
    }

    /// Resolve one address. Fields that can't be found are left empty.
    pub fn lookup_symbol(addr: usize) -> SymbolInfo {
        let mut info = SymbolInfo::EMPTY;
        info.address = addr;
        if let Some(module) = Self::get_module_info_for_address(addr) {
            info.module_name = module.name;
            info.module_base = module.base_address;
        }
        if Self::memory_allocation_enabled() {
            if let Some(cached) = lock(&CACHE).as_ref().and_then(|c| c.get(&addr)) {
                return *cached;
            }
            resolve_debug_info(addr, &mut info);
            if info.function.is_empty() {
                resolve_dladdr(addr, &mut info);
            }
            let mut cache = lock(&CACHE);
            let cache = cache.get_or_insert_with(HashMap::new);
            if cache.len() >= CACHE_LIMIT {
                cache.clear();
            }
            cache.insert(addr, info);
        } else {
            resolve_dladdr(addr, &mut info);
        }
        info
    }

    /// Resolve every address in `addrs` into the matching slot of `out`.
    /// Returns the number resolved (the shorter of the two).
    pub fn lookup_symbols(addrs: &[usize], out: &mut [SymbolInfo]) -> usize {
        for (addr, info) in addrs.iter().zip(out.iter_mut()) {
            *info = Self::lookup_symbol(*addr);
        }
        addrs.len().min(out.len())
    }

    /// Add a directory relative source paths from debug info are looked up
    /// in. Returns `false` if there is no room left.
    pub fn add_source_code_directory(dir: &str) -> bool {
        let mut dirs = lock(&SOURCE_DIRS);
        if dirs.count == MAX_SOURCE_DIRS || dir.len() > MODULE_PATH_LEN {
            return false;
        }
        let i = dirs.count;
        dirs.dirs[i] = FixedStr::from_str_truncate(dir);
        dirs.count += 1;
        true
    }

    /// Write a header and the symbolized backtrace of `thread` (0 for the
    /// calling thread) to `out`. Returns whether a backtrace could be read.
    pub fn report_thread_callstack(
        out: &mut dyn fmt::Write,
        skip: usize,
        thread: ThreadSysId,
    ) -> Result<bool, fmt::Error> {
        let current = thread::current_thread_sys_id();
        let thread = if thread == 0 { current } else { thread };
        let mut frames = [0usize; MAX_BACKTRACE_FRAMES];
        let count = Self::get_backtrace(&mut frames, skip + 1, None, Some(thread));

        let name = thread::thread_name(thread);
        if !name.is_empty() {
            write!(out, "Thread \"{name}\" id: {thread}")?;
        } else {
            write!(out, "Thread id: {thread}")?;
        }
        match thread::stack_bounds().filter(|_| thread == current) {
            Some((base, limit)) => writeln!(out, ", stack base: {base:#x}, stack limit: {limit:#x}")?,
            None => writeln!(out)?,
        }

        if count == 0 {
            writeln!(out, "<Unable to read backtrace>")?;
            return Ok(false);
        }
        for (i, &addr) in frames[..count].iter().enumerate() {
            let sym = Self::lookup_symbol(addr);
            write_frame_line(out, i, &sym)?;
        }
        Ok(true)
    }

    /// [`SymbolLookup::report_thread_callstack`] for every thread, separated by
    /// blank lines. Returns whether there were any threads.
    pub fn report_thread_callstacks(out: &mut dyn fmt::Write, skip: usize) -> Result<bool, fmt::Error> {
        let mut threads = [0; MAX_THREADS];
        let count = Self::get_thread_list(&mut threads).min(MAX_THREADS);
        for (i, &tid) in threads[..count].iter().enumerate() {
            if i > 0 {
                writeln!(out)?;
            }
            Self::report_thread_callstack(out, skip + 1, tid)?;
        }
        Ok(count > 0)
    }

    /// One line per loaded module
    pub fn report_module_information(out: &mut dyn fmt::Write) -> fmt::Result {
        let mut result = Ok(());
        let listed = Self::for_each_module(|m| {
            if result.is_ok() {
                result = writeln!(
                    out,
                    "Base: {:#x} Size: {:#x} Name: '{}' Path: '{}'",
                    m.base_address, m.size, m.name, m.file_path
                );
            }
        });
        if !listed {
            return writeln!(out, "<Module list unavailable>");
        }
        result
    }

    /// Call `f` for every module in a freshly taken snapshot, without copying
    /// the snapshot out. Returns `false` if the snapshot was busy (only
    /// possible with memory allocation disabled).
    pub fn for_each_module<F: FnMut(&ModuleInfo)>(mut f: F) -> bool {
        let Some(mut snapshot) = Self::modules() else {
            return false;
        };
        snapshot.refresh();
        snapshot.modules[..snapshot.count].iter().for_each(&mut f);
        true
    }

    /// The module snapshot. In no-allocation mode we are likely inside a
    /// fault handler that interrupted a holder of the lock, so don't wait.
    fn modules() -> Option<MutexGuard<'static, ModuleSnapshot>> {
        if Self::memory_allocation_enabled() {
            return Some(lock(&MODULES));
        }
        match MODULES.try_lock() {
            Ok(guard) => Some(guard),
            Err(std::sync::TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(std::sync::TryLockError::WouldBlock) => None,
        }
    }
}

/// `"{i} {module} {addr} {function}+{offset} {file}:{line}"`
pub(crate) fn write_frame_line(out: &mut dyn fmt::Write, i: usize, sym: &SymbolInfo) -> fmt::Result {
    let module = match sym.module_name.is_empty() {
        true => "(unknown module)",
        false => sym.module_name.as_str(),
    };
    let function = match sym.function.is_empty() {
        true => "(unknown function)",
        false => sym.function.as_str(),
    };
    write!(
        out,
        "{i:<2} {module:<24} {:#018x} {function}+{}",
        sym.address, sym.function_offset
    )?;
    if sym.file_path.is_empty() {
        writeln!(out)
    } else {
        writeln!(out, " {}:{}", sym.file_path, sym.file_line_number)
    }
}

/// Function, file and line from debug info. Allocates.
fn resolve_debug_info(addr: usize, info: &mut SymbolInfo) {
    let mut done = false;
    backtrace::resolve(addr as *mut c_void, |sym| {
        // inlined frames come innermost first; keep the innermost
        if done {
            return;
        }
        done = true;
        if let Some(name) = sym.name() {
            let _ = fmt::write(&mut info.function, format_args!("{name:#}"));
        }
        if let Some(start) = sym.addr() {
            info.function_offset = addr.wrapping_sub(start as usize);
        }
        if let Some(file) = sym.filename() {
            set_file_path(&mut info.file_path, file);
        }
        info.file_line_number = sym.lineno().unwrap_or(0);
    });
}

/// Debug info paths are often relative to the build directory. Prefer a
/// registered source directory that actually has the file.
fn set_file_path(out: &mut FixedStr<MODULE_PATH_LEN>, file: &Path) {
    let Some(file_str) = file.to_str() else {
        return;
    };
    if file.is_relative() {
        let dirs = lock(&SOURCE_DIRS);
        for dir in &dirs.dirs[..dirs.count] {
            let joined = Path::new(dir.as_str()).join(file);
            if joined.exists() {
                if let Some(s) = joined.to_str() {
                    *out = FixedStr::from_str_truncate(s);
                    return;
                }
            }
        }
    }
    *out = FixedStr::from_str_truncate(file_str);
}

/// The nearest exported symbol, from the dynamic loader. Never allocates.
fn resolve_dladdr(addr: usize, info: &mut SymbolInfo) {
    let mut dl = MaybeUninit::<libc::Dl_info>::zeroed();
    // SAFETY: `dladdr` only writes `dl`, and tolerates any address
    if unsafe { libc::dladdr(addr as *const c_void, dl.as_mut_ptr()) } == 0 {
        return;
    }
    // SAFETY: zeroed and filled in by a successful `dladdr`
    let dl = unsafe { dl.assume_init() };
    if info.module_name.is_empty() && !dl.dli_fname.is_null() {
        // SAFETY: `dladdr` hands out NUL-terminated strings owned by the loader
        let path = unsafe { CStr::from_ptr(dl.dli_fname) }.to_bytes();
        let name = path.rsplit(|&b| b == b'/').next().unwrap_or(path);
        info.module_name = FixedStr::from_bytes_lossy(name);
        info.module_base = dl.dli_fbase as usize;
    }
    if !dl.dli_sname.is_null() {
        // SAFETY: as above
        let raw = unsafe { CStr::from_ptr(dl.dli_sname) }.to_bytes();
        info.function.clear();
        let _ = write!(info.function, "{:#}", backtrace::SymbolName::new(raw));
        info.function_offset = addr.wrapping_sub(dl.dli_saddr as usize);
    } else if info.module_base != 0 {
        info.function_offset = addr - info.module_base;
    }
}
