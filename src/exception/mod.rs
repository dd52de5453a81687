//! Process-wide crash handling.
//!
//! An enabled [`ExceptionHandler`] takes over the synchronous fault signals.
//! When one arrives it snapshots the faulting thread into an
//! [`ExceptionInfo`], writes a crash snapshot and a text report, lets an
//! [`ExceptionListener`] look at it, then does what its
//! [`ExceptionResponse`] says. Everything on that path avoids the allocator:
//! the snapshot lives in pages mapped when the handler was enabled, and
//! output goes straight to file descriptors.
//!
//! Only one fault is handled at a time across the whole process. A fault that
//! arrives while another is being handled (including one raised by the
//! handler itself) prints a line to stderr and exits.

pub mod info;
pub mod report;

use std::{
    fmt::Write as _,
    path::PathBuf,
    ptr::{self, NonNull},
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU8, AtomicUsize, Ordering},
        Arc, Mutex, TryLockError,
    },
};

use libc::{c_int, c_void, siginfo_t};
use serde::{Deserialize, Serialize};

use self::{
    info::{ExceptionInfo, PlatformRecord},
    report::{ReportOptions, MAX_CODE_BASE_PATHS, PATH_LEN},
};
use crate::{
    error::{Error, Result},
    os::{
        mem as os_mem, signal,
        thread::{self, ThreadSysId},
    },
    raw_eprintln,
    symbol::SymbolLookup,
    timer,
    util::{fixed::FixedStr, lock, print::FdWriter},
};

pub use self::info::DESCRIPTION_LEN;

pub const APP_DESCRIPTION_LEN: usize = 1024;

/// Exit status used when the handler terminates the process
pub const DEFAULT_TERMINATE_RETURN_VALUE: i32 = 1;

/// What to do once a fault has been reported
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionResponse {
    /// Return from the handler and retry the faulting instruction. Only
    /// useful if a listener repaired whatever caused the fault.
    Continue,
    /// Hand the fault to whatever handler was installed before us, as if we
    /// had never seen it
    HandleNormally,
    /// Exit with the terminate return value
    Terminate,
    /// Restore the previous handler and raise the signal again
    Rethrow,
    /// Terminate
    #[default]
    Default,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HandlerState {
    Disabled,
    Enabled,
    /// A fault is being reported right now
    Handling,
    /// The handler is ending the process
    Terminated,
}

impl HandlerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => HandlerState::Enabled,
            2 => HandlerState::Handling,
            3 => HandlerState::Terminated,
            _ => HandlerState::Disabled,
        }
    }
}

/// Told about every handled fault after the report is written, while the
/// report file is still open (see [`ExceptionHandler::write_report_line`]).
///
/// This runs inside a signal handler on the faulting thread: it must not
/// allocate, take locks the faulting code might hold, or reconfigure the
/// handler.
pub trait ExceptionListener: Send + Sync {
    fn handle_exception(
        &self,
        user_value: usize,
        handler: &ExceptionHandler,
        info: &ExceptionInfo,
        report_path: &str,
    );
}

/// Faults we can raise on purpose, for testing the handler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionKind {
    AccessViolation,
    BusError,
    DivideByZero,
    IllegalInstruction,
    Trap,
    Abort,
}

struct Settings {
    /// Templates, possibly containing the timestamp token. Empty means "don't
    /// write one".
    report_path: FixedStr<PATH_LEN>,
    minidump_path: FixedStr<PATH_LEN>,
    app_description: FixedStr<APP_DESCRIPTION_LEN>,
    code_base_paths: [FixedStr<PATH_LEN>; MAX_CODE_BASE_PATHS],
    code_base_count: usize,
    privacy: bool,
    response: ExceptionResponse,
    listener: Option<Arc<dyn ExceptionListener>>,
    user_value: usize,
    terminate_return_value: i32,
}

/// The process-wide crash handler. Configure it, then [`enable`] it; only one
/// handler can be enabled at a time.
///
/// [`enable`]: ExceptionHandler::enable
pub struct ExceptionHandler {
    settings: Mutex<Settings>,
    state: AtomicU8,
    pause_count: AtomicUsize,
    occurred: AtomicBool,
    /// The report being written, or -1
    report_fd: AtomicI32,
}

/// The enabled handler, leaked from an `Arc` by `enable(true)`
static ACTIVE: AtomicPtr<ExceptionHandler> = AtomicPtr::new(ptr::null_mut());

/// Set while any thread is handling a fault
static HANDLING: AtomicBool = AtomicBool::new(false);

/// Storage for the snapshot of the fault being handled. Mapped once, by the
/// first `enable`, and kept for the life of the process.
static SCRATCH: AtomicPtr<ExceptionInfo> = AtomicPtr::new(ptr::null_mut());

fn scratch() -> Result<NonNull<ExceptionInfo>> {
    if let Some(p) = NonNull::new(SCRATCH.load(Ordering::Acquire)) {
        return Ok(p);
    }
    let mapped = os_mem::map_rw(std::mem::size_of::<ExceptionInfo>())?.cast::<ExceptionInfo>();
    match SCRATCH.compare_exchange(ptr::null_mut(), mapped.as_ptr(), Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => Ok(mapped),
        Err(winner) => {
            // SAFETY: ours, never published
            unsafe {
                os_mem::release(
                    mapped.cast(),
                    crate::util::num::round_up(std::mem::size_of::<ExceptionInfo>(), os_mem::page_size()),
                )
            };
            // SAFETY: a non-null value stored by the winner
            Ok(unsafe { NonNull::new_unchecked(winner) })
        }
    }
}

impl ExceptionHandler {
    /// A disabled handler with privacy on, no report paths, and the default
    /// response
    pub fn new() -> Self {
        Self {
            settings: Mutex::new(Settings {
                report_path: FixedStr::new(),
                minidump_path: FixedStr::new(),
                app_description: FixedStr::new(),
                code_base_paths: [FixedStr::new(); MAX_CODE_BASE_PATHS],
                code_base_count: 0,
                privacy: true,
                response: ExceptionResponse::Default,
                listener: None,
                user_value: 0,
                terminate_return_value: DEFAULT_TERMINATE_RETURN_VALUE,
            }),
            state: AtomicU8::new(HandlerState::Disabled as u8),
            pause_count: AtomicUsize::new(0),
            occurred: AtomicBool::new(false),
            report_fd: AtomicI32::new(-1),
        }
    }

    pub fn state(&self) -> HandlerState {
        HandlerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: HandlerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.state() != HandlerState::Disabled
    }

    /// Has this handler handled a fault?
    pub fn exception_occurred(&self) -> bool {
        self.occurred.load(Ordering::Acquire)
    }

    /// Install (`true`) or remove (`false`) this handler process-wide.
    /// Removing it puts back whatever signal handlers were there before.
    ///
    /// Not thread-safe with itself: enable and disable at well-defined
    /// points such as startup and shutdown.
    pub fn enable(self: &Arc<Self>, enabled: bool) -> Result<()> {
        if enabled {
            self.install()
        } else {
            self.uninstall()
        }
    }

    fn install(self: &Arc<Self>) -> Result<()> {
        if self.is_enabled() || !ACTIVE.load(Ordering::Acquire).is_null() {
            return Err(Error::AlreadyEnabled);
        }
        scratch()?;
        if let Err(e) = signal::ensure_alt_stack() {
            log::warn!("no alternate signal stack for this thread: {e}");
        }
        if let Err(e) = signal::reserve_emergency_stack() {
            log::warn!("no emergency stack for fault handling: {e}");
        }
        let raw = Arc::into_raw(Arc::clone(self)) as *mut ExceptionHandler;
        ACTIVE.store(raw, Ordering::Release);
        // SAFETY: install/uninstall are not raced (see `enable`)
        if let Err(e) = unsafe { signal::install(on_signal) } {
            ACTIVE.store(ptr::null_mut(), Ordering::Release);
            // SAFETY: from `into_raw` above, never published to a handler
            drop(unsafe { Arc::from_raw(raw) });
            return Err(e);
        }
        self.set_state(HandlerState::Enabled);
        log::info!("exception handler enabled");
        Ok(())
    }

    fn uninstall(self: &Arc<Self>) -> Result<()> {
        let this = Arc::as_ptr(self) as *mut ExceptionHandler;
        if ACTIVE.load(Ordering::Acquire) != this {
            return Err(Error::NotEnabled);
        }
        // SAFETY: not raced (see `enable`)
        unsafe { signal::restore() };
        ACTIVE.store(ptr::null_mut(), Ordering::Release);
        // SAFETY: the reference leaked by `install`
        drop(unsafe { Arc::from_raw(this) });
        self.set_state(HandlerState::Disabled);
        log::info!("exception handler disabled");
        Ok(())
    }

    /// While paused, faults go to the previously installed handler untouched.
    /// Pauses nest. Returns the new pause count.
    pub fn pause_handling(&self, pause: bool) -> usize {
        if pause {
            self.pause_count.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            let prev = self
                .pause_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .unwrap_or(0);
            prev.saturating_sub(1)
        }
    }

    pub fn set_exception_listener(&self, listener: Option<Arc<dyn ExceptionListener>>, user_value: usize) {
        let mut s = lock(&self.settings);
        s.listener = listener;
        s.user_value = user_value;
    }

    pub fn set_exception_response(&self, response: ExceptionResponse) {
        lock(&self.settings).response = response;
    }

    pub fn exception_response(&self) -> ExceptionResponse {
        lock(&self.settings).response
    }

    /// Exit status for [`ExceptionResponse::Terminate`] and
    /// [`ExceptionResponse::Default`]
    pub fn set_terminate_return_value(&self, code: i32) {
        lock(&self.settings).terminate_return_value = code;
    }

    /// Privacy on (the default) keeps host and user names and the process
    /// list out of reports.
    pub fn enable_report_privacy(&self, enabled: bool) {
        lock(&self.settings).privacy = enabled;
    }

    pub fn report_privacy(&self) -> bool {
        lock(&self.settings).privacy
    }

    /// Free text copied into every report. Longer text is cut off.
    pub fn set_app_description(&self, text: &str) {
        lock(&self.settings).app_description = FixedStr::from_str_truncate(text);
    }

    /// Source roots listed in reports, so that paths in them can be mapped
    /// back to a checkout. At most [`MAX_CODE_BASE_PATHS`].
    pub fn set_code_base_directory_paths(&self, paths: &[&str]) -> Result<()> {
        if paths.len() > MAX_CODE_BASE_PATHS {
            return Err(Error::TooManyPaths {
                max: MAX_CODE_BASE_PATHS,
            });
        }
        let mut stored = [FixedStr::new(); MAX_CODE_BASE_PATHS];
        for (slot, path) in stored.iter_mut().zip(paths) {
            if path.len() >= PATH_LEN {
                return Err(Error::PathTooLong { max: PATH_LEN - 1 });
            }
            *slot = FixedStr::from_str_truncate(path);
        }
        let mut s = lock(&self.settings);
        s.code_base_paths = stored;
        s.code_base_count = paths.len();
        Ok(())
    }

    /// Where to write the text report and the crash snapshot. `None` turns
    /// one off; [`report::DEFAULT_PATH`] picks a file in
    /// [`report::crash_dump_directory`]. Every `%s` is replaced with the time
    /// of the fault.
    pub fn set_exception_paths(&self, report_path: Option<&str>, minidump_path: Option<&str>) -> Result<()> {
        let report = match report_path {
            Some(p) => report::resolve_path_setting(p, report::DEFAULT_REPORT_FORMAT)?,
            None => FixedStr::new(),
        };
        let minidump = match minidump_path {
            Some(p) => report::resolve_path_setting(p, report::DEFAULT_MINIDUMP_FORMAT)?,
            None => FixedStr::new(),
        };
        let mut s = lock(&self.settings);
        s.report_path = report;
        s.minidump_path = minidump;
        Ok(())
    }

    /// Put reports in `<crash dir>/<organization>/<application>/`, named by
    /// the given formats (or the default ones). The directory is created.
    pub fn set_paths_from_names(
        &self,
        organization: &str,
        application: &str,
        report_format: Option<&str>,
        minidump_format: Option<&str>,
    ) -> Result<()> {
        let dir = paths_dir(organization, application)?;
        let report = report::path_template(&dir.join(report_format.unwrap_or(report::DEFAULT_REPORT_FORMAT)))?;
        let minidump =
            report::path_template(&dir.join(minidump_format.unwrap_or(report::DEFAULT_MINIDUMP_FORMAT)))?;
        let mut s = lock(&self.settings);
        s.report_path = report;
        s.minidump_path = minidump;
        Ok(())
    }

    /// The configured report path template (empty when reports are off)
    pub fn report_path(&self) -> FixedStr<PATH_LEN> {
        lock(&self.settings).report_path
    }

    pub fn minidump_path(&self) -> FixedStr<PATH_LEN> {
        lock(&self.settings).minidump_path
    }

    /// Append to the report being written. Only does anything while a fault
    /// is being handled, i.e. from an [`ExceptionListener`].
    pub fn write_report_line(&self, line: &str) -> bool {
        let fd = self.report_fd.load(Ordering::Acquire);
        if fd < 0 {
            return false;
        }
        let mut w = FdWriter::new(fd);
        w.write_bytes(line.as_bytes());
        !w.failed()
    }

    /// Give the calling thread an alternate signal stack big enough for
    /// fault handling, so that stack overflows on it can be reported. The
    /// thread that calls [`enable`](ExceptionHandler::enable) and workers
    /// from [`System::spawn_thread`](crate::System::spawn_thread) get one
    /// automatically. On linux-gnu, faults on other threads are handled on a
    /// shared emergency stack instead.
    pub fn prepare_thread() -> Result<()> {
        signal::ensure_alt_stack()
    }

    pub fn is_debugger_present() -> bool {
        thread::is_debugger_present()
    }

    pub fn current_thread_sys_id() -> ThreadSysId {
        thread::current_thread_sys_id()
    }

    /// `(low, high)` addresses of the calling thread's stack
    pub fn thread_stack_bounds() -> Option<(usize, usize)> {
        thread::stack_bounds()
    }

    /// Text suitable for a "the application crashed" dialog: a short
    /// explanation followed by the report itself.
    pub fn exception_ui_text(report_path: &str) -> Option<String> {
        let report = std::fs::read_to_string(report_path).ok()?;
        let mut text = String::with_capacity(report.len() + 256);
        let _ = writeln!(
            text,
            "The application has encountered a fatal error and must close.\n\
             A report has been saved to:\n{report_path}\n"
        );
        text.push_str(&report);
        Some(text)
    }

    /// Write a report describing a hung thread without ending the process.
    /// Returns the report's path.
    pub fn report_deadlock(thread_name: &str, organization: &str, application: &str) -> Result<PathBuf> {
        let handler = ExceptionHandler::new();
        handler.set_paths_from_names(organization, application, None, None)?;

        let mut info = Box::new(ExceptionInfo::new());
        capture_common(&mut info);
        info.backtrace_count = SymbolLookup::get_backtrace(&mut info.backtrace, 0, None, None);
        info.instruction_address = info.backtrace().first().copied().unwrap_or(0);
        let _ = write!(info.description, "Deadlock detected in thread \"{thread_name}\"");
        info.platform = PlatformRecord::Synthetic;

        let settings = lock(&handler.settings);
        let path = handler.write_outputs(&settings, &info);
        drop(settings);
        if path.is_empty() {
            return Err(Error::last_os("open"));
        }
        log::warn!("deadlock report written to {path}");
        Ok(PathBuf::from(path.as_str()))
    }

    /// Raise a fault of the given kind on the calling thread
    pub fn create_exception(kind: ExceptionKind) {
        // SAFETY: each arm deliberately faults or raises; none touches memory
        // we don't own except the reserved-only page, which is the point
        unsafe {
            match kind {
                ExceptionKind::AccessViolation => match os_mem::reserve(os_mem::page_size()) {
                    Ok(page) => ptr::write_volatile(page.as_ptr(), 0),
                    Err(_) => {
                        libc::raise(libc::SIGSEGV);
                    }
                },
                ExceptionKind::BusError => {
                    libc::raise(libc::SIGBUS);
                }
                ExceptionKind::DivideByZero => {
                    libc::raise(libc::SIGFPE);
                }
                ExceptionKind::IllegalInstruction => {
                    libc::raise(libc::SIGILL);
                }
                ExceptionKind::Trap => {
                    libc::raise(libc::SIGTRAP);
                }
                ExceptionKind::Abort => libc::abort(),
            }
        }
    }

    /// Report a fault. Runs in a signal handler with [`HANDLING`] held.
    fn handle_fault(&self, sig: c_int, si: *mut siginfo_t, ctx: *mut c_void) -> ExceptionResponse {
        self.set_state(HandlerState::Handling);
        self.occurred.store(true, Ordering::Release);
        SymbolLookup::enable_memory_allocation(false);

        let settings = match self.settings.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        };
        let (response, exit_code) = settings
            .as_ref()
            .map_or((ExceptionResponse::Default, DEFAULT_TERMINATE_RETURN_VALUE), |s| {
                (s.response, s.terminate_return_value)
            });

        match scratch() {
            Ok(mut scratch) => {
                // SAFETY: only the thread holding HANDLING touches the scratch
                let info = unsafe { scratch.as_mut() };
                // SAFETY: arguments straight from the kernel
                unsafe { capture_signal(info, sig, si, ctx) };
                raw_eprintln!("kdiag: {}", info.description);
                match &settings {
                    Some(s) => {
                        let path = self.write_outputs(s, info);
                        if !path.is_empty() {
                            raw_eprintln!("kdiag: crash report written to {path}");
                        }
                    }
                    None => raw_eprintln!("kdiag: handler busy being configured, no report written"),
                }
            }
            Err(_) => raw_eprintln!("kdiag: {} with no snapshot storage", signal::signal_name(sig)),
        }
        drop(settings);

        SymbolLookup::enable_memory_allocation(true);
        if matches!(response, ExceptionResponse::Terminate | ExceptionResponse::Default) {
            self.set_state(HandlerState::Terminated);
            // SAFETY: async-signal-safe; skips atexit handlers on purpose
            unsafe { libc::_exit(exit_code) };
        }
        self.set_state(HandlerState::Enabled);
        response
    }

    /// Write the crash snapshot and the report for `info`, then run the
    /// listener with the report still open. Returns the report's path, or an
    /// empty string if none was written.
    fn write_outputs(&self, s: &Settings, info: &ExceptionInfo) -> FixedStr<PATH_LEN> {
        let minidump_path = match s.minidump_path.is_empty() {
            true => FixedStr::new(),
            false => report::expand_path(s.minidump_path.as_str(), info.time_secs),
        };
        if !minidump_path.is_empty() {
            if let Some(fd) = report::open_for_write(&minidump_path) {
                let mut w = FdWriter::new(fd);
                report::write_minidump(&mut |b: &[u8]| w.write_bytes(b), info);
                report::close(fd);
            }
        }

        let mut report_path = FixedStr::new();
        if !s.report_path.is_empty() {
            let path = report::expand_path(s.report_path.as_str(), info.time_secs);
            if let Some(fd) = report::open_for_write(&path) {
                report_path = path;
                let opts = ReportOptions {
                    report_path: report_path.as_str(),
                    minidump_path: minidump_path.as_str(),
                    app_description: s.app_description.as_str(),
                    code_base_paths: &s.code_base_paths[..s.code_base_count],
                    privacy: s.privacy,
                };
                let _ = report::write_report(&mut FdWriter::new(fd), info, &opts);
                self.report_fd.store(fd, Ordering::Release);
            }
        }

        if let Some(listener) = &s.listener {
            listener.handle_exception(s.user_value, self, info, report_path.as_str());
        }

        let fd = self.report_fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            report::close(fd);
        }
        report_path
    }
}

impl Default for ExceptionHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn paths_dir(organization: &str, application: &str) -> Result<PathBuf> {
    let mut dir = report::crash_dump_directory();
    for part in [organization, application] {
        if !part.is_empty() {
            dir.push(part);
        }
    }
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Fill in what every snapshot has: time and thread
fn capture_common(info: &mut ExceptionInfo) {
    let (secs, micros) = timer::realtime_now();
    info.time_secs = secs;
    info.time_micros = micros;
    info.thread_sys_id = thread::current_thread_sys_id();
    info.thread_name = thread::current_thread_name();
}

/// Build the snapshot of a signal without allocating
///
/// # Safety
///
/// - `si` and `ctx` must be what the kernel passed to an `SA_SIGINFO` handler
unsafe fn capture_signal(info: &mut ExceptionInfo, sig: c_int, si: *mut siginfo_t, ctx: *mut c_void) {
    *info = ExceptionInfo::new();
    capture_common(info);
    // SAFETY: requirement passed to caller
    let (signo, code, errno) = unsafe { signal::signal_fields(sig, si) };
    info.platform = PlatformRecord::Signal { signo, code, errno };
    // SAFETY: requirement passed to caller
    info.cpu_context = unsafe { signal::cpu_context(ctx) };
    // SAFETY: requirement passed to caller
    info.memory_address = unsafe { signal::fault_address(si) };
    info.instruction_address = info.cpu_context.instruction_pointer().unwrap_or(0);

    let context = info.cpu_context;
    info.backtrace_count = SymbolLookup::get_backtrace(&mut info.backtrace, 0, Some(&context), None);
    if info.instruction_address == 0 {
        info.instruction_address = info.backtrace().first().copied().unwrap_or(0);
    }
    info.symbol = SymbolLookup::lookup_symbol(info.instruction_address);

    let _ = write!(
        info.description,
        "{}: {} at {:#x}",
        signal::signal_name(signo),
        signal::describe(signo, code),
        info.instruction_address
    );
    if matches!(signo, libc::SIGSEGV | libc::SIGBUS) {
        let _ = write!(info.description, " accessing {:#x}", info.memory_address);
    }
}

extern "C" fn on_signal(sig: c_int, si: *mut siginfo_t, ctx: *mut c_void) {
    let active = ACTIVE.load(Ordering::Acquire);
    // SAFETY: ACTIVE holds a strong reference for as long as it is non-null
    let Some(handler) = (unsafe { active.as_ref() }) else {
        // SAFETY: our own handler arguments
        unsafe { signal::forward_to_previous(sig, si, ctx) };
        return;
    };
    if handler.pause_count.load(Ordering::Acquire) > 0 {
        // SAFETY: as above
        unsafe { signal::forward_to_previous(sig, si, ctx) };
        return;
    }
    if HANDLING
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        raw_eprintln!(
            "kdiag: {} while already handling a fault, exiting",
            signal::signal_name(sig)
        );
        // SAFETY: async-signal-safe
        unsafe { libc::_exit(DEFAULT_TERMINATE_RETURN_VALUE) };
    }

    // threads we never prepared are handled on the emergency stack, which
    // their own runtime's alt stack is too small to write a report on
    let mut response = ExceptionResponse::Default;
    {
        let mut run = || response = handler.handle_fault(sig, si, ctx);
        // SAFETY: HANDLING is held, so nobody else is on the emergency stack
        let switched = signal::on_small_alt_stack() && unsafe { signal::run_on_emergency_stack(&mut run) };
        if !switched {
            run();
        }
    }
    HANDLING.store(false, Ordering::Release);

    match response {
        ExceptionResponse::Continue => {}
        ExceptionResponse::HandleNormally => {
            // SAFETY: our own handler arguments
            unsafe { signal::forward_to_previous(sig, si, ctx) };
        }
        ExceptionResponse::Rethrow => {
            signal::restore_one(sig);
            // SAFETY: async-signal-safe; with SA_NODEFER the signal is not
            // blocked, so it is delivered to the restored handler right away
            unsafe { libc::raise(sig) };
        }
        // handle_fault exits for these
        ExceptionResponse::Terminate | ExceptionResponse::Default => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_handler_defaults() {
        let h = ExceptionHandler::new();
        assert_eq!(h.state(), HandlerState::Disabled);
        assert!(h.report_privacy());
        assert_eq!(h.exception_response(), ExceptionResponse::Default);
        assert!(h.report_path().is_empty());
        assert!(!h.write_report_line("nobody is listening"));
    }

    #[test]
    fn pausing_nests() {
        let h = ExceptionHandler::new();
        assert_eq!(h.pause_handling(true), 1);
        assert_eq!(h.pause_handling(true), 2);
        assert_eq!(h.pause_handling(false), 1);
        assert_eq!(h.pause_handling(false), 0);
        assert_eq!(h.pause_handling(false), 0);
    }

    #[test]
    fn code_base_paths_are_bounded() {
        let h = ExceptionHandler::new();
        h.set_code_base_directory_paths(&["/a", "/b"]).unwrap();
        let err = h
            .set_code_base_directory_paths(&["/x"; MAX_CODE_BASE_PATHS + 1])
            .unwrap_err();
        assert!(matches!(err, Error::TooManyPaths { max: MAX_CODE_BASE_PATHS }));
        assert_eq!(
            err.to_string(),
            format!("at most {MAX_CODE_BASE_PATHS} code base paths can be listed")
        );
        h.set_code_base_directory_paths(&["/x"; MAX_CODE_BASE_PATHS]).unwrap();
        let long = "p".repeat(PATH_LEN);
        assert!(matches!(
            h.set_code_base_directory_paths(&[&long]),
            Err(Error::PathTooLong { .. })
        ));
    }

    #[test]
    fn explicit_paths_are_kept_as_templates() {
        let h = ExceptionHandler::new();
        h.set_exception_paths(Some("/tmp/kdiag %s.txt"), None).unwrap();
        assert_eq!(h.report_path(), "/tmp/kdiag %s.txt");
        assert!(h.minidump_path().is_empty());
        h.set_exception_paths(None, None).unwrap();
        assert!(h.report_path().is_empty());
    }

    #[test]
    fn response_names_in_config() {
        let r: ExceptionResponse = serde_json::from_str("\"handle_normally\"").unwrap();
        assert_eq!(r, ExceptionResponse::HandleNormally);
        assert_eq!(serde_json::to_string(&ExceptionResponse::Rethrow).unwrap(), "\"rethrow\"");
    }

    #[test]
    fn disabling_a_handler_that_is_not_enabled_fails() {
        let h = Arc::new(ExceptionHandler::new());
        assert!(matches!(h.enable(false), Err(Error::NotEnabled)));
    }

    #[test]
    fn ui_text_wraps_the_report() {
        let dir = std::env::temp_dir().join(format!("kdiag-ui-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("report.txt");
        std::fs::write(&path, "Exception Info\n").unwrap();
        let text = ExceptionHandler::exception_ui_text(path.to_str().unwrap()).unwrap();
        assert!(text.starts_with("The application has encountered a fatal error"));
        assert!(text.ends_with("Exception Info\n"));
        assert!(ExceptionHandler::exception_ui_text("/nonexistent/kdiag").is_none());
        std::fs::remove_dir_all(dir).unwrap();
    }
}
