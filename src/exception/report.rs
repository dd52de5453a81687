//! What a handled fault leaves behind: a plain-text report and a compact
//! binary crash snapshot, plus the paths they go to.
//!
//! The writers run inside the fault handler, so they only format into
//! `fmt::Write`/byte sinks backed by fixed buffers or raw file descriptors.
//! [`Minidump::parse`] runs later, in a normal context, and allocates freely.

use std::{
    ffi::CStr,
    fmt::{self, Write},
    fs,
    os::fd::RawFd,
    path::{Path, PathBuf},
};

use super::info::{Aarch64Registers, CpuContext, ExceptionInfo, PlatformRecord, X86_64Registers};
use crate::{
    error::{Error, Result},
    os::{
        self,
        modules::MODULE_PATH_LEN,
        signal,
        thread::{self, ThreadSysId},
    },
    symbol::{write_frame_line, SymbolLookup, MAX_THREADS},
    timer::UtcTime,
    util::fixed::FixedStr,
};

/// Longest report or snapshot path, including the expanded timestamp
pub const PATH_LEN: usize = MODULE_PATH_LEN;

pub const MAX_CODE_BASE_PATHS: usize = 6;

/// Replaced by `YYYY-MM-DD_HH-MM-SS` when a path is used
pub const TIMESTAMP_TOKEN: &str = "%s";

/// A path setting meaning "the platform's crash report directory"
pub const DEFAULT_PATH: &str = "default";

pub const DEFAULT_REPORT_FORMAT: &str = "Exception Report (%s).txt";
pub const DEFAULT_MINIDUMP_FORMAT: &str = "Exception Minidump (%s).kdmp";

pub const MINIDUMP_MAGIC: [u8; 4] = *b"KDMP";
pub const MINIDUMP_VERSION: u32 = 1;

/// Where crash reports go when a path is configured as [`DEFAULT_PATH`]:
/// `~/Library/Logs/DiagnosticReports` on Apple platforms,
/// `$XDG_DATA_HOME/crash-reports` (or `~/.local/share/crash-reports`)
/// elsewhere, and the temp directory when there is no home.
pub fn crash_dump_directory() -> PathBuf {
    let home = std::env::var_os("HOME").filter(|h| !h.is_empty()).map(PathBuf::from);
    if cfg!(target_vendor = "apple") {
        if let Some(home) = home {
            return home.join("Library/Logs/DiagnosticReports");
        }
    } else if let Some(data) = std::env::var_os("XDG_DATA_HOME").filter(|d| !d.is_empty()) {
        return PathBuf::from(data).join("crash-reports");
    } else if let Some(home) = home {
        return home.join(".local/share/crash-reports");
    }
    std::env::temp_dir().join("crash-reports")
}

/// Turn a configured path into a template we can store: [`DEFAULT_PATH`]
/// becomes `default_file` inside [`crash_dump_directory`] (which is created),
/// anything else is taken as is.
pub(crate) fn resolve_path_setting(setting: &str, default_file: &str) -> Result<FixedStr<PATH_LEN>> {
    let path = if setting == DEFAULT_PATH {
        let dir = crash_dump_directory();
        fs::create_dir_all(&dir)?;
        dir.join(default_file)
    } else {
        PathBuf::from(setting)
    };
    path_template(&path)
}

pub(crate) fn path_template(path: &Path) -> Result<FixedStr<PATH_LEN>> {
    let s = path.to_str().ok_or(Error::Unsupported("non-UTF-8 report path"))?;
    // the timestamp is longer than its token, and C strings need a NUL
    let expanded = s.len() + s.matches(TIMESTAMP_TOKEN).count() * 17;
    if expanded >= PATH_LEN {
        return Err(Error::PathTooLong { max: PATH_LEN - 1 });
    }
    Ok(FixedStr::from_str_truncate(s))
}

/// Replace every [`TIMESTAMP_TOKEN`] in `template` with the UTC time `secs`.
/// Never allocates.
pub fn expand_path(template: &str, secs: i64) -> FixedStr<PATH_LEN> {
    let mut stamp = FixedStr::<20>::new();
    let _ = UtcTime::from_unix(secs).write_file_stamp(&mut stamp);
    let mut out = FixedStr::new();
    let mut parts = template.split(TIMESTAMP_TOKEN);
    if let Some(first) = parts.next() {
        out.push_str(first);
    }
    for part in parts {
        out.push_str(stamp.as_str());
        out.push_str(part);
    }
    out
}

/// Open (create or truncate) a report file without going near the allocator
pub(crate) fn open_for_write(path: &FixedStr<PATH_LEN>) -> Option<RawFd> {
    let mut buf = [0u8; PATH_LEN];
    let cpath = path.to_cstr_buf(&mut buf)?;
    // SAFETY: `cpath` is NUL-terminated; `open` is async-signal-safe
    let fd = unsafe {
        libc::open(
            cpath.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
            0o644 as libc::c_uint,
        )
    };
    (fd >= 0).then_some(fd)
}

pub(crate) fn close(fd: RawFd) {
    // SAFETY: we opened `fd` and nobody else holds it
    unsafe { libc::close(fd) };
}

/// Settings a report is written with
pub struct ReportOptions<'a> {
    pub report_path: &'a str,
    pub minidump_path: &'a str,
    pub app_description: &'a str,
    pub code_base_paths: &'a [FixedStr<PATH_LEN>],
    pub privacy: bool,
}

/// Write the full text report for `info`
pub fn write_report(out: &mut dyn fmt::Write, info: &ExceptionInfo, opts: &ReportOptions<'_>) -> fmt::Result {
    write_exception_info(out, info, opts)?;
    write_app_info(out, opts)?;
    write_cpu_context(out, &info.cpu_context)?;

    writeln!(out, "\nBacktrace")?;
    write_backtrace(out, info.backtrace())?;

    writeln!(out, "\nThread callstacks")?;
    write_thread_callstacks(out, info)?;

    writeln!(out, "\nModule list")?;
    SymbolLookup::report_module_information(out)?;

    writeln!(out, "\nSystem Info")?;
    write_system_info(out, opts.privacy)?;

    writeln!(out, "\nProcess list")?;
    if opts.privacy {
        writeln!(out, "Disabled by report privacy settings")?;
    } else {
        let mut result = Ok(());
        let listed = thread::for_each_process(|pid, name| {
            if result.is_ok() {
                result = writeln!(out, "{pid:<8} {name}");
            }
        });
        result?;
        if !listed {
            writeln!(out, "Unable to read process list")?;
        }
    }
    Ok(())
}

fn write_exception_info(out: &mut dyn fmt::Write, info: &ExceptionInfo, opts: &ReportOptions<'_>) -> fmt::Result {
    writeln!(out, "Exception Info")?;
    if !opts.report_path.is_empty() {
        writeln!(out, "Exception report file: {}", opts.report_path)?;
    }
    if !opts.minidump_path.is_empty() {
        writeln!(out, "Exception minidump file: {}", opts.minidump_path)?;
    }
    writeln!(
        out,
        "Time (UTC): {}.{:06}",
        UtcTime::from_unix(info.time_secs),
        info.time_micros
    )?;
    let name = match info.thread_name.is_empty() {
        true => "(not available)",
        false => info.thread_name.as_str(),
    };
    writeln!(out, "Thread name: {name}")?;
    writeln!(out, "Thread sys id: {}", info.thread_sys_id)?;
    writeln!(
        out,
        "Exception instruction address: {:#x} (see callstack below)",
        info.instruction_address
    )?;
    if let Some(sp) = info.cpu_context.stack_pointer() {
        writeln!(out, "Exception stack pointer: {sp:#x}")?;
    }
    if let PlatformRecord::Signal { signo, code, errno } = info.platform {
        writeln!(
            out,
            "Exception memory address: {:#x}\nSignal: {} ({signo}), code: {code}, errno: {errno}",
            info.memory_address,
            signal::signal_name(signo)
        )?;
    }
    writeln!(out, "Exception description: {}", info.description)?;
    let sym = &info.symbol;
    if !sym.file_path.is_empty() {
        writeln!(out, "Exception location: {} ({})", sym.file_path, sym.file_line_number)?;
    } else if !sym.function.is_empty() {
        writeln!(out, "Exception location: {} (+{:#x})", sym.function, sym.function_offset)?;
    }
    Ok(())
}

fn write_app_info(out: &mut dyn fmt::Write, opts: &ReportOptions<'_>) -> fmt::Result {
    writeln!(out, "\nApp Info")?;
    // SAFETY: getpid cannot fail
    let pid = unsafe { libc::getpid() };
    writeln!(out, "Process id: {pid}")?;
    let mut exe = [0u8; PATH_LEN];
    match process_path(&mut exe) {
        Some(path) => writeln!(out, "Process path: {path}")?,
        None => writeln!(out, "Process path: (unknown)")?,
    }
    writeln!(out, "App format: {} bit", usize::BITS)?;
    if !opts.app_description.is_empty() {
        writeln!(out, "App description: {}", opts.app_description)?;
    }
    for path in opts.code_base_paths {
        writeln!(out, "Code base path: {path}")?;
    }
    Ok(())
}

fn process_path(buf: &mut [u8]) -> Option<&str> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        // SAFETY: readlink writes at most `buf.len()` bytes and doesn't
        // terminate them
        let n = unsafe {
            libc::readlink(c"/proc/self/exe".as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len())
        };
        if n <= 0 {
            return None;
        }
        std::str::from_utf8(&buf[..n as usize]).ok()
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = buf;
        None
    }
}

fn write_cpu_context(out: &mut dyn fmt::Write, ctx: &CpuContext) -> fmt::Result {
    writeln!(out, "\nCPU context")?;
    if *ctx == CpuContext::Unavailable {
        return writeln!(out, "(not available)");
    }
    let mut column = 0;
    let mut result = Ok(());
    ctx.for_each_register(|name, value| {
        if result.is_ok() {
            let sep = if column % 4 == 3 { "\n" } else { "  " };
            result = write!(out, "{name:>6}: {value:#018x}{sep}");
            column += 1;
        }
    });
    result?;
    if column % 4 != 0 {
        writeln!(out)?;
    }
    Ok(())
}

fn write_backtrace(out: &mut dyn fmt::Write, frames: &[usize]) -> fmt::Result {
    if frames.is_empty() {
        return writeln!(out, "<Unable to read backtrace>");
    }
    for (i, &addr) in frames.iter().enumerate() {
        write_frame_line(out, i, &SymbolLookup::lookup_symbol(addr))?;
    }
    Ok(())
}

/// The faulting thread gets the backtrace captured at the fault; other
/// threads can't be walked from here, so they get a header only.
fn write_thread_callstacks(out: &mut dyn fmt::Write, info: &ExceptionInfo) -> fmt::Result {
    let mut threads: [ThreadSysId; MAX_THREADS] = [0; MAX_THREADS];
    let count = thread::thread_list(&mut threads).min(MAX_THREADS);
    if count == 0 {
        return writeln!(out, "Unable to read thread list");
    }
    for (i, &tid) in threads[..count].iter().enumerate() {
        if i > 0 {
            writeln!(out)?;
        }
        let name = thread::thread_name(tid);
        let marker = if tid == info.thread_sys_id { " (exception thread)" } else { "" };
        if name.is_empty() {
            writeln!(out, "Thread id: {tid}{marker}")?;
        } else {
            writeln!(out, "Thread \"{name}\" id: {tid}{marker}")?;
        }
        if tid == info.thread_sys_id {
            write_backtrace(out, info.backtrace())?;
        } else {
            writeln!(out, "<Unable to read backtrace>")?;
        }
    }
    Ok(())
}

fn c_field(field: &[libc::c_char]) -> &str {
    // SAFETY: `uname` NUL-terminates every field inside its array
    unsafe { CStr::from_ptr(field.as_ptr()) }.to_str().unwrap_or("?")
}

fn write_system_info(out: &mut dyn fmt::Write, privacy: bool) -> fmt::Result {
    // SAFETY: all-zero is a valid utsname
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    // SAFETY: valid out-pointer
    if unsafe { libc::uname(&mut uts) } == 0 {
        writeln!(
            out,
            "OS name: {}, release: {}, version: {}, machine: {}",
            c_field(&uts.sysname),
            c_field(&uts.release),
            c_field(&uts.version),
            c_field(&uts.machine)
        )?;
        if !privacy {
            writeln!(out, "Host name: {}", c_field(&uts.nodename))?;
        }
    }
    // SAFETY: plain queries
    let (cpus, uid) = unsafe { (libc::sysconf(libc::_SC_NPROCESSORS_ONLN), libc::getuid()) };
    writeln!(out, "Processor count: {cpus}")?;
    writeln!(out, "Page size: {}", os::mem::page_size())?;
    writeln!(
        out,
        "Debugger present: {}",
        if thread::is_debugger_present() { "yes" } else { "no" }
    )?;
    if !privacy {
        let mut buf = [0 as libc::c_char; 1024];
        match user_name(uid, &mut buf) {
            Some(name) => writeln!(out, "User: {name} (uid {uid})")?,
            None => writeln!(out, "User: (uid {uid})")?,
        }
    }
    Ok(())
}

fn user_name(uid: libc::uid_t, buf: &mut [libc::c_char]) -> Option<&str> {
    // SAFETY: all-zero is a valid passwd
    let mut pw: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result = std::ptr::null_mut();
    // SAFETY: getpwuid_r only writes into `pw` and `buf`, and points `result`
    // at `pw` on success
    let rc = unsafe { libc::getpwuid_r(uid, &mut pw, buf.as_mut_ptr(), buf.len(), &mut result) };
    if rc != 0 || result.is_null() || pw.pw_name.is_null() {
        return None;
    }
    // SAFETY: `pw_name` points into `buf`, NUL-terminated
    unsafe { CStr::from_ptr(pw.pw_name) }.to_str().ok()
}

/// Little-endian field writer over any byte sink
struct DumpWriter<'a> {
    sink: &'a mut dyn FnMut(&[u8]),
}

impl DumpWriter<'_> {
    fn bytes(&mut self, b: &[u8]) {
        (self.sink)(b);
    }

    fn u16(&mut self, v: u16) {
        self.bytes(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }

    fn str(&mut self, s: &str) {
        let len = s.len().min(u16::MAX as usize);
        self.u16(len as u16);
        self.bytes(&s.as_bytes()[..len]);
    }
}

const ARCH_NONE: u32 = 0;
const ARCH_X86_64: u32 = 1;
const ARCH_AARCH64: u32 = 2;

/// Write the binary crash snapshot of `info` to `sink`.
///
/// ```plaintext
/// "KDMP" version:u32
/// time_secs:i64 time_micros:u32 signo:i32 code:i32 errno:i32
/// thread_sys_id:u64 instruction_address:u64 memory_address:u64
/// arch:u32 register_count:u32 registers:[u64]
/// frame_count:u32 frames:[u64]
/// description:str thread_name:str
/// (1:u8 base:u64 size:u64 name:str path:str)* 0:u8
/// ```
///
/// `str` is a `u16` byte length then UTF-8 bytes; everything is little
/// endian. A signo of zero marks a synthetic (non-signal) report.
pub fn write_minidump(sink: &mut dyn FnMut(&[u8]), info: &ExceptionInfo) {
    let mut w = DumpWriter { sink };
    w.bytes(&MINIDUMP_MAGIC);
    w.u32(MINIDUMP_VERSION);
    w.u64(info.time_secs as u64);
    w.u32(info.time_micros);
    let (signo, code, errno) = match info.platform {
        PlatformRecord::Signal { signo, code, errno } => (signo, code, errno),
        PlatformRecord::Synthetic => (0, 0, 0),
    };
    w.u32(signo as u32);
    w.u32(code as u32);
    w.u32(errno as u32);
    w.u64(info.thread_sys_id);
    w.u64(info.instruction_address as u64);
    w.u64(info.memory_address as u64);

    let (arch, count) = match info.cpu_context {
        CpuContext::X86_64(_) => (ARCH_X86_64, 18),
        CpuContext::Aarch64(_) => (ARCH_AARCH64, 34),
        CpuContext::Unavailable => (ARCH_NONE, 0),
    };
    w.u32(arch);
    w.u32(count);
    info.cpu_context.for_each_register(|_, v| w.u64(v));

    let frames = info.backtrace();
    w.u32(frames.len() as u32);
    for &f in frames {
        w.u64(f as u64);
    }
    w.str(info.description.as_str());
    w.str(info.thread_name.as_str());

    SymbolLookup::for_each_module(|m| {
        w.bytes(&[1]);
        w.u64(m.base_address as u64);
        w.u64(m.size as u64);
        w.str(m.name.as_str());
        w.str(m.file_path.as_str());
    });
    w.bytes(&[0]);
}

/// A module as recorded in a crash snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MinidumpModule {
    pub base_address: usize,
    pub size: usize,
    pub name: String,
    pub path: String,
}

/// A crash snapshot read back from disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Minidump {
    pub version: u32,
    pub time_secs: i64,
    pub time_micros: u32,
    pub platform: PlatformRecord,
    pub thread_sys_id: ThreadSysId,
    pub instruction_address: usize,
    pub memory_address: usize,
    pub cpu_context: CpuContext,
    pub backtrace: Vec<usize>,
    pub description: String,
    pub thread_name: String,
    pub modules: Vec<MinidumpModule>,
}

struct DumpReader<'a> {
    data: &'a [u8],
}

impl<'a> DumpReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(Error::InvalidMinidump("truncated"));
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut a = [0; N];
        a.copy_from_slice(self.take(N)?);
        Ok(a)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        self.array().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32> {
        self.array().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Result<u64> {
        self.array().map(u64::from_le_bytes)
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

impl Minidump {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        Self::parse(&fs::read(path)?)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = DumpReader { data };
        if r.array::<4>()? != MINIDUMP_MAGIC {
            return Err(Error::InvalidMinidump("bad magic"));
        }
        let version = r.u32()?;
        if version != MINIDUMP_VERSION {
            return Err(Error::InvalidMinidump("unsupported version"));
        }
        let time_secs = r.u64()? as i64;
        let time_micros = r.u32()?;
        let (signo, code, errno) = (r.u32()? as i32, r.u32()? as i32, r.u32()? as i32);
        let platform = match signo {
            0 => PlatformRecord::Synthetic,
            _ => PlatformRecord::Signal { signo, code, errno },
        };
        let thread_sys_id = r.u64()?;
        let instruction_address = r.u64()? as usize;
        let memory_address = r.u64()? as usize;

        let arch = r.u32()?;
        let count = r.u32()? as usize;
        let cpu_context = match (arch, count) {
            (ARCH_NONE, 0) => CpuContext::Unavailable,
            (ARCH_X86_64, 18) => {
                let mut regs = [0u64; 18];
                for reg in &mut regs {
                    *reg = r.u64()?;
                }
                CpuContext::X86_64(X86_64Registers::from_array(&regs))
            }
            (ARCH_AARCH64, 34) => {
                let mut regs = Aarch64Registers::default();
                for x in &mut regs.x {
                    *x = r.u64()?;
                }
                regs.sp = r.u64()?;
                regs.pc = r.u64()?;
                regs.pstate = r.u64()?;
                CpuContext::Aarch64(regs)
            }
            _ => return Err(Error::InvalidMinidump("unknown register set")),
        };

        let frame_count = r.u32()? as usize;
        if frame_count > data.len() / 8 {
            return Err(Error::InvalidMinidump("truncated"));
        }
        let backtrace = (0..frame_count)
            .map(|_| r.u64().map(|f| f as usize))
            .collect::<Result<Vec<_>>>()?;
        let description = r.string()?;
        let thread_name = r.string()?;

        let mut modules = Vec::new();
        loop {
            match r.u8()? {
                0 => break,
                1 => modules.push(MinidumpModule {
                    base_address: r.u64()? as usize,
                    size: r.u64()? as usize,
                    name: r.string()?,
                    path: r.string()?,
                }),
                _ => return Err(Error::InvalidMinidump("bad module record")),
            }
        }

        Ok(Minidump {
            version,
            time_secs,
            time_micros,
            platform,
            thread_sys_id,
            instruction_address,
            memory_address,
            cpu_context,
            backtrace,
            description,
            thread_name,
            modules,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> ExceptionInfo {
        let mut info = ExceptionInfo::new();
        info.time_secs = 1_704_067_200;
        info.time_micros = 42;
        info.thread_sys_id = thread::current_thread_sys_id();
        info.thread_name = FixedStr::from_str_truncate("worker");
        info.instruction_address = 0x4000;
        info.memory_address = 0x10;
        info.description = FixedStr::from_str_truncate("SIGSEGV: access violation");
        info.platform = PlatformRecord::Signal {
            signo: libc::SIGSEGV,
            code: 2,
            errno: 0,
        };
        let mut regs = X86_64Registers::default();
        regs.rip = 0x4000;
        regs.rsp = 0x7ff0;
        info.cpu_context = CpuContext::X86_64(regs);
        info.backtrace[..3].copy_from_slice(&[0x4000, 0x5000, 0x6000]);
        info.backtrace_count = 3;
        info
    }

    #[test]
    fn path_expansion_substitutes_every_token() {
        let p = expand_path("/tmp/report %s.txt", 1_704_067_200);
        assert_eq!(p, "/tmp/report 2024-01-01_00-00-00.txt");
        let p = expand_path("/tmp/%s/%s", 0);
        assert_eq!(p, "/tmp/1970-01-01_00-00-00/1970-01-01_00-00-00");
        assert_eq!(expand_path("/tmp/plain", 0), "/tmp/plain");
    }

    #[test]
    fn overlong_paths_are_rejected() {
        let long = "x".repeat(PATH_LEN);
        assert!(matches!(
            path_template(Path::new(&long)),
            Err(Error::PathTooLong { .. })
        ));
        let near = format!("/{}%s", "y".repeat(PATH_LEN - 10));
        assert!(path_template(Path::new(&near)).is_err());
        assert!(path_template(Path::new("/tmp/r_%s.txt")).is_ok());
    }

    #[test]
    fn default_directory_honours_xdg() {
        let dir = crash_dump_directory();
        assert!(dir.ends_with("crash-reports") || dir.ends_with("DiagnosticReports"));
    }

    #[test]
    fn report_has_every_section() {
        let info = sample_info();
        let opts = ReportOptions {
            report_path: "/tmp/r.txt",
            minidump_path: "",
            app_description: "unit test",
            code_base_paths: &[FixedStr::from_str_truncate("/src")],
            privacy: true,
        };
        let mut out = String::new();
        write_report(&mut out, &info, &opts).unwrap();
        for section in [
            "Exception Info",
            "Time (UTC): 2024-01-01 00:00:00.000042",
            "\nBacktrace\n",
            "\nThread callstacks\n",
            "\nModule list\n",
            "\nSystem Info\n",
            "\nProcess list\nDisabled by report privacy settings",
            "Thread name: worker",
            "App description: unit test",
            "Code base path: /src",
            "rip: 0x0000000000004000",
            "Exception stack pointer: 0x7ff0",
            "(exception thread)",
        ] {
            assert!(out.contains(section), "missing {section:?} in\n{out}");
        }
        assert!(!out.contains("Host name"));
    }

    #[test]
    fn synthetic_faults_have_no_stack_pointer_line() {
        let mut info = ExceptionInfo::new();
        info.description = FixedStr::from_str_truncate("deadlock");
        let opts = ReportOptions {
            report_path: "",
            minidump_path: "",
            app_description: "",
            code_base_paths: &[],
            privacy: true,
        };
        let mut out = String::new();
        write_exception_info(&mut out, &info, &opts).unwrap();
        assert!(out.contains("deadlock"));
        assert!(!out.contains("Exception stack pointer"));
        assert!(!out.contains("Signal:"));
    }

    #[test]
    fn privacy_off_lists_identifying_details() {
        let info = sample_info();
        let opts = ReportOptions {
            report_path: "",
            minidump_path: "",
            app_description: "",
            code_base_paths: &[],
            privacy: false,
        };
        let mut out = String::new();
        write_report(&mut out, &info, &opts).unwrap();
        assert!(out.contains("Host name: "));
        assert!(out.contains("User: "));
        assert!(!out.contains("Disabled by report privacy settings"));
    }

    #[test]
    fn minidump_reads_back() {
        let info = sample_info();
        let mut bytes = Vec::new();
        write_minidump(&mut |b: &[u8]| bytes.extend_from_slice(b), &info);
        let dump = Minidump::parse(&bytes).unwrap();
        assert_eq!(dump.time_secs, info.time_secs);
        assert_eq!(dump.platform, info.platform);
        assert_eq!(dump.cpu_context, info.cpu_context);
        assert_eq!(dump.backtrace, vec![0x4000, 0x5000, 0x6000]);
        assert_eq!(dump.description, "SIGSEGV: access violation");
        assert_eq!(dump.thread_name, "worker");
        assert!(!dump.modules.is_empty());

        assert!(matches!(
            Minidump::parse(&bytes[..bytes.len() / 2]),
            Err(Error::InvalidMinidump("truncated"))
        ));
        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(matches!(Minidump::parse(&bad), Err(Error::InvalidMinidump("bad magic"))));
    }
}
