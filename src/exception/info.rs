//! The snapshot taken at the moment of a fault.

use std::fmt;

use crate::{
    os::thread::{ThreadSysId, THREAD_NAME_LEN},
    symbol::{SymbolInfo, MAX_BACKTRACE_FRAMES},
    util::fixed::FixedStr,
};

pub const DESCRIPTION_LEN: usize = 1024;

/// General purpose registers of an x86-64 thread
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct X86_64Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl X86_64Registers {
    pub const NAMES: [&'static str; 18] = [
        "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15", "rip", "rflags",
    ];

    pub fn to_array(&self) -> [u64; 18] {
        [
            self.rax, self.rbx, self.rcx, self.rdx, self.rsi, self.rdi, self.rbp, self.rsp,
            self.r8, self.r9, self.r10, self.r11, self.r12, self.r13, self.r14, self.r15,
            self.rip, self.rflags,
        ]
    }

    pub fn from_array(r: &[u64; 18]) -> Self {
        Self {
            rax: r[0],
            rbx: r[1],
            rcx: r[2],
            rdx: r[3],
            rsi: r[4],
            rdi: r[5],
            rbp: r[6],
            rsp: r[7],
            r8: r[8],
            r9: r[9],
            r10: r[10],
            r11: r[11],
            r12: r[12],
            r13: r[13],
            r14: r[14],
            r15: r[15],
            rip: r[16],
            rflags: r[17],
        }
    }
}

/// General purpose registers of an AArch64 thread. `x[29]` is the frame
/// pointer and `x[30]` the link register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Aarch64Registers {
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

/// The faulting thread's registers. One variant per architecture we know how
/// to read a signal context for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CpuContext {
    X86_64(X86_64Registers),
    Aarch64(Aarch64Registers),
    #[default]
    Unavailable,
}

impl CpuContext {
    pub fn instruction_pointer(&self) -> Option<usize> {
        match self {
            CpuContext::X86_64(r) => Some(r.rip as usize),
            CpuContext::Aarch64(r) => Some(r.pc as usize),
            CpuContext::Unavailable => None,
        }
    }

    pub fn stack_pointer(&self) -> Option<usize> {
        match self {
            CpuContext::X86_64(r) => Some(r.rsp as usize),
            CpuContext::Aarch64(r) => Some(r.sp as usize),
            CpuContext::Unavailable => None,
        }
    }

    pub fn frame_pointer(&self) -> Option<usize> {
        match self {
            CpuContext::X86_64(r) => Some(r.rbp as usize),
            CpuContext::Aarch64(r) => Some(r.x[29] as usize),
            CpuContext::Unavailable => None,
        }
    }

    /// Call `f(name, value)` for every register, in a stable order
    pub fn for_each_register<F>(&self, mut f: F)
    where
        F: FnMut(&str, u64),
    {
        match self {
            CpuContext::X86_64(r) => {
                for (name, value) in X86_64Registers::NAMES.iter().zip(r.to_array()) {
                    f(name, value);
                }
            }
            CpuContext::Aarch64(r) => {
                let mut name = FixedStr::<4>::new();
                for (i, value) in r.x.iter().enumerate() {
                    name.clear();
                    let _ = fmt::write(&mut name, format_args!("x{i}"));
                    f(name.as_str(), *value);
                }
                f("sp", r.sp);
                f("pc", r.pc);
                f("pstate", r.pstate);
            }
            CpuContext::Unavailable => {}
        }
    }
}

/// Raw, platform-specific details of what went wrong
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlatformRecord {
    /// A POSIX signal, as delivered in `siginfo_t`
    Signal { signo: i32, code: i32, errno: i32 },
    /// Not a hardware fault at all: a report requested by the program (e.g. a
    /// deadlock report)
    #[default]
    Synthetic,
}

/// Everything captured about a fault. Built once per handled fault, using only
/// fixed-size storage, then handed to report writers and the listener.
#[derive(Clone)]
pub struct ExceptionInfo {
    /// Wall-clock time of capture, seconds since the Unix epoch
    pub time_secs: i64,
    pub time_micros: u32,
    pub backtrace: [usize; MAX_BACKTRACE_FRAMES],
    pub backtrace_count: usize,
    pub thread_sys_id: ThreadSysId,
    pub thread_name: FixedStr<THREAD_NAME_LEN>,
    /// The address of the instruction that faulted
    pub instruction_address: usize,
    /// The address the faulting instruction tried to touch, if any
    pub memory_address: usize,
    pub cpu_context: CpuContext,
    pub description: FixedStr<DESCRIPTION_LEN>,
    /// Symbol for `instruction_address`
    pub symbol: SymbolInfo,
    pub platform: PlatformRecord,
}

impl ExceptionInfo {
    pub const fn new() -> Self {
        Self {
            time_secs: 0,
            time_micros: 0,
            backtrace: [0; MAX_BACKTRACE_FRAMES],
            backtrace_count: 0,
            thread_sys_id: 0,
            thread_name: FixedStr::new(),
            instruction_address: 0,
            memory_address: 0,
            cpu_context: CpuContext::Unavailable,
            description: FixedStr::new(),
            symbol: SymbolInfo::EMPTY,
            platform: PlatformRecord::Synthetic,
        }
    }

    pub fn backtrace(&self) -> &[usize] {
        &self.backtrace[..self.backtrace_count]
    }
}

impl Default for ExceptionInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExceptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionInfo")
            .field("time_secs", &self.time_secs)
            .field("thread_sys_id", &self.thread_sys_id)
            .field("thread_name", &self.thread_name)
            .field("instruction_address", &format_args!("{:#x}", self.instruction_address))
            .field("memory_address", &format_args!("{:#x}", self.memory_address))
            .field("description", &self.description)
            .field("frames", &self.backtrace_count)
            .field("platform", &self.platform)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x86_64_registers_round_trip_through_array_order() {
        let mut a = [0u64; 18];
        for (i, v) in a.iter_mut().enumerate() {
            *v = i as u64 * 3;
        }
        let regs = X86_64Registers::from_array(&a);
        assert_eq!(regs.rip, 48);
        assert_eq!(regs.rsp, 21);
        let ctx = CpuContext::X86_64(regs);
        assert_eq!(ctx.instruction_pointer(), Some(48));
        let mut names = Vec::new();
        ctx.for_each_register(|n, _| names.push(n.to_string()));
        assert_eq!(names.len(), 18);
        assert_eq!(names[16], "rip");
    }

    #[test]
    fn aarch64_registers_are_named() {
        let mut regs = Aarch64Registers::default();
        regs.x[29] = 0x1000;
        regs.pc = 0x4000;
        let ctx = CpuContext::Aarch64(regs);
        assert_eq!(ctx.frame_pointer(), Some(0x1000));
        let mut seen = Vec::new();
        ctx.for_each_register(|n, v| seen.push((n.to_string(), v)));
        assert_eq!(seen.len(), 34);
        assert_eq!(seen[29], ("x29".to_string(), 0x1000));
        assert_eq!(seen[32], ("pc".to_string(), 0x4000));
    }

    #[test]
    fn unavailable_context_has_no_registers() {
        let ctx = CpuContext::Unavailable;
        assert_eq!(ctx.instruction_pointer(), None);
        let mut n = 0;
        ctx.for_each_register(|_, _| n += 1);
        assert_eq!(n, 0);
    }
}
