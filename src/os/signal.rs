//! POSIX signal plumbing for the exception handler: installing and restoring
//! `sigaction`s, giving threads an alternate signal stack, and decoding the
//! `siginfo_t`/`ucontext_t` the kernel hands us.

use std::{
    cell::UnsafeCell,
    mem::{self, MaybeUninit},
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, Ordering},
};

use libc::{c_int, c_void, siginfo_t};

use crate::{
    error::{Error, Result},
    exception::info::CpuContext,
    os::mem as os_mem,
    util::num::round_up,
};

/// The synchronous faults (plus `abort()` and traps) we take over
pub const HANDLED_SIGNALS: [c_int; 6] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGABRT,
    libc::SIGTRAP,
];

/// Size of the alternate stack we give a thread. Fault handling runs on this
/// stack, so it must hold a report writer's frames.
pub const ALT_STACK_SIZE: usize = 256 * 1024;

pub type SignalHandlerFn = extern "C" fn(c_int, *mut siginfo_t, *mut c_void);

/// The dispositions that were in place before [`install`], one per entry of
/// [`HANDLED_SIGNALS`]. Written only by `install`/`restore` (which are not
/// required to be thread-safe with each other), read by fault handlers.
struct PreviousActions {
    actions: UnsafeCell<[MaybeUninit<libc::sigaction>; HANDLED_SIGNALS.len()]>,
    installed: AtomicBool,
}

// SAFETY: see the struct docs. Readers only read after `installed` is set with
// release ordering.
unsafe impl Sync for PreviousActions {}

static PREVIOUS: PreviousActions = PreviousActions {
    actions: UnsafeCell::new([MaybeUninit::uninit(); HANDLED_SIGNALS.len()]),
    installed: AtomicBool::new(false),
};

fn signal_index(sig: c_int) -> Option<usize> {
    HANDLED_SIGNALS.iter().position(|&s| s == sig)
}

/// Install `handler` for every signal in [`HANDLED_SIGNALS`], remembering what
/// was there before.
///
/// # Safety
///
/// - Must not race with another `install`/`restore`
/// - `handler` must be async-signal-safe enough for the faults it handles
pub unsafe fn install(handler: SignalHandlerFn) -> Result<()> {
    if PREVIOUS.installed.load(Ordering::Acquire) {
        return Err(Error::AlreadyEnabled);
    }
    // SAFETY: nobody reads `actions` until `installed` is set below
    let actions = unsafe { &mut *PREVIOUS.actions.get() };
    for (i, &sig) in HANDLED_SIGNALS.iter().enumerate() {
        // SAFETY: a zeroed sigaction is a valid starting point
        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_NODEFER;
        // SAFETY: pointers to locals / our own static slots
        let rc = unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(sig, &action, actions[i].as_mut_ptr())
        };
        if rc != 0 {
            let err = Error::last_os("sigaction");
            // put back what we already replaced
            for (j, &done) in HANDLED_SIGNALS[..i].iter().enumerate() {
                // SAFETY: slots `..i` were filled by successful sigaction calls
                unsafe { libc::sigaction(done, actions[j].as_ptr(), ptr::null_mut()) };
            }
            return Err(err);
        }
    }
    PREVIOUS.installed.store(true, Ordering::Release);
    Ok(())
}

/// Put back the dispositions saved by [`install`]. A no-op if nothing is
/// installed.
///
/// # Safety
///
/// - Must not race with another `install`/`restore`
pub unsafe fn restore() {
    if !PREVIOUS.installed.swap(false, Ordering::AcqRel) {
        return;
    }
    // SAFETY: `installed` was set, so every slot is initialized
    let actions = unsafe { &*PREVIOUS.actions.get() };
    for (i, &sig) in HANDLED_SIGNALS.iter().enumerate() {
        unsafe { libc::sigaction(sig, actions[i].as_ptr(), ptr::null_mut()) };
    }
}

/// Put back only the saved disposition for `sig`, so that the next delivery of
/// it goes wherever it would have gone without us.
pub fn restore_one(sig: c_int) {
    let Some(i) = signal_index(sig) else { return };
    if !PREVIOUS.installed.load(Ordering::Acquire) {
        return;
    }
    // SAFETY: installed, so the slot is initialized; sigaction is
    // async-signal-safe
    unsafe {
        let actions = &*PREVIOUS.actions.get();
        libc::sigaction(sig, actions[i].as_ptr(), ptr::null_mut());
    }
}

/// Hand a signal to whatever was installed before us: call its handler, or
/// apply the default action (which for every signal we handle terminates the
/// process).
///
/// # Safety
///
/// - Must be called from a signal handler with the arguments it received
pub unsafe fn forward_to_previous(sig: c_int, info: *mut siginfo_t, ctx: *mut c_void) {
    let previous = signal_index(sig)
        .filter(|_| PREVIOUS.installed.load(Ordering::Acquire))
        // SAFETY: installed, so the slot is initialized
        .map(|i| unsafe { (*PREVIOUS.actions.get())[i].assume_init() });

    let Some(previous) = previous else {
        // SAFETY: only async-signal-safe calls
        unsafe { die_with(sig) };
        return;
    };
    match previous.sa_sigaction {
        libc::SIG_IGN => {}
        libc::SIG_DFL => unsafe { die_with(sig) },
        handler if previous.sa_flags & libc::SA_SIGINFO != 0 => {
            // SAFETY: SA_SIGINFO handlers have this signature
            let handler: SignalHandlerFn = unsafe { mem::transmute(handler) };
            handler(sig, info, ctx);
        }
        handler => {
            // SAFETY: plain handlers have this signature
            let handler: extern "C" fn(c_int) = unsafe { mem::transmute(handler) };
            handler(sig);
        }
    }
}

/// Reset `sig` to its default action and deliver it again. For a fault raised
/// by an instruction this terminates right away; for one raised by `kill` or
/// `raise` it does too, because the signal is re-sent rather than relying on
/// the instruction re-executing.
unsafe fn die_with(sig: c_int) {
    // SAFETY: async-signal-safe calls only
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, sig);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, ptr::null_mut());
        libc::raise(sig);
    }
}

/// Make sure the calling thread has an alternate signal stack of at least
/// [`ALT_STACK_SIZE`] bytes, so that a stack overflow (or a small runtime-
/// provided alt stack) does not kill the fault handler. The stack is kept for
/// the life of the process.
pub fn ensure_alt_stack() -> Result<()> {
    // SAFETY: querying only
    let mut current: libc::stack_t = unsafe { mem::zeroed() };
    if unsafe { libc::sigaltstack(ptr::null(), &mut current) } != 0 {
        return Err(Error::last_os("sigaltstack"));
    }
    if current.ss_flags & libc::SS_DISABLE == 0 && current.ss_size >= ALT_STACK_SIZE {
        return Ok(());
    }
    let page = os_mem::page_size();
    let size = round_up(ALT_STACK_SIZE, page);
    // one extra page at the bottom stays reserved-only, as a guard
    let base = os_mem::reserve(size + page)?;
    // SAFETY: `base + page` is inside the reservation we just made
    let stack = unsafe { NonNull::new_unchecked(base.as_ptr().add(page)) };
    // SAFETY: the range is inside our fresh reservation
    unsafe { os_mem::commit(stack, size)? };
    let new = libc::stack_t {
        ss_sp: stack.as_ptr() as *mut c_void,
        ss_size: size,
        ss_flags: 0,
    };
    // SAFETY: `new` describes memory we own for the rest of the process
    if unsafe { libc::sigaltstack(&new, ptr::null_mut()) } != 0 {
        let err = Error::last_os("sigaltstack");
        // SAFETY: never handed to the kernel
        unsafe { os_mem::release(base, size + page) };
        return Err(err);
    }
    Ok(())
}

/// Whether this thread is running a signal handler on an alternate stack
/// smaller than [`ALT_STACK_SIZE`], as it would be on a thread whose runtime
/// set up its own stack-overflow handler.
pub fn on_small_alt_stack() -> bool {
    // SAFETY: querying only; sigaltstack is async-signal-safe
    let mut current: libc::stack_t = unsafe { mem::zeroed() };
    if unsafe { libc::sigaltstack(ptr::null(), &mut current) } != 0 {
        return false;
    }
    current.ss_flags & libc::SS_ONSTACK != 0 && current.ss_size < ALT_STACK_SIZE
}

/// A stack of [`ALT_STACK_SIZE`] bytes kept aside for fault handling on
/// threads that were never given a big enough alternate stack. Only one fault
/// is handled at a time, so one stack serves the whole process.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod emergency {
    use std::sync::atomic::AtomicPtr;

    use super::*;

    extern "C" {
        fn getcontext(ucp: *mut libc::ucontext_t) -> c_int;
        fn makecontext(ucp: *mut libc::ucontext_t, func: extern "C" fn(), argc: c_int, ...);
        fn swapcontext(oucp: *mut libc::ucontext_t, ucp: *const libc::ucontext_t) -> c_int;
    }

    /// Room past `ucontext_t` for the fields newer glibc versions append
    #[repr(C)]
    struct Context {
        uc: libc::ucontext_t,
        _tail: [u64; 64],
    }

    type Task = *mut (dyn FnMut() + 'static);

    struct Emergency {
        stack: AtomicPtr<u8>,
        caller: UnsafeCell<MaybeUninit<Context>>,
        callee: UnsafeCell<MaybeUninit<Context>>,
        task: UnsafeCell<Option<Task>>,
    }

    // SAFETY: the cells are only touched by `run`, whose caller holds the
    // process-wide fault handling guard
    unsafe impl Sync for Emergency {}

    static EMERGENCY: Emergency = Emergency {
        stack: AtomicPtr::new(ptr::null_mut()),
        caller: UnsafeCell::new(MaybeUninit::uninit()),
        callee: UnsafeCell::new(MaybeUninit::uninit()),
        task: UnsafeCell::new(None),
    };

    pub fn reserve() -> Result<()> {
        if !EMERGENCY.stack.load(Ordering::Acquire).is_null() {
            return Ok(());
        }
        let page = os_mem::page_size();
        let size = round_up(ALT_STACK_SIZE, page);
        let base = os_mem::reserve(size + page)?;
        // SAFETY: `base + page` is inside the reservation we just made; the
        // page below it stays reserved-only as a guard
        let stack = unsafe { NonNull::new_unchecked(base.as_ptr().add(page)) };
        if let Err(e) = unsafe { os_mem::commit(stack, size) } {
            // SAFETY: never published
            unsafe { os_mem::release(base, size + page) };
            return Err(e);
        }
        let published = EMERGENCY.stack.compare_exchange(
            ptr::null_mut(),
            stack.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if published.is_err() {
            // SAFETY: lost the race, ours was never published
            unsafe { os_mem::release(base, size + page) };
        }
        Ok(())
    }

    extern "C" fn trampoline() {
        // SAFETY: `run` stored the task before switching here and is parked
        // in swapcontext until we return
        if let Some(task) = unsafe { (*EMERGENCY.task.get()).take() } {
            unsafe { (*task)() };
        }
    }

    /// # Safety
    ///
    /// - Only one thread may be inside `run` at a time
    pub unsafe fn run(f: &mut dyn FnMut()) -> bool {
        let stack = EMERGENCY.stack.load(Ordering::Acquire);
        if stack.is_null() {
            return false;
        }
        let size = round_up(ALT_STACK_SIZE, os_mem::page_size());
        // SAFETY: `f` outlives the switch below, which returns only after the
        // trampoline has finished with it
        let f: *mut (dyn FnMut() + '_) = f;
        let task: Task = unsafe { mem::transmute(f) };
        // SAFETY: exclusive access is passed to caller
        unsafe {
            let caller = (*EMERGENCY.caller.get()).as_mut_ptr().cast::<libc::ucontext_t>();
            let callee = (*EMERGENCY.callee.get()).as_mut_ptr().cast::<libc::ucontext_t>();
            if getcontext(callee) != 0 {
                return false;
            }
            (*callee).uc_stack.ss_sp = stack.cast();
            (*callee).uc_stack.ss_size = size;
            (*callee).uc_stack.ss_flags = 0;
            (*callee).uc_link = caller;
            makecontext(callee, trampoline, 0);
            *EMERGENCY.task.get() = Some(task);
            if swapcontext(caller, callee) != 0 {
                *EMERGENCY.task.get() = None;
                return false;
            }
        }
        true
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn task_runs_on_the_reserved_stack() {
            reserve().unwrap();
            reserve().unwrap();
            let base = EMERGENCY.stack.load(Ordering::Acquire) as usize;
            let mut seen = 0usize;
            let mut runs = 0;
            let ran = unsafe {
                run(&mut || {
                    let local = 0u8;
                    seen = std::hint::black_box(&local) as *const u8 as usize;
                    runs += 1;
                })
            };
            assert!(ran);
            assert_eq!(runs, 1);
            assert!((base..base + ALT_STACK_SIZE).contains(&seen), "{seen:#x} not in {base:#x}");
        }
    }
}

/// Set aside the process-wide emergency stack used by
/// [`run_on_emergency_stack`]. Later calls do nothing.
pub fn reserve_emergency_stack() -> Result<()> {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    return emergency::reserve();
    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    Ok(())
}

/// Run `f` to completion on the emergency stack and switch back. Returns
/// `false`, without running `f`, if there is no emergency stack on this
/// target or it was never reserved.
///
/// # Safety
///
/// - Only one thread may be in here at a time
pub unsafe fn run_on_emergency_stack(f: &mut dyn FnMut()) -> bool {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    // SAFETY: requirement passed to caller
    return unsafe { emergency::run(f) };
    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    {
        let _ = f;
        false
    }
}

/// The address the faulting instruction touched (zero when not applicable)
///
/// # Safety
///
/// - `info` must be the `siginfo_t` passed to a signal handler
pub unsafe fn fault_address(info: *const siginfo_t) -> usize {
    if info.is_null() {
        return 0;
    }
    #[cfg(any(target_os = "linux", target_os = "android"))]
    // SAFETY: requirement passed to caller
    unsafe {
        (*info).si_addr() as usize
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    // SAFETY: requirement passed to caller
    unsafe {
        (*info).si_addr as usize
    }
}

/// `(signo, code, errno)` out of a `siginfo_t`
///
/// # Safety
///
/// - `info` must be null or the `siginfo_t` passed to a signal handler
pub unsafe fn signal_fields(sig: c_int, info: *const siginfo_t) -> (i32, i32, i32) {
    if info.is_null() {
        return (sig, 0, 0);
    }
    // SAFETY: requirement passed to caller
    unsafe { (sig, (*info).si_code, (*info).si_errno) }
}

/// Read the interrupted thread's registers out of the `ucontext_t`
///
/// # Safety
///
/// - `ctx` must be null or the context pointer passed to an `SA_SIGINFO`
///   signal handler
pub unsafe fn cpu_context(ctx: *const c_void) -> CpuContext {
    if ctx.is_null() {
        return CpuContext::Unavailable;
    }
    // SAFETY: requirement passed to caller
    unsafe { read_ucontext(ctx as *const libc::ucontext_t) }
}

#[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "x86_64"))]
unsafe fn read_ucontext(uc: *const libc::ucontext_t) -> CpuContext {
    use crate::exception::info::X86_64Registers;
    use libc::{
        REG_EFL, REG_R10, REG_R11, REG_R12, REG_R13, REG_R14, REG_R15, REG_R8, REG_R9, REG_RAX,
        REG_RBP, REG_RBX, REG_RCX, REG_RDI, REG_RDX, REG_RIP, REG_RSI, REG_RSP,
    };
    // SAFETY: requirement passed to caller
    let g = unsafe { &(*uc).uc_mcontext.gregs };
    let r = |i: c_int| g[i as usize] as u64;
    CpuContext::X86_64(X86_64Registers {
        rax: r(REG_RAX),
        rbx: r(REG_RBX),
        rcx: r(REG_RCX),
        rdx: r(REG_RDX),
        rsi: r(REG_RSI),
        rdi: r(REG_RDI),
        rbp: r(REG_RBP),
        rsp: r(REG_RSP),
        r8: r(REG_R8),
        r9: r(REG_R9),
        r10: r(REG_R10),
        r11: r(REG_R11),
        r12: r(REG_R12),
        r13: r(REG_R13),
        r14: r(REG_R14),
        r15: r(REG_R15),
        rip: r(REG_RIP),
        rflags: r(REG_EFL),
    })
}

#[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "aarch64"))]
unsafe fn read_ucontext(uc: *const libc::ucontext_t) -> CpuContext {
    use crate::exception::info::Aarch64Registers;
    // SAFETY: requirement passed to caller
    let m = unsafe { &(*uc).uc_mcontext };
    let mut x = [0u64; 31];
    for (dst, src) in x.iter_mut().zip(m.regs.iter()) {
        *dst = *src as u64;
    }
    CpuContext::Aarch64(Aarch64Registers {
        x,
        sp: m.sp as u64,
        pc: m.pc as u64,
        pstate: m.pstate as u64,
    })
}

// Register state is only decoded on Linux/Android; elsewhere reports carry
// no CPU context.
#[cfg(not(all(
    any(target_os = "linux", target_os = "android"),
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
unsafe fn read_ucontext(_: *const libc::ucontext_t) -> CpuContext {
    CpuContext::Unavailable
}

pub fn signal_name(sig: c_int) -> &'static str {
    match sig {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGBUS => "SIGBUS",
        libc::SIGILL => "SIGILL",
        libc::SIGFPE => "SIGFPE",
        libc::SIGABRT => "SIGABRT",
        libc::SIGTRAP => "SIGTRAP",
        _ => "signal",
    }
}

/// A human readable reason for `(sig, code)`. Only codes with the same value on
/// every platform we build for are decoded.
pub fn describe(sig: c_int, code: c_int) -> &'static str {
    // SEGV_MAPERR / SEGV_ACCERR and BUS_ADRALN are 1 / 2 / 1 everywhere
    match (sig, code) {
        (libc::SIGSEGV, 1) => "access to unmapped memory",
        (libc::SIGSEGV, 2) => "access violation (invalid permissions for mapped memory)",
        (libc::SIGSEGV, _) => "access violation",
        (libc::SIGBUS, 1) => "misaligned memory access",
        (libc::SIGBUS, _) => "bus error",
        (libc::SIGILL, _) => "illegal instruction",
        (libc::SIGFPE, _) => "floating point or integer arithmetic exception",
        (libc::SIGABRT, _) => "abort",
        (libc::SIGTRAP, _) => "trace/breakpoint trap",
        _ => "unknown fault",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_and_descriptions() {
        assert_eq!(signal_name(libc::SIGSEGV), "SIGSEGV");
        assert_eq!(describe(libc::SIGSEGV, 2), "access violation (invalid permissions for mapped memory)");
        assert_eq!(describe(libc::SIGILL, 0), "illegal instruction");
        assert_eq!(signal_index(libc::SIGBUS), Some(1));
        assert_eq!(signal_index(libc::SIGINT), None);
    }

    #[test]
    fn alt_stack_is_big_enough_after_ensure() {
        std::thread::spawn(|| {
            ensure_alt_stack().unwrap();
            let mut current: libc::stack_t = unsafe { mem::zeroed() };
            assert_eq!(unsafe { libc::sigaltstack(ptr::null(), &mut current) }, 0);
            assert_eq!(current.ss_flags & libc::SS_DISABLE, 0);
            assert!(current.ss_size >= ALT_STACK_SIZE);
            // a second call keeps the stack we already have
            ensure_alt_stack().unwrap();
            let mut again: libc::stack_t = unsafe { mem::zeroed() };
            unsafe { libc::sigaltstack(ptr::null(), &mut again) };
            assert_eq!(again.ss_sp, current.ss_sp);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn null_context_is_unavailable() {
        assert_eq!(unsafe { cpu_context(ptr::null()) }, CpuContext::Unavailable);
        assert_eq!(unsafe { fault_address(ptr::null()) }, 0);
    }
}
