//! Helpers shared by the integration tests. Faults can't be caught in-process
//! by the test harness, so anything that is supposed to crash runs in a
//! `fork()`ed child and the parent looks at how it ended.

#![allow(dead_code)]

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Mutex, MutexGuard, PoisonError},
};

/// How a child process ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signaled(i32),
}

impl ChildExit {
    /// Killed by one of the signals a bad memory access raises
    pub fn is_memory_fault(self) -> bool {
        matches!(self, ChildExit::Signaled(s) if s == libc::SIGSEGV || s == libc::SIGBUS)
    }
}

static SERIAL: Mutex<()> = Mutex::new(());

/// Tests in one binary share the process: take this before touching global
/// state or forking, so no other test thread holds a lock the child needs.
pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run `f` in a forked child. A normal return exits with 0, a panic with 101.
pub fn run_in_child<F: FnOnce()>(f: F) -> ChildExit {
    // SAFETY: the child only runs `f` and then `_exit`s, never returning into
    // the test harness
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        let code = match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => 0,
            Err(_) => 101,
        };
        // SAFETY: leaving the child without running the parent's atexit hooks
        unsafe { libc::_exit(code) };
    }

    let mut status = 0;
    loop {
        // SAFETY: `pid` is our child
        let r = unsafe { libc::waitpid(pid, &mut status, 0) };
        if r == pid {
            break;
        }
        assert_eq!(
            std::io::Error::last_os_error().raw_os_error(),
            Some(libc::EINTR),
            "waitpid failed"
        );
    }
    if libc::WIFSIGNALED(status) {
        ChildExit::Signaled(libc::WTERMSIG(status))
    } else {
        ChildExit::Exited(libc::WEXITSTATUS(status))
    }
}

/// A unique scratch directory for one test
pub fn scratch_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("kdiag-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
