//! Process-wide startup and teardown.
//!
//! [`System`] owns the order things come up and go down in: the allocator is
//! installed first and cleared last, registered singletons are torn down in
//! the reverse of the order they registered in, and the leak report is the
//! very last thing that happens.
//!
//! `init`/`destroy` are meant to be called once each, from one thread, at the
//! start and end of the program.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};

use crate::{
    alloc::{
        global::{get_instance, set_instance},
        leak, Allocator, DebugPageAllocator,
    },
    config::{AllocatorKind, Config},
    error::Result,
    exception::ExceptionHandler,
    logging, timer,
    symbol::SymbolLookup,
    util::lock,
};

/// Something with process lifetime that needs to hear about teardown.
pub trait SystemSingleton: Send + Sync {
    /// Called before worker threads are joined; stop anything that would keep
    /// them running
    fn on_thread_destroy(&self) {}

    /// Called after every worker thread has finished
    fn on_system_destroy(&self);
}

struct SystemState {
    initialized: bool,
    /// Whether leak tracking was on at `init`
    tracking: bool,
    singletons: Vec<Arc<dyn SystemSingleton>>,
    threads: Vec<JoinHandle<()>>,
    exception_handler: Option<Arc<ExceptionHandler>>,
}

pub struct System {
    state: Mutex<SystemState>,
    assert_on_leaks: AtomicBool,
}

static SYSTEM: System = System::new();

impl System {
    const fn new() -> Self {
        Self {
            state: Mutex::new(SystemState {
                initialized: false,
                tracking: false,
                singletons: Vec::new(),
                threads: Vec::new(),
                exception_handler: None,
            }),
            assert_on_leaks: AtomicBool::new(true),
        }
    }

    pub fn global() -> &'static System {
        &SYSTEM
    }

    pub fn is_initialized() -> bool {
        lock(&SYSTEM.state).initialized
    }

    /// Install `allocator` (or [`DefaultAllocator`](crate::alloc::DefaultAllocator))
    /// and bring up logging and the timer. Returns `false`, changing nothing,
    /// if the system is already up.
    pub fn init(allocator: Option<&'static dyn Allocator>) -> bool {
        Self::init_inner(allocator, "info")
    }

    fn init_inner(allocator: Option<&'static dyn Allocator>, log_filter: &str) -> bool {
        let mut state = lock(&SYSTEM.state);
        if state.initialized {
            drop(state);
            log::warn!("System::init called twice; ignoring");
            return false;
        }
        logging::init(log_filter);
        timer::initialize_timer_system();

        state.tracking = leak::is_tracking_leaks();
        if state.tracking {
            // resolve leak backtraces with full debug info
            SymbolLookup::initialize();
        }
        match allocator {
            Some(a) => set_instance(Some(a)),
            None => {
                get_instance();
            }
        }
        state.initialized = true;
        log::debug!(target: "kdiag::system", "initialized (leak tracking: {})", state.tracking);
        true
    }

    /// [`System::init`] with everything `config` asks for: the allocator
    /// kind and its policy, leak tracking, and optionally an enabled
    /// exception handler.
    pub fn init_with_config(config: &Config) -> Result<bool> {
        if Self::is_initialized() {
            log::warn!("System::init_with_config called twice; ignoring");
            return Ok(false);
        }
        leak::set_leak_tracking(config.leak_tracking);

        let allocator: Option<&'static dyn Allocator> = match config.allocator.kind {
            AllocatorKind::Default => None,
            AllocatorKind::DebugPage => {
                let pages = DebugPageAllocator::new();
                pages.enable_overrun_detection(
                    config.allocator.overrun_detection,
                    config.allocator.guard_bytes,
                )?;
                pages.set_max_delayed_free_count(config.allocator.max_delayed_free_count)?;
                Some(Box::leak(Box::new(pages)))
            }
        };

        let handler = if config.exception.enabled {
            let ex = &config.exception;
            let handler = Arc::new(ExceptionHandler::new());
            handler.enable_report_privacy(ex.report_privacy);
            handler.set_exception_response(ex.response);
            handler.set_terminate_return_value(ex.terminate_return_value);
            handler.set_app_description(&ex.app_description);
            let paths: Vec<&str> = ex.code_base_paths.iter().map(String::as_str).collect();
            handler.set_code_base_directory_paths(&paths)?;
            handler.set_exception_paths(ex.report_path.as_deref(), ex.minidump_path.as_deref())?;
            Some(handler)
        } else {
            None
        };

        if !Self::init_inner(allocator, &config.log_filter) {
            return Ok(false);
        }
        if let Some(handler) = handler {
            handler.enable(true)?;
            lock(&SYSTEM.state).exception_handler = Some(handler);
        }
        Ok(true)
    }

    /// The handler [`System::init_with_config`] enabled, if any
    pub fn exception_handler() -> Option<Arc<ExceptionHandler>> {
        lock(&SYSTEM.state).exception_handler.clone()
    }

    /// Register `singleton` for teardown. Later registrations are torn down
    /// first.
    pub fn register_destroy_callback(singleton: Arc<dyn SystemSingleton>) {
        lock(&SYSTEM.state).singletons.push(singleton);
    }

    /// Spawn a named worker thread that [`System::destroy`] will join. The
    /// thread gets an alternate signal stack big enough for fault reports
    /// before `f` runs.
    pub fn spawn_thread<F>(name: &str, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new().name(name.to_owned()).spawn(move || {
            if let Err(e) = ExceptionHandler::prepare_thread() {
                log::warn!("no alternate signal stack for this worker: {e}");
            }
            f()
        })?;
        lock(&SYSTEM.state).threads.push(handle);
        Ok(())
    }

    /// Whether [`System::destroy`] `debug_assert!`s that nothing leaked
    /// (default on)
    pub fn set_assert_on_leaks(enabled: bool) {
        SYSTEM.assert_on_leaks.store(enabled, Ordering::Relaxed);
    }

    /// Tear everything down:
    ///
    /// 1. `on_thread_destroy` on every singleton, last registered first
    /// 2. join every thread from [`System::spawn_thread`]
    /// 3. `on_system_destroy` on every singleton, last registered first
    /// 4. disable the exception handler from `init_with_config`
    /// 5. shut down and clear the allocator instance
    /// 6. if leak tracking was on at `init`, report what is still live
    ///
    /// Returns the number of leaks reported, or `None` if tracking was off.
    /// Anything a `KernelAlloc::new()` global allocator handed out before
    /// this must not be freed afterwards; bind it with `KernelAlloc::with`
    /// instead if the program outlives `destroy`.
    pub fn destroy() -> Option<usize> {
        let (singletons, threads, handler, tracking) = {
            let mut state = lock(&SYSTEM.state);
            if !state.initialized {
                drop(state);
                log::warn!("System::destroy without System::init");
                return None;
            }
            state.initialized = false;
            (
                std::mem::take(&mut state.singletons),
                std::mem::take(&mut state.threads),
                state.exception_handler.take(),
                state.tracking,
            )
        };

        for s in singletons.iter().rev() {
            s.on_thread_destroy();
        }
        for t in threads {
            let name = t.thread().name().map(str::to_owned);
            if t.join().is_err() {
                log::error!("worker thread {name:?} panicked");
            }
        }
        for s in singletons.iter().rev() {
            s.on_system_destroy();
        }
        drop(singletons);

        if let Some(handler) = handler {
            if let Err(e) = handler.enable(false) {
                log::warn!("disabling exception handler: {e}");
            }
        }

        get_instance().on_system_shutdown();
        set_instance(None);

        let leaks = tracking.then(|| {
            let count = leak::dump_memory();
            SymbolLookup::shutdown();
            count
        });
        timer::shutdown_timer_system();

        if let Some(count) = leaks {
            if count != 0 {
                log::warn!("{count} allocation(s) leaked");
            }
            debug_assert!(
                count == 0 || !SYSTEM.assert_on_leaks.load(Ordering::Relaxed),
                "{count} allocation(s) leaked"
            );
        }
        leaks
    }
}
