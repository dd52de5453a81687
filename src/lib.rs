//! Diagnostic memory allocation and crash reporting.
//!
//! - [`alloc`]: the allocator interface the rest of a program allocates
//!   through, a plain [`DefaultAllocator`](alloc::DefaultAllocator), a
//!   page-granular [`DebugPageAllocator`](alloc::DebugPageAllocator) that turns
//!   overruns and use-after-free into faults, and leak tracking
//! - [`symbol`]: backtraces, symbol and module lookup
//! - [`exception`]: fault handling with text reports and crash snapshots
//! - [`system`]: startup and teardown ordering

pub mod alloc;
pub mod config;
pub mod error;
pub mod exception;
pub mod externc;
pub mod logging;
pub mod os;
pub mod symbol;
pub mod system;
pub mod timer;
pub mod util;

pub use config::Config;
pub use error::{Error, Result};
pub use system::{System, SystemSingleton};

/// Serializes tests that touch process-wide state (the allocator instance,
/// the global leak tracker, [`System`])
#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    util::lock(&LOCK)
}
