pub mod fixed;
pub mod hint;
pub mod num;
pub mod print;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `m`, ignoring poisoning. Every mutex in this crate guards plain
/// bookkeeping that is consistent between statements.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
