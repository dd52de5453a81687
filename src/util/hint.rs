/// Run `f` as an unlikely branch. Wrap error returns on allocation paths in
/// this so the optimizer lays the success path out first.
#[cold]
#[inline(never)]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}
