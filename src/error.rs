use std::io;

use thiserror::Error;

/// Everything that can go wrong outside of the allocation path. Allocation
/// itself reports failure with [`crate::alloc::AllocError`] so that the hot
/// path stays a plain null check.
#[derive(Debug, Error)]
pub enum Error {
    /// Tried to change allocator layout policy while blocks laid out under
    /// the old policy are still live.
    #[error("cannot change allocator policy with {count} live allocation(s)")]
    LiveAllocations { count: usize },

    #[error("path is longer than {max} bytes")]
    PathTooLong { max: usize },

    #[error("at most {max} code base paths can be listed")]
    TooManyPaths { max: usize },

    #[error("{op} failed (errno {errno}: {})", crate::os::errno_name(*errno))]
    Os { op: &'static str, errno: i32 },

    #[error("an exception handler is already enabled for this process")]
    AlreadyEnabled,

    #[error("the exception handler is not enabled")]
    NotEnabled,

    #[error("unsupported on this platform: {0}")]
    Unsupported(&'static str),

    #[error("invalid crash snapshot: {0}")]
    InvalidMinidump(&'static str),

    #[error(transparent)]
    Alloc(#[from] crate::alloc::AllocError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl Error {
    /// Capture `errno` for a failed libc call named `op`
    pub fn last_os(op: &'static str) -> Self {
        Error::Os {
            op,
            errno: io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
