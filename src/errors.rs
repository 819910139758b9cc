//! Error taxonomy.
//!
//! Three kinds of failure exist in this crate:
//!
//! * guest-facing errnos (`libc::c_int`) which travel through the FUSE
//!   replies untouched,
//! * typed internal errors ([`WolfsError`]) which never cross the FUSE
//!   boundary raw and are converted at the dispatcher,
//! * programmer errors, which are plain assertions and are never caught.

use std::error::Error;
use std::fmt;
use std::io;

use libc::c_int;

/// Result type used by dispatcher-internal operations. The error side is the
/// errno that will be handed to `reply.error()`.
pub type FsResult<T> = Result<T, c_int>;

/// Typed errors raised by the core layers.
#[derive(Debug)]
pub enum WolfsError {
    /// The cache cannot hold the requested bytes without eviction.
    NotEnoughSpace {
        /// Bytes that were asked for.
        needed: u64,
        /// Bytes still free below the cache ceiling.
        available: u64,
    },
    /// Eviction ran out of candidates and the data still does not fit.
    CacheExhausted,
    /// The filesystem could not be mounted or a configured root is unusable.
    Mount(String),
    /// The remote source could not be brought online.
    Wakeup,
    /// An OS call failed; carries the original error.
    Io(io::Error),
}

impl fmt::Display for WolfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WolfsError::NotEnoughSpace { needed, available } => {
                write!(f, "not enough cache space: need {needed} B, {available} B free")
            }
            WolfsError::CacheExhausted => write!(f, "cache exhausted, nothing left to evict"),
            WolfsError::Mount(msg) => write!(f, "mount error: {msg}"),
            WolfsError::Wakeup => write!(f, "remote node could not be woken up"),
            WolfsError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl Error for WolfsError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WolfsError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WolfsError {
    fn from(e: io::Error) -> Self {
        WolfsError::Io(e)
    }
}

impl WolfsError {
    /// The errno this error surfaces as when it reaches the guest.
    pub fn errno(&self) -> c_int {
        match self {
            WolfsError::NotEnoughSpace { .. } => libc::ENOSPC,
            WolfsError::CacheExhausted => libc::EDQUOT,
            WolfsError::Mount(_) => libc::EIO,
            WolfsError::Wakeup => libc::EIO,
            WolfsError::Io(e) => errno_of(e),
        }
    }
}

/// Map an I/O error to the errno handed back to the kernel.
pub fn errno_of(err: &io::Error) -> c_int {
    err.raw_os_error().unwrap_or(libc::EIO)
}
