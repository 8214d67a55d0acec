//! Error handling (spec §7).
//!
//! Every operation in this crate returns a [`Result`] rather than aborting
//! the process; the only thing that terminates the program outright is an
//! internal invariant violation (a corrupted stack guard word, spec §7's
//! "Stack overflow detection"). [`Error`] groups the POSIX-flavoured error
//! kinds spec §7 lists (`Argument`, `Resource`, `Interrupted`,
//! `Not-permitted`, `Not-found`, `Canceled`) the way the teacher's
//! `error::Error` groups `Tarantool`/`IO`/`Decode`/etc — one `thiserror` enum
//! at the crate root.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All error cases produced by this crate's operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid argument: a bad fd, a nil handle, an out-of-range attribute.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Resource exhaustion: stack allocation failed, fd table exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The user-supplied event fired before the primitive's own event.
    #[error("interrupted by caller-supplied event")]
    Interrupted,

    /// E.g. releasing a mutex the calling fiber does not own.
    #[error("operation not permitted: {0}")]
    NotPermitted(String),

    /// E.g. joining an unknown fiber, `msgport_find` finding nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// The joined fiber was cancelled before it returned a value
    /// (`PTH_CANCELED`, spec §7).
    #[error("fiber was cancelled")]
    Canceled,

    /// A fiber's own code must not call a blocking primitive inside a
    /// cancellation cleanup handler run during async cancellation; also used
    /// for other "you called this from the wrong context" misuses that
    /// aren't simple argument errors.
    #[error("invalid runtime state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// The POSIX errno this error corresponds to, for callers migrating code
    /// that checks `errno` rather than matching on [`Error`].
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::ResourceExhausted(_) => libc::ENOMEM,
            Error::Interrupted => libc::EINTR,
            Error::NotPermitted(_) => libc::EDEADLK,
            Error::NotFound(_) => libc::ESRCH,
            Error::Canceled => 0,
            Error::InvalidState(_) => libc::EINVAL,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
