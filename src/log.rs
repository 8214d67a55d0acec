//! Thin logging macros over the `log` crate.
//!
//! The scheduler and sync primitives log at dispatch, wait/wake, and
//! acquire/release boundaries. These macros exist so call sites read the
//! same regardless of which backend a future version might forward to, the
//! way the teacher's `say_*!` family wraps its own logging sink.

macro_rules! say_debug {
    ($($arg:tt)*) => { log::debug!($($arg)*) };
}

macro_rules! say_warn {
    ($($arg:tt)*) => { log::warn!($($arg)*) };
}

macro_rules! say_error {
    ($($arg:tt)*) => { log::error!($($arg)*) };
}

pub(crate) use say_debug;
pub(crate) use say_error;
pub(crate) use say_warn;
