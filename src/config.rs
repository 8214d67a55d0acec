//! Runtime tunables.
//!
//! Spec §4.2/§6 leave several knobs as "runtime-configurable" or "a tuning
//! parameter" rather than naming a concrete API for them: the new-fiber
//! promotion policy (`favour_new`), the default stack size, the event
//! manager's maximum poll granularity, and the load-average smoothing
//! window. [`RuntimeConfig`] collects them into one builder, the way the
//! teacher collects fiber attributes in `fiber::Builder`.

use std::time::Duration;

/// Default stack size for fibers that don't request one explicitly.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub(crate) default_stack_size: usize,
    pub(crate) favour_new: bool,
    pub(crate) max_poll_interval: Duration,
    pub(crate) avload_smoothing: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            default_stack_size: DEFAULT_STACK_SIZE,
            favour_new: false,
            max_poll_interval: Duration::from_secs(1),
            avload_smoothing: Duration::from_secs(1),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stack size used by [`crate::api::spawn`] when the caller's
    /// [`crate::api::Builder`] doesn't override it.
    pub fn default_stack_size(mut self, bytes: usize) -> Self {
        self.default_stack_size = bytes;
        self
    }

    /// When `true`, the scheduler promotes one `New` fiber to `Ready` on
    /// every dispatch, even while `Ready` is already non-empty (spec §4.2,
    /// "New-fiber promotion policy"). When `false` (the default), a `New`
    /// fiber is only promoted once `Ready` is empty.
    pub fn favour_new(mut self, favour: bool) -> Self {
        self.favour_new = favour;
        self
    }

    /// Upper bound on how long the event manager will block in a single
    /// `ppoll`/`poll` call even if no fiber is waiting on a timer, so
    /// process-wide bookkeeping (load average) keeps advancing.
    pub fn max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval = interval;
        self
    }

    /// The `τ` smoothing window for `ctrl(GET_AVLOAD)` (spec §6).
    pub fn avload_smoothing(mut self, window: Duration) -> Self {
        self.avload_smoothing = window;
        self
    }
}
