//! Fiber-safe one-time initialization, the `std::sync::Once` analogue SPEC's
//! high-level API lists alongside `key_create` but doesn't detail on its
//! own — built on this crate's [`Mutex`] + [`Cond`] the way `pthread_once`
//! is conventionally built on top of a mutex and condition variable.

use crate::error::Result;
use crate::sync::cond::Cond;
use crate::sync::mutex::Mutex;

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Done,
}

pub struct Once {
    state: Mutex<State>,
    cond: Cond,
}

impl Once {
    pub fn new() -> Self {
        Once {
            state: Mutex::new(State::Idle),
            cond: Cond::new(),
        }
    }

    /// Runs `f` exactly once across every fiber that calls `call_once` on
    /// this `Once`, however many of them call it concurrently. A fiber that
    /// arrives while another is already running `f` yields until it
    /// finishes, rather than running `f` itself.
    pub fn call_once(&self, f: impl FnOnce()) -> Result<()> {
        let mut guard = self.state.lock()?;
        loop {
            match *guard {
                State::Done => return Ok(()),
                State::Running => {
                    guard = self.cond.wait(guard)?;
                }
                State::Idle => {
                    *guard = State::Running;
                    drop(guard);
                    f();
                    let mut guard = self.state.lock()?;
                    *guard = State::Done;
                    drop(guard);
                    self.cond.notify_all();
                    return Ok(());
                }
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.state.try_lock().as_deref(), Some(State::Done))
    }
}

impl Default for Once {
    fn default() -> Self {
        Once::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::scheduler;
    use std::cell::Cell;
    use std::rc::Rc;

    fn reset() {
        scheduler::kill();
        scheduler::init(RuntimeConfig::default());
    }

    #[test]
    fn call_once_runs_the_closure_a_single_time() {
        reset();
        let once = Rc::new(Once::new());
        let runs = Rc::new(Cell::new(0));

        for n in 0..3 {
            let o = once.clone();
            let r = runs.clone();
            scheduler::spawn_fiber(
                format!("caller-{n}"),
                crate::priority_queue::PRIO_MIN,
                64 * 1024,
                Box::new(move || {
                    o.call_once(|| r.set(r.get() + 1)).unwrap();
                }),
                false,
            );
        }

        for _ in 0..8 {
            scheduler::yield_now();
        }

        assert_eq!(runs.get(), 1);
        assert!(once.is_completed());
        scheduler::kill();
    }
}
