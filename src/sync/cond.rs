//! Condition variable (spec §4.4 "Cond").
//!
//! Unlike [`crate::sync::mutex::MutexInner`], a `Cond` event never becomes
//! occurred by being polled — `EventSource::poll` always returns `false`
//! here. The only thing that ever marks a `Cond` event `Occurred` is
//! [`notify`], which holds direct `Rc<Event>` handles to every fiber
//! currently registered on the condition and flips their status itself.
//! That is what gives the "no spurious wakeups" guarantee spec §4.4
//! promises: a fiber only wakes because some other fiber called `notify`
//! (or because a caller-supplied `ev` fired instead).

use std::rc::Rc;

use crate::error::Result;
use crate::event::{Event, EventSet, EventSource, Kind, Status};
use crate::ring::Ring;
use crate::scheduler;
use crate::sync::mutex::{Mutex, MutexGuard};
use crate::tcb::FiberId;

type CondId = Rc<CondInner>;

pub(crate) struct CondInner {
    waiters: std::cell::RefCell<Ring<Rc<Event>>>,
}

impl CondInner {
    fn new() -> CondId {
        Rc::new(CondInner {
            waiters: std::cell::RefCell::new(Ring::new()),
        })
    }

    fn register(self: &Rc<Self>) -> Rc<Event> {
        let src: Rc<dyn EventSource> = self.clone();
        let ev = Rc::new(Event::new(Kind::Cond(src)));
        self.waiters.borrow_mut().push_back(ev.clone());
        ev
    }

    fn unregister(&self, ev: &Rc<Event>) {
        self.waiters.borrow_mut().remove_first(|e| Rc::ptr_eq(e, ev));
    }
}

impl EventSource for CondInner {
    fn poll(&self, _waiter: FiberId) -> bool {
        false
    }
}

/// Waits for a notification (or `extra`, if given, to fire first). Registers
/// a fresh `Cond` event and a matching cleanup handler so an async-cancelled
/// fiber still deregisters itself even though it never returns here
/// normally.
fn wait_raw(inner: &CondId, extra: Option<Event>) -> Result<Rc<Event>> {
    let me = scheduler::current();
    let ev = inner.register();

    let cleanup_inner = inner.clone();
    let cleanup_ev = ev.clone();
    scheduler::tcb(me)
        .cleanup_stack
        .borrow_mut()
        .push(Box::new(move || cleanup_inner.unregister(&cleanup_ev)));

    let mut set = EventSet::new();
    set.push_rc(ev.clone());
    if let Some(extra) = extra {
        set.push(extra);
    }
    let result = scheduler::wait(set);

    // Reached only on a normal return; an async-cancelled fiber never comes
    // back here; its cleanup handler (pushed above) runs instead.
    scheduler::tcb(me).cleanup_stack.borrow_mut().pop();
    inner.unregister(&ev);
    result
}

fn notify(inner: &CondId, broadcast: bool) {
    let waiters = inner.waiters.borrow();
    if broadcast {
        for ev in waiters.iter() {
            ev.status.set(Status::Occurred);
        }
    } else if let Some(ev) = waiters.iter().next() {
        ev.status.set(Status::Occurred);
    }
}

/// A fiber-safe condition variable, always paired with a [`Mutex`] the way
/// [`Cond::wait`] expects.
pub struct Cond {
    inner: CondId,
}

impl Cond {
    pub fn new() -> Self {
        Cond { inner: CondInner::new() }
    }

    /// Wakes the longest-waiting fiber, if any.
    pub fn notify_one(&self) {
        notify(&self.inner, false);
    }

    /// Wakes every fiber currently waiting on this condition.
    pub fn notify_all(&self) {
        notify(&self.inner, true);
    }

    /// `release(mutex); wait(Cond); acquire(mutex)` (spec §4.4 `await`):
    /// releases the mutex behind `guard`, waits for a notification, then
    /// reacquires it before returning. The mutex is always reacquired before
    /// this returns, even on error.
    pub fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> Result<MutexGuard<'a, T>> {
        self.wait_ev(guard, None)
    }

    /// Like [`wait`](Self::wait), but also races a caller-supplied event
    /// (e.g. a timeout or cancellation source) against the notification.
    pub fn wait_ev<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        extra: Option<Event>,
    ) -> Result<MutexGuard<'a, T>> {
        let lock: &'a Mutex<T> = guard.mutex_ref();
        drop(guard);
        let wait_result = wait_raw(&self.inner, extra);
        let relocked = lock.lock()?;
        wait_result?;
        Ok(relocked)
    }
}

impl Default for Cond {
    fn default() -> Self {
        Cond::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use std::cell::RefCell;

    fn reset() {
        scheduler::kill();
        scheduler::init(RuntimeConfig::default());
    }

    #[test]
    fn notify_one_wakes_a_waiting_fiber() {
        reset();
        let mutex = Rc::new(Mutex::new(false));
        let cond = Rc::new(Cond::new());
        let trace = Rc::new(RefCell::new(Vec::new()));

        let m = mutex.clone();
        let c = cond.clone();
        let t = trace.clone();
        scheduler::spawn_fiber(
            "waiter".into(),
            crate::priority_queue::PRIO_MIN,
            64 * 1024,
            Box::new(move || {
                let mut guard = m.lock().unwrap();
                while !*guard {
                    guard = c.wait(guard).unwrap();
                }
                t.borrow_mut().push("woke");
            }),
            false,
        );

        for _ in 0..4 {
            scheduler::yield_now();
        }
        assert!(trace.borrow().is_empty());

        {
            let mut guard = mutex.lock().unwrap();
            *guard = true;
        }
        cond.notify_one();

        for _ in 0..4 {
            scheduler::yield_now();
        }
        assert_eq!(*trace.borrow(), vec!["woke"]);
        scheduler::kill();
    }
}
