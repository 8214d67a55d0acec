//! Recursive mutex (spec §4.4 "Mutex").
//!
//! [`MutexInner`] is the non-generic engine-level half: it tracks only an
//! owning fiber and a recursion count and implements [`EventSource`] so the
//! scheduler can poll "free or self-owned" the same way it polls conds,
//! message ports and tid-watches. [`Mutex<T>`]/[`MutexGuard`] are the typed
//! RAII layer on top, grounded in the teacher's `fiber::mutex::Mutex`/
//! `MutexGuard` (which wraps a `Latch` the same way this wraps a
//! `MutexInner`).

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use crate::error::Result;
use crate::event::{Event, EventSet, EventSource, Kind};
use crate::scheduler;
use crate::tcb::{FiberId, Tcb};

pub(crate) type MutexId = Rc<MutexInner>;

pub(crate) struct MutexInner {
    owner: Cell<Option<FiberId>>,
    count: Cell<u32>,
}

impl MutexInner {
    fn new() -> MutexId {
        Rc::new(MutexInner {
            owner: Cell::new(None),
            count: Cell::new(0),
        })
    }

    fn try_acquire(&self, me: FiberId) -> bool {
        match self.owner.get() {
            None => {
                self.owner.set(Some(me));
                self.count.set(1);
                true
            }
            Some(owner) if owner == me => {
                self.count.set(self.count.get() + 1);
                true
            }
            Some(_) => false,
        }
    }
}

impl EventSource for MutexInner {
    fn poll(&self, waiter: FiberId) -> bool {
        matches!(self.owner.get(), None) || self.owner.get() == Some(waiter)
    }
}

fn mutex_event(inner: &MutexId) -> Event {
    let src: Rc<dyn EventSource> = inner.clone();
    Event::new(Kind::Mutex(src))
}

/// Engine-level acquire (spec §4.4): if free or self-owned, bumps the
/// recursion count and returns; otherwise waits on a `Mutex` event and
/// retries, since the mutex may be taken again by the time this fiber is
/// redispatched.
pub(crate) fn acquire(inner: &MutexId) -> Result<()> {
    let me = scheduler::current();
    loop {
        if inner.try_acquire(me) {
            scheduler::tcb(me).held_mutexes.borrow_mut().push(inner.clone());
            return Ok(());
        }
        scheduler::wait(EventSet::single(mutex_event(inner)))?;
    }
}

pub(crate) fn try_acquire(inner: &MutexId) -> bool {
    let me = scheduler::current();
    if inner.try_acquire(me) {
        scheduler::tcb(me).held_mutexes.borrow_mut().push(inner.clone());
        true
    } else {
        false
    }
}

/// Decrements the recursion count; at zero, frees ownership and drops
/// `inner` from the former owner's held-mutex ring (spec §4.4 `release`).
pub(crate) fn release(inner: &MutexId) {
    if inner.owner.get().is_none() {
        return;
    }
    let count = inner.count.get().saturating_sub(1);
    inner.count.set(count);
    if count == 0 {
        let owner = inner.owner.take();
        if let Some(owner) = owner {
            if let Some(t) = scheduler::try_tcb(owner) {
                t.held_mutexes.borrow_mut().retain(|m| !Rc::ptr_eq(m, inner));
            }
        }
    }
}

/// Builds a raw `Mutex` event for composition into a caller-supplied event
/// set (spec §4.4's `acquire(mutex, try, ev)` with a non-nil `ev`), used by
/// the I/O and high-level API layers when a mutex wait needs to race a
/// timeout or cancellation event.
pub(crate) fn event(inner: &MutexId) -> Event {
    mutex_event(inner)
}

/// Force-releases every mutex `tcb` still holds (spec §4.7: "on fiber
/// termination, all mutexes in the fiber's mutexring are force-released").
/// Cancellation never runs the owning fiber's own stack frames, so this is
/// the only release path an asynchronously-cancelled fiber ever gets; a
/// normal exit also reaches here empty-handed because `MutexGuard::drop`
/// already released everything along the way.
pub(crate) fn release_all_held(tcb: &Tcb) {
    for inner in tcb.held_mutexes.borrow_mut().drain(..) {
        inner.owner.set(None);
        inner.count.set(0);
    }
}

////////////////////////////////////////////////////////////////////////////
// Mutex<T> / MutexGuard<T>
////////////////////////////////////////////////////////////////////////////

pub struct Mutex<T: ?Sized> {
    inner: MutexId,
    data: UnsafeCell<T>,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Mutex {
            inner: MutexInner::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the mutex, yielding the current fiber until it is able to do
    /// so. The mutex is recursive: a fiber that already holds it just bumps
    /// the count and returns immediately.
    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        acquire(&self.inner)?;
        Ok(MutexGuard { lock: self })
    }

    /// Like [`lock`](Self::lock), but never yields: returns `None` instead
    /// of waiting if the mutex is held by another fiber.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if try_acquire(&self.inner) {
            Some(MutexGuard { lock: self })
        } else {
            None
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub(crate) fn id(&self) -> &MutexId {
        &self.inner
    }
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    /// Lets [`crate::sync::cond::Cond::wait`] release and later reacquire
    /// the same `Mutex` a guard came from.
    pub(crate) fn mutex_ref(&self) -> &'a Mutex<T> {
        self.lock
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Mutex::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => {
                d.field("data", &&*guard);
            }
            None => {
                d.field("data", &format_args!("<locked>"));
            }
        }
        d.finish_non_exhaustive()
    }
}

pub struct MutexGuard<'a, T: ?Sized> {
    lock: &'a Mutex<T>,
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        release(&self.lock.inner);
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn reset() {
        scheduler::kill();
        scheduler::init(RuntimeConfig::default());
    }

    #[test]
    fn recursive_lock_is_reentrant_for_the_owner() {
        reset();
        let m = Mutex::new(0);
        let g1 = m.lock().unwrap();
        let g2 = m.lock().unwrap();
        assert_eq!(*g1, 0);
        drop(g2);
        drop(g1);
        // Fully released: a third, fresh lock still succeeds immediately.
        assert!(m.try_lock().is_some());
        scheduler::kill();
    }

    #[test]
    fn try_lock_fails_while_another_fiber_holds_it() {
        reset();
        let m = Rc::new(Mutex::new(0));
        let held = m.lock().unwrap();
        let m2 = m.clone();
        let worker_saw_locked = Rc::new(Cell::new(false));
        let flag = worker_saw_locked.clone();
        scheduler::spawn_fiber(
            "worker".into(),
            crate::priority_queue::PRIO_MIN,
            64 * 1024,
            Box::new(move || {
                flag.set(m2.try_lock().is_none());
            }),
            false,
        );
        for _ in 0..4 {
            scheduler::yield_now();
        }
        assert!(worker_saw_locked.get());
        drop(held);
        scheduler::kill();
    }
}
