//! Read-write lock (spec §4.4 "RWLock").
//!
//! The event-type table in spec §4.3 has no dedicated `RwLock` kind — only
//! `Mutex` and `Cond` — so this is built the classic userspace way, on top of
//! this crate's own [`Mutex`] and [`Cond`]: an internal mutex protects a
//! small reader/writer counter, and two conditions (`readers_ok`,
//! `writer_ok`) gate entry. A pending writer increments `waiting_writers`
//! before it starts waiting, and every reader checks that counter as well as
//! `active_writer`, which is what gives a queued writer priority over
//! readers that arrive after it (spec: "a pending writer blocks new readers
//! to prevent writer starvation").

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

use crate::error::Result;
use crate::sync::cond::Cond;
use crate::sync::mutex::Mutex;

struct State {
    active_readers: u32,
    active_writer: bool,
    waiting_writers: u32,
}

pub struct RwLock<T: ?Sized> {
    state: Mutex<State>,
    readers_ok: Cond,
    writer_ok: Cond,
    data: UnsafeCell<T>,
}

impl<T> RwLock<T> {
    pub fn new(value: T) -> Self {
        RwLock {
            state: Mutex::new(State {
                active_readers: 0,
                active_writer: false,
                waiting_writers: 0,
            }),
            readers_ok: Cond::new(),
            writer_ok: Cond::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Acquires shared (read) access, yielding the current fiber while a
    /// writer holds the lock or one is queued ahead of this call.
    pub fn read(&self) -> Result<RwLockReadGuard<'_, T>> {
        let mut guard = self.state.lock()?;
        while guard.active_writer || guard.waiting_writers > 0 {
            guard = self.readers_ok.wait(guard)?;
        }
        guard.active_readers += 1;
        drop(guard);
        Ok(RwLockReadGuard { lock: self })
    }

    /// Acquires exclusive (write) access, yielding the current fiber until
    /// no reader or writer is active. Declares intent (`waiting_writers`)
    /// before waiting so readers arriving afterwards queue behind it.
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, T>> {
        let mut guard = self.state.lock()?;
        guard.waiting_writers += 1;
        while guard.active_writer || guard.active_readers > 0 {
            guard = match self.writer_ok.wait(guard) {
                Ok(g) => g,
                Err(e) => {
                    // Back out the reservation before propagating: this
                    // fiber never got the lock, so it shouldn't keep
                    // blocking readers behind it.
                    let mut g = self.state.lock()?;
                    g.waiting_writers -= 1;
                    return Err(e);
                }
            };
        }
        guard.waiting_writers -= 1;
        guard.active_writer = true;
        drop(guard);
        Ok(RwLockWriteGuard { lock: self })
    }

    fn unlock_read(&self) {
        let mut guard = self.state.lock().expect("rwlock state mutex is never held across a yield");
        guard.active_readers -= 1;
        let last_reader = guard.active_readers == 0;
        drop(guard);
        if last_reader {
            self.writer_ok.notify_one();
        }
    }

    fn unlock_write(&self) {
        let mut guard = self.state.lock().expect("rwlock state mutex is never held across a yield");
        guard.active_writer = false;
        drop(guard);
        self.writer_ok.notify_one();
        self.readers_ok.notify_all();
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_read();
    }
}

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_write();
    }
}

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::scheduler;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn reset() {
        scheduler::kill();
        scheduler::init(RuntimeConfig::default());
    }

    #[test]
    fn concurrent_readers_then_exclusive_writer() {
        reset();
        let lock = Rc::new(RwLock::new(0));
        let trace = Rc::new(RefCell::new(Vec::new()));

        for n in 0..3 {
            let l = lock.clone();
            let t = trace.clone();
            scheduler::spawn_fiber(
                format!("reader-{n}"),
                crate::priority_queue::PRIO_MIN,
                64 * 1024,
                Box::new(move || {
                    let guard = l.read().unwrap();
                    t.borrow_mut().push(*guard);
                }),
                false,
            );
        }

        for _ in 0..8 {
            scheduler::yield_now();
        }
        assert_eq!(trace.borrow().len(), 3);

        let l = lock.clone();
        {
            let mut guard = l.write().unwrap();
            *guard = 42;
        }
        assert_eq!(*lock.read().unwrap(), 42);
        scheduler::kill();
    }
}
