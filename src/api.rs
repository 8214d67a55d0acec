//! The high-level public API (spec §6, component J).
//!
//! Every blocking call here is a thin shape over the event system: build an
//! [`EventSet`], hand it to [`scheduler::wait`], interpret the triggering
//! event. The generic/typed surface — [`Builder`], [`JoinHandle<T>`],
//! [`Key<T>`] — lives only here, the same split the teacher draws between
//! `fiber::Fyber<C, I>` (typed) and `ffi::Fiber` (opaque).

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::rc::Rc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event::{Event, EventSet, Kind, TidGoal};
use crate::scheduler;
use crate::tcb::{CancelMode, CancelState, FiberId, FiberState, Tcb, TidWatch};
use crate::time::Deadline;

pub use crate::scheduler::Stats;

/// Returns the id of the fiber making the call (spec §6 attribute surface).
pub fn current() -> FiberId {
    scheduler::current()
}

/// Cooperative yield with no event attached (spec §6 `yield`).
pub fn yield_now() {
    scheduler::yield_now();
}

/// Suspends the calling fiber until any event in `events` becomes
/// `Occurred`/`Failed`, returning the triggering event (spec §6 "event ...
/// wait"). The lower-level primitive every other blocking call in this
/// crate (sleep, mutex acquire, cond wait, message port `get`, the `_ev`
/// I/O wrappers) is built from; exposed directly so callers can compose
/// their own event rings the way spec §4.3's `event_concat` describes.
pub fn wait(events: EventSet) -> Result<Rc<Event>> {
    scheduler::wait(events)
}

/// Suspends the calling fiber until `duration` has elapsed (spec §6
/// `sleep`). A cancel point, like every blocking primitive.
pub fn sleep(duration: Duration) -> Result<()> {
    scheduler::wait(EventSet::single(Event::time(Deadline::now() + duration)))?;
    Ok(())
}

/// Spec §6 lists `sleep`/`nap`/`nanosleep` as a family; in the original
/// these differ only in the granularity of the duration argument, which
/// `Duration` already gives uniformly here, so `nap` is `sleep` under the
/// name the original API uses for sub-second waits.
pub fn nap(duration: Duration) -> Result<()> {
    sleep(duration)
}

/// Like [`sleep`], returning the unslept remainder — always zero here since
/// the only thing that can cut this wait short is cancellation, which
/// surfaces as `Err` rather than a partial sleep.
pub fn nanosleep(duration: Duration) -> Result<Duration> {
    sleep(duration)?;
    Ok(Duration::ZERO)
}

/// Terminates the calling fiber immediately (spec §6 `exit`), the same way
/// an async self-cancellation already does: it abandons whatever remains of
/// the caller's Rust call stack rather than unwinding it, after running the
/// cleanup stack. There is no exit-value parameter — a fiber's join result
/// is already carried by its closure's return value (see [`JoinHandle`]).
pub fn exit() -> ! {
    scheduler::terminate_current(false)
}

/// Terminates the calling fiber immediately and unconditionally, the way
/// `abort` does for the process — unlike [`cancel`], this bypasses the
/// target's own cancel-state gating because it can only target the caller.
pub fn abort() -> ! {
    scheduler::terminate_current(true)
}

/// Requests cancellation of `target` (spec §4.7). Deferred-mode targets
/// notice at their next cancel point; async-mode targets (other than the
/// caller) are torn down immediately.
pub fn cancel(target: FiberId) {
    scheduler::request_cancel(target);
}

/// Sets the calling fiber's cancellation enable/mode state, returning the
/// previous state (spec §6 `cancel_state`).
pub fn cancel_state(enabled: bool, mode: CancelMode) -> CancelState {
    let t = scheduler::tcb(scheduler::current());
    let prev = t.cancel_state.get();
    t.cancel_state.set(CancelState { enabled, mode });
    prev
}

/// An explicit cancellation point (spec §4.7): acts on a pending cancel
/// request if one exists and cancellation is enabled, otherwise a no-op.
pub fn cancel_point() {
    scheduler::check_cancellation();
}

/// Suspends `id` — removing it from whichever queue it's on — until
/// [`resume`] is called (spec §6 `suspend`/`resume`).
pub fn suspend(id: FiberId) -> Result<()> {
    scheduler::suspend_fiber(id)
}

pub fn resume(id: FiberId) -> Result<()> {
    scheduler::resume_fiber(id)
}

/// Read-only attribute snapshot for a fiber (spec §6: "get ... read-only
/// dispatch/time/state/events"). There is no `start_func`/`start_arg`
/// accessor here: the original's attribute pair exposes the C function
/// pointer and argument a fiber was created with, which has no meaningful
/// analogue once the entry point is an arbitrary captured Rust closure.
#[derive(Debug, Clone)]
pub struct FiberInfo {
    pub id: FiberId,
    pub name: String,
    pub priority: i32,
    pub state: FiberState,
    pub joinable: bool,
    pub dispatches: u64,
    pub spawned_at: Deadline,
    pub last_ran_at: Option<Deadline>,
    pub cumulative_running: Duration,
    pub awaiting_events: usize,
}

/// Snapshots `id`'s attributes (spec §6 read-only fiber attribute getters).
pub fn info(id: FiberId) -> Result<FiberInfo> {
    let t = scheduler::try_tcb(id).ok_or_else(|| Error::NotFound(format!("fiber {id}")))?;
    Ok(FiberInfo {
        id,
        name: t.name.clone(),
        priority: t.priority.get(),
        state: t.state.get(),
        joinable: t.joinable.get(),
        dispatches: t.dispatches.get(),
        spawned_at: t.spawned_at,
        last_ran_at: t.last_ran_at.get(),
        cumulative_running: t.cumulative_running.get(),
        awaiting_events: t
            .awaited_events
            .borrow()
            .as_ref()
            .map(EventSet::len)
            .unwrap_or(0),
    })
}

/// Changes `id`'s base priority (spec §6 `set` half of the fiber attribute
/// surface). Effective priority still ages on top of this with dispatches,
/// per the aging rule in spec §4.2.
pub fn set_priority(id: FiberId, priority: i32) -> Result<()> {
    let t = scheduler::try_tcb(id).ok_or_else(|| Error::NotFound(format!("fiber {id}")))?;
    t.priority.set(priority);
    Ok(())
}

/// Queues `sig` for delivery to `target` (spec §6 `raise`). Per spec §9's
/// open question, a target that is not presently blocked in a `sigwait`
/// simply accumulates the signal until its next call to [`sigwait`].
pub fn raise(target: FiberId, sig: libc::c_int) -> Result<()> {
    let t = scheduler::try_tcb(target).ok_or_else(|| Error::NotFound(format!("fiber {target}")))?;
    let bit = 1u64 << (sig as u64 % 64);
    t.pending_signals.set(t.pending_signals.get() | bit);
    Ok(())
}

/// Waits for any signal in `signals` to reach the calling fiber, either a
/// real OS signal relayed through the event manager or an earlier [`raise`]
/// this fiber hasn't consumed yet. Returns whichever signal fired.
pub fn sigwait(signals: &[libc::c_int]) -> Result<libc::c_int> {
    let t = scheduler::tcb(scheduler::current());
    for &sig in signals {
        let bit = 1u64 << (sig as u64 % 64);
        if t.pending_signals.get() & bit != 0 {
            t.pending_signals.set(t.pending_signals.get() & !bit);
            return Ok(sig);
        }
    }
    let event = Event::new(Kind::Sigs {
        signals: signals.to_vec(),
        fired: Cell::new(None),
    });
    let triggering = scheduler::wait(EventSet::single(event))?;
    match &triggering.kind {
        Kind::Sigs { fired, .. } => {
            Ok(fired.get().expect("a Sigs event occurred without recording which signal fired"))
        }
        _ => Err(Error::Interrupted),
    }
}

/// Aggregate scheduler statistics (spec §6 `ctrl(flag, …)`, the read side).
pub fn ctrl() -> Stats {
    scheduler::stats()
}

/// Toggles the new-fiber promotion policy at runtime (spec §6 `ctrl(flag,
/// …)`, the settable side: the original's `PTH_CTRL_FAVOURNEW` flag).
/// `RuntimeConfig::favour_new` only sets the starting value at [`crate::init`];
/// this is how a caller changes it afterward.
pub fn set_favour_new(favour: bool) {
    scheduler::set_favour_new(favour);
}

/// Pushes `handler` onto the calling fiber's cleanup stack (spec §4.7,
/// §6 `cleanup_push`). Run LIFO on fiber death unless popped first.
pub fn cleanup_push(handler: impl FnOnce() + 'static) {
    let t = scheduler::tcb(scheduler::current());
    t.cleanup_stack.borrow_mut().push(Box::new(handler));
}

/// Pops the most recently pushed cleanup handler. Runs it if `execute` is
/// `true`, otherwise discards it (spec §8: "cleanup_push(h,a);
/// cleanup_pop(TRUE) — h is called exactly once with a on normal exit").
pub fn cleanup_pop(execute: bool) {
    let t = scheduler::tcb(scheduler::current());
    let handler = t.cleanup_stack.borrow_mut().pop();
    if let (true, Some(h)) = (execute, handler) {
        h();
    }
}

// ---------------------------------------------------------------------
// Fiber-local keys (spec §3 "Key storage", §6 key_create/delete/setdata/getdata)
// ---------------------------------------------------------------------

struct KeySlot {
    in_use: bool,
    destructor: Option<Box<dyn Fn(Box<dyn Any>)>>,
}

thread_local! {
    static KEY_REGISTRY: RefCell<Vec<KeySlot>> = RefCell::new(Vec::new());
}

/// A fiber-local storage slot for values of type `T`. Every fiber has its
/// own value (or none) under a given `Key`; the slot itself is process-wide
/// and reused by [`key_create`] once [`key_delete`] frees it.
pub struct Key<T> {
    id: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        Key {
            id: self.id,
            _marker: PhantomData,
        }
    }
}
impl<T> Copy for Key<T> {}

/// Allocates a key, optionally with a destructor run against each fiber's
/// stored value (if any) when that fiber dies (spec §4.7: "runs key
/// destructors, per-key, for non-nil values").
pub fn key_create<T: 'static>(destructor: Option<Box<dyn Fn(T)>>) -> Key<T> {
    let erased: Option<Box<dyn Fn(Box<dyn Any>)>> = destructor.map(|d| {
        let boxed: Box<dyn Fn(Box<dyn Any>)> = Box::new(move |value: Box<dyn Any>| {
            if let Ok(v) = value.downcast::<T>() {
                d(*v);
            }
        });
        boxed
    });
    let id = KEY_REGISTRY.with(|reg| {
        let mut reg = reg.borrow_mut();
        if let Some(idx) = reg.iter().position(|s| !s.in_use) {
            reg[idx] = KeySlot {
                in_use: true,
                destructor: erased,
            };
            idx
        } else {
            reg.push(KeySlot {
                in_use: true,
                destructor: erased,
            });
            reg.len() - 1
        }
    });
    Key {
        id,
        _marker: PhantomData,
    }
}

/// Frees `key`'s slot for reuse. Per spec, this calls no destructors — a
/// fiber still holding a value under this key has it destroyed (if at all)
/// only when that fiber itself terminates.
pub fn key_delete<T>(key: Key<T>) {
    KEY_REGISTRY.with(|reg| {
        let mut reg = reg.borrow_mut();
        if let Some(slot) = reg.get_mut(key.id) {
            slot.in_use = false;
            slot.destructor = None;
        }
    });
}

/// Sets the calling fiber's value under `key`.
pub fn setdata<T: 'static>(key: &Key<T>, value: T) {
    let t = scheduler::tcb(scheduler::current());
    let mut keys = t.keys.borrow_mut();
    if keys.len() <= key.id {
        keys.resize_with(key.id + 1, || None);
    }
    keys[key.id] = Some(Box::new(value));
}

/// Reads the calling fiber's value under `key`, cloning it out from under
/// the fiber-local store (the original's untyped `void *` getter has no
/// borrow-checked equivalent, so this is the idiomatic substitute).
pub fn getdata<T: Clone + 'static>(key: &Key<T>) -> Option<T> {
    let t = scheduler::tcb(scheduler::current());
    let keys = t.keys.borrow();
    keys.get(key.id)?.as_ref()?.downcast_ref::<T>().cloned()
}

/// Runs destructors for every non-nil keyed value `t` still holds, per
/// spec §4.7. Called by the scheduler during fiber termination, after the
/// cleanup stack and before releasing held mutexes.
pub(crate) fn run_key_destructors(t: &Tcb) {
    let mut keys = t.keys.borrow_mut();
    KEY_REGISTRY.with(|reg| {
        let reg = reg.borrow();
        for (idx, slot) in keys.iter_mut().enumerate() {
            if let Some(value) = slot.take() {
                if let Some(KeySlot {
                    destructor: Some(d),
                    ..
                }) = reg.get(idx)
                {
                    d(value);
                }
            }
        }
    });
}

// ---------------------------------------------------------------------
// Spawning & joining (spec §6 spawn/join; §3 TCB fields)
// ---------------------------------------------------------------------

/// Configures a fiber before spawning it (spec's implied TCB construction
/// parameters, given a concrete builder the way the teacher's
/// `fiber::Builder` configures name/stack/attr before `start`/`defer`).
pub struct Builder {
    name: Option<String>,
    priority: i32,
    stack_size: usize,
    joinable: bool,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            name: None,
            priority: crate::priority_queue::PRIO_MIN,
            stack_size: 0,
            joinable: true,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Zero requests the runtime's configured default stack size.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn joinable(mut self, joinable: bool) -> Self {
        self.joinable = joinable;
        self
    }

    /// Spawns the fiber and returns a handle to it. The new fiber doesn't
    /// run until the scheduler dispatches it — unlike the teacher's
    /// `Fyber::immediate`, this crate never forces an eager yield from the
    /// spawning call.
    pub fn spawn<F, T>(self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        let slot: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
        let slot_for_entry = slot.clone();
        let name = self.name.unwrap_or_else(|| "<fiber>".into());
        let entry: Box<dyn FnOnce()> = Box::new(move || {
            let result = f();
            *slot_for_entry.borrow_mut() = Some(result);
        });
        let id = scheduler::spawn_fiber(name, self.priority, self.stack_size, entry, self.joinable);
        JoinHandle {
            id,
            slot,
            joined: Cell::new(!self.joinable),
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

/// Spawns `f` with default attributes (spec §6 `spawn`), equivalent to
/// `Builder::new().spawn(f)`.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    Builder::new().spawn(f)
}

/// An owned permission to join a fiber spawned with [`spawn`]/[`Builder`].
/// Dropping one that was never joined panics, the same contract the
/// teacher's `fiber::JoinHandle` enforces — a leaked join loses track of
/// whether the fiber completed, was cancelled, or is still running.
pub struct JoinHandle<T> {
    id: FiberId,
    slot: Rc<RefCell<Option<T>>>,
    joined: Cell<bool>,
}

impl<T> JoinHandle<T> {
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Blocks until the fiber terminates, returning its result — or
    /// `Err(Error::Canceled)` if it was cancelled before returning one
    /// (spec §7 "Canceled").
    pub fn join(self) -> Result<T> {
        self.joined.set(true);
        loop {
            let Some(t) = scheduler::try_tcb(self.id) else {
                return Err(Error::NotFound(format!("fiber {} already reaped", self.id)));
            };
            if t.state.get() == FiberState::Dead {
                let canceled = t.canceled.get();
                scheduler::reap_joined(self.id);
                return if canceled {
                    Err(Error::Canceled)
                } else {
                    Ok(self
                        .slot
                        .borrow_mut()
                        .take()
                        .expect("a normally-terminated fiber always populates its join slot"))
                };
            }
            let watch: Rc<dyn crate::event::EventSource> =
                Rc::new(TidWatch::new(t.clone(), TidGoal::Dead));
            scheduler::wait(EventSet::single(Event::new(Kind::Tid {
                goal: TidGoal::Dead,
                source: watch,
            })))?;
        }
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if !self.joined.get() {
            panic!("JoinHandle dropped before being joined");
        }
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
    fn spawn_and_join_returns_the_closures_value() {
        reset();
        let handle = spawn(|| 42);
        assert_eq!(handle.join().unwrap(), 42);
        scheduler::kill();
    }

    #[test]
    fn cancel_then_join_reports_canceled() {
        reset();
        let handle = Builder::new().joinable(true).spawn(|| {
            loop {
                yield_now();
                cancel_point();
            }
        });
        let id = handle.id();
        for _ in 0..4 {
            yield_now();
        }
        cancel(id);
        for _ in 0..8 {
            yield_now();
        }
        assert!(matches!(handle.join(), Err(Error::Canceled)));
        scheduler::kill();
    }

    #[test]
    fn cleanup_handler_runs_exactly_once_on_normal_exit() {
        reset();
        let ran = Rc::new(Cell::new(0));
        let r = ran.clone();
        let handle = spawn(move || {
            cleanup_push(move || r.set(r.get() + 1));
        });
        handle.join().unwrap();
        assert_eq!(ran.get(), 1);
        scheduler::kill();
    }

    #[test]
    fn key_destructor_runs_when_the_owning_fiber_dies() {
        reset();
        let destroyed = Rc::new(RefCell::new(Vec::new()));
        let d = destroyed.clone();
        let key: Key<i32> = key_create(Some(Box::new(move |v: i32| d.borrow_mut().push(v))));

        let handle = spawn(move || {
            setdata(&key, 7);
            assert_eq!(getdata(&key), Some(7));
        });
        handle.join().unwrap();

        assert_eq!(*destroyed.borrow(), vec![7]);
        key_delete(key);
        scheduler::kill();
    }

    #[test]
    fn sleep_blocks_roughly_the_requested_duration() {
        reset();
        let start = Deadline::now();
        sleep(Duration::from_millis(10)).unwrap();
        assert!(start.remaining() == Duration::ZERO);
        scheduler::kill();
    }
}
