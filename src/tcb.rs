//! The fiber descriptor (TCB, spec §3 "Fiber").
//!
//! A [`Tcb`] owns everything the scheduler needs to suspend and resume a
//! fiber: its machine context, its stack, its current wait set, and the
//! bookkeeping (cleanup stack, keys, cancellation state, held-mutex ring)
//! spec §3/§4.7 describe. It deliberately knows nothing about the *type* of
//! value a fiber's closure returns — that type erasure happens once, at
//! [`crate::api::spawn`], by boxing the user closure together with a typed
//! result slot. This keeps the engine layer (`Tcb`, [`crate::scheduler`])
//! free of generics, the same way the teacher's `ffi::Fiber` is untyped and
//! only `fiber::Fyber<C, I>` adds the typed `Callee`/`Invocation` layer on
//! top.

use std::cell::{Cell, RefCell};
use std::time::Duration;

use crate::context::MachineContext;
use crate::event::EventSet;
use crate::time::Deadline;

pub type FiberId = u64;

/// The states a fiber can be in (spec §3). A fiber is on exactly one queue
/// matching its state, except `Running`, which by definition is off every
/// queue — it's whichever fiber `mctx_switch` currently has control of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    New,
    Ready,
    Running,
    Waiting,
    Suspended,
    Dead,
}

/// Deferred vs. asynchronous cancellation (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    Deferred,
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelState {
    pub enabled: bool,
    pub mode: CancelMode,
}

impl Default for CancelState {
    fn default() -> Self {
        CancelState {
            enabled: true,
            mode: CancelMode::Deferred,
        }
    }
}

pub(crate) struct Stack {
    /// `Some` when the runtime allocated (and therefore owns) the stack;
    /// `None` for a loaned stack (spec §3 "Stacks: ... or loaned").
    _owned: Option<Box<[u8]>>,
    pub hi: *mut u8,
    pub guard: *const u64,
}

const STACK_GUARD_MAGIC: u64 = 0xDEAD_FEED_C0DE_CAFE;

impl Stack {
    pub fn allocate(size: usize) -> Self {
        let size = size.max(crate::context::MIN_STACK_SIZE);
        let mut mem = vec![0u8; size].into_boxed_slice();
        // Guard word at the lowest address (spec §7: "stack overflow
        // detection"): the scheduler checks this is unmodified on every
        // switch.
        let guard = mem.as_mut_ptr() as *mut u64;
        unsafe { std::ptr::write(guard, STACK_GUARD_MAGIC) };
        let hi = unsafe { mem.as_mut_ptr().add(mem.len()) };
        Stack {
            _owned: Some(mem),
            hi,
            guard,
        }
    }

    /// The pseudo-stack for the `main` fiber: it is whatever stack the
    /// embedding program is already running on, so there is nothing for the
    /// runtime to allocate or guard.
    pub fn loaned() -> Self {
        Stack {
            _owned: None,
            hi: std::ptr::null_mut(),
            guard: std::ptr::null(),
        }
    }

    pub fn guard_intact(&self) -> bool {
        if self.guard.is_null() {
            return true;
        }
        unsafe { std::ptr::read(self.guard) == STACK_GUARD_MAGIC }
    }
}

/// A LIFO cleanup handler, spec §4.7. Unlike the C original's `(function,
/// argument)` pair, the Rust closure captures its own argument, which is the
/// idiomatic equivalent.
pub(crate) type CleanupHandler = Box<dyn FnOnce()>;

pub(crate) struct Tcb {
    pub id: FiberId,
    pub name: String,
    pub priority: Cell<i32>,
    pub dispatches: Cell<u64>,
    pub state: Cell<FiberState>,
    pub spawned_at: Deadline,
    pub last_ran_at: Cell<Option<Deadline>>,
    pub cumulative_running: Cell<Duration>,
    /// When this fiber most recently became `Running`, `None` otherwise.
    /// Consumed by `scheduler::switch_to` to fold the just-finished slice
    /// into `cumulative_running` each time control leaves the fiber.
    pub running_since: Cell<Option<Deadline>>,
    pub stack: Stack,
    pub ctx: RefCell<MachineContext>,
    /// The fiber's body. Taken (and run) exactly once, by the fiber
    /// trampoline, the first time it is dispatched.
    pub entry: RefCell<Option<Box<dyn FnOnce()>>>,
    pub joinable: Cell<bool>,
    /// Non-owning: `Some` exactly while `state == Waiting`.
    pub awaited_events: RefCell<Option<EventSet>>,
    pub cleanup_stack: RefCell<Vec<CleanupHandler>>,
    pub keys: RefCell<Vec<Option<Box<dyn std::any::Any>>>>,
    pub pending_signals: Cell<u64>,
    pub cancel_request: Cell<bool>,
    pub cancel_state: Cell<CancelState>,
    pub held_mutexes: RefCell<Vec<crate::sync::mutex::MutexId>>,
    pub errno: Cell<i32>,
    /// Set when this fiber died via cancellation rather than returning
    /// normally; `join` reports this as `Error::Canceled` / `PTH_CANCELED`
    /// instead of handing back the closure's result slot.
    pub canceled: Cell<bool>,
}

impl Tcb {
    /// Builds a fresh TCB in state `New` (or `Ready`, for the bootstrap
    /// `main` fiber, which is never dispatched through the ordinary
    /// new-fiber promotion path).
    pub fn new(
        id: FiberId,
        name: String,
        priority: i32,
        stack: Stack,
        entry: Option<Box<dyn FnOnce()>>,
        joinable: bool,
        initial_state: FiberState,
    ) -> Self {
        Tcb {
            id,
            name,
            priority: Cell::new(priority),
            dispatches: Cell::new(0),
            state: Cell::new(initial_state),
            spawned_at: Deadline::now(),
            last_ran_at: Cell::new(None),
            cumulative_running: Cell::new(Duration::ZERO),
            running_since: Cell::new(matches!(initial_state, FiberState::Running).then(Deadline::now)),
            stack,
            ctx: RefCell::new(MachineContext::fresh()),
            entry: RefCell::new(entry),
            joinable: Cell::new(joinable),
            awaited_events: RefCell::new(None),
            cleanup_stack: RefCell::new(Vec::new()),
            keys: RefCell::new(Vec::new()),
            pending_signals: Cell::new(0),
            cancel_request: Cell::new(false),
            cancel_state: Cell::new(CancelState::default()),
            held_mutexes: RefCell::new(Vec::new()),
            errno: Cell::new(0),
            canceled: Cell::new(false),
        }
    }

    pub fn effective_priority(&self) -> i32 {
        // Clamp so a long-aged fiber saturates at the top band rather than
        // overflowing past it; see `priority_queue` for the banding scheme.
        let bumped = self.priority.get() as i64 + self.dispatches.get() as i64;
        bumped.min(crate::priority_queue::PRIO_MAX as i64) as i32
    }
}

/// `Tid` event payload (spec §4.3): watches a specific fiber's lifecycle
/// directly through its own `Rc`, rather than looking it up by id on every
/// poll. Holding the `Rc` keeps the target's [`Tcb`] alive even after the
/// scheduler reaps it from the fiber registry, so a watch created before a
/// detached fiber dies keeps working after the registry has forgotten it.
pub(crate) struct TidWatch {
    target: std::rc::Rc<Tcb>,
    goal: crate::event::TidGoal,
}

impl TidWatch {
    pub fn new(target: std::rc::Rc<Tcb>, goal: crate::event::TidGoal) -> Self {
        TidWatch { target, goal }
    }
}

impl crate::event::EventSource for TidWatch {
    fn poll(&self, _waiter: FiberId) -> bool {
        use crate::event::TidGoal;
        let state = self.target.state.get();
        matches!(
            (self.goal, state),
            (TidGoal::New, FiberState::New)
                | (TidGoal::Ready, FiberState::Ready)
                | (TidGoal::Ready, FiberState::Running)
                | (TidGoal::Waiting, FiberState::Waiting)
                | (TidGoal::Dead, FiberState::Dead)
        )
    }
}
