//! The dispatcher and event manager (spec §4.2).
//!
//! All scheduling state lives in one `thread_local!` [`Runtime`] (spec §9,
//! "Global mutable state": "encapsulate in a single Runtime value
//! initialized by `init` and torn down by `kill`"). A `thread_local` rather
//! than a process-wide global matches spec §1/§5's "single-OS-thread"
//! execution model directly: there is exactly one runtime per OS thread that
//! calls [`init`], and nothing here needs to be `Send`/`Sync` because no
//! fiber ever runs anywhere but the thread that created it.
//!
//! There is no dedicated "scheduler fiber" with its own stack (unlike spec
//! §4.2's two special fibers). Instead the dispatch algorithm runs on
//! whichever fiber's stack called into [`wait`]/[`yield_now`]/exit — the
//! same inline-dispatch technique real toy green-thread schedulers use (see
//! `DESIGN.md`). The observable behavior — priority, aging, ordering — is
//! identical to a dedicated scheduler fiber; it just saves one extra context
//! switch per dispatch.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicI32, Ordering as AtomicOrdering};
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::context::{self, MachineContext};
use crate::error::{Error, Result};
use crate::event::{Event, EventSet, FdGoal, Kind, Status};
use crate::log::{say_debug, say_error, say_warn};
use crate::priority_queue::PriorityQueue;
use crate::ring::Ring;
use crate::tcb::{CancelMode, FiberId, FiberState, Stack, Tcb};
use crate::time::Deadline;

/// The bootstrap fiber representing whatever stack called [`init`].
pub const MAIN_FIBER: FiberId = 0;

/// Aggregate scheduler statistics (spec §6 `ctrl(flag, …)`, SPEC_FULL §B.2).
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub new_count: usize,
    pub ready_count: usize,
    pub waiting_count: usize,
    pub suspended_count: usize,
    pub dead_count: usize,
    pub load_average: f64,
    pub favour_new: bool,
}

pub(crate) struct Runtime {
    fibers: RefCell<HashMap<FiberId, Rc<Tcb>>>,
    new_q: RefCell<Ring<FiberId>>,
    ready: RefCell<PriorityQueue>,
    waiting: RefCell<Ring<FiberId>>,
    suspended: RefCell<Ring<FiberId>>,
    dead: RefCell<Ring<FiberId>>,
    current: Cell<FiberId>,
    next_id: Cell<FiberId>,
    config: RuntimeConfig,
    favour_new: Cell<bool>,
    avload: Cell<f64>,
    last_sample: Cell<Deadline>,
    signal_pipe: RefCell<Option<(RawFd, RawFd)>>,
    registered_signals: RefCell<HashSet<libc::c_int>>,
}

thread_local! {
    static RUNTIME: RefCell<Option<Runtime>> = RefCell::new(None);
}

/// The write end of the signal-relay self-pipe (see `ensure_signal_relay`).
/// A plain process-wide static rather than thread-local state because the
/// only code that touches it is an async-signal-safe handler, which cannot
/// portably access TLS.
static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn relay_signal(sig: libc::c_int) {
    let fd = SIGNAL_WRITE_FD.load(AtomicOrdering::Relaxed);
    if fd >= 0 {
        let byte = sig as u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

fn with_runtime<R>(f: impl FnOnce(&Runtime) -> R) -> R {
    RUNTIME.with(|cell| {
        let guard = cell.borrow();
        let rt = guard
            .as_ref()
            .expect("pth runtime not initialized; call pth::init() first");
        f(rt)
    })
}

/// Initializes the runtime on the calling OS thread, turning the calling
/// stack into the `main` fiber. Idempotent: a second call while a runtime is
/// already live is a no-op, matching the teacher's own tolerant `init`.
pub fn init(config: RuntimeConfig) {
    RUNTIME.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_some() {
            return;
        }
        let main = Tcb::new(
            MAIN_FIBER,
            "main".to_string(),
            (crate::priority_queue::PRIO_MIN + crate::priority_queue::PRIO_MAX) / 2,
            Stack::loaned(),
            None,
            false,
            FiberState::Running,
        );
        let mut fibers = HashMap::new();
        fibers.insert(MAIN_FIBER, Rc::new(main));
        let favour_new = Cell::new(config.favour_new);
        *slot = Some(Runtime {
            fibers: RefCell::new(fibers),
            new_q: RefCell::new(Ring::new()),
            ready: RefCell::new(PriorityQueue::new()),
            waiting: RefCell::new(Ring::new()),
            suspended: RefCell::new(Ring::new()),
            dead: RefCell::new(Ring::new()),
            current: Cell::new(MAIN_FIBER),
            next_id: Cell::new(MAIN_FIBER + 1),
            config,
            favour_new,
            avload: Cell::new(0.0),
            last_sample: Cell::new(Deadline::now()),
            signal_pipe: RefCell::new(None),
            registered_signals: RefCell::new(HashSet::new()),
        });
        say_debug!("runtime initialized");
    });
}

pub fn is_initialized() -> bool {
    RUNTIME.with(|cell| cell.borrow().is_some())
}

/// Tears down the runtime. Any fiber other than `main` that is still alive
/// is simply dropped along with its stack; callers are expected to have
/// joined or left nothing of consequence running first.
pub fn kill() {
    RUNTIME.with(|cell| *cell.borrow_mut() = None);
}

pub fn stats() -> Stats {
    with_runtime(|rt| Stats {
        new_count: rt.new_q.borrow().len(),
        ready_count: rt.ready.borrow().len(),
        waiting_count: rt.waiting.borrow().len(),
        suspended_count: rt.suspended.borrow().len(),
        dead_count: rt.dead.borrow().len(),
        load_average: rt.avload.get(),
        favour_new: rt.favour_new.get(),
    })
}

/// Flips the new-fiber promotion policy (spec §4.2) at runtime, the
/// `ctrl`-style toggle spec §6 mentions alongside statistics.
pub(crate) fn set_favour_new(favour: bool) {
    with_runtime(|rt| rt.favour_new.set(favour));
}

impl Runtime {
    fn try_tcb(&self, id: FiberId) -> Option<Rc<Tcb>> {
        self.fibers.borrow().get(&id).cloned()
    }

    fn tcb(&self, id: FiberId) -> Rc<Tcb> {
        self.try_tcb(id)
            .unwrap_or_else(|| panic!("unknown fiber id {id}"))
    }
}

pub(crate) fn current() -> FiberId {
    with_runtime(|rt| rt.current.get())
}

pub(crate) fn tcb(id: FiberId) -> Rc<Tcb> {
    with_runtime(|rt| rt.tcb(id))
}

pub(crate) fn try_tcb(id: FiberId) -> Option<Rc<Tcb>> {
    with_runtime(|rt| rt.try_tcb(id))
}

/// Promotes `fiber` to the head of its current band without changing its
/// priority (spec §3 "favorite"), used by mutex ownership transfer so the
/// new owner is the next one dispatched among its peers.
pub(crate) fn favorite(fiber: FiberId) {
    with_runtime(|rt| {
        if rt.ready.borrow_mut().favorite(fiber) {
            say_debug!("fiber {} favorited", fiber);
        }
    });
}

/// Registers a new fiber in state `New`. Returns its id.
pub(crate) fn spawn_fiber(
    name: String,
    priority: i32,
    stack_size: usize,
    entry: Box<dyn FnOnce()>,
    joinable: bool,
) -> FiberId {
    with_runtime(|rt| {
        let id = rt.next_id.get();
        rt.next_id.set(id + 1);

        let size = if stack_size == 0 {
            rt.config.default_stack_size
        } else {
            stack_size
        };
        let stack = Stack::allocate(size);
        let mut ctx = MachineContext::fresh();
        unsafe { context::mctx_set(&mut ctx, fiber_trampoline, stack.hi) };

        let tcb = Tcb::new(id, name, priority, stack, Some(entry), joinable, FiberState::New);
        *tcb.ctx.borrow_mut() = ctx;

        rt.fibers.borrow_mut().insert(id, Rc::new(tcb));
        rt.new_q.borrow_mut().push_back(id);
        say_debug!("fiber {} spawned (New, prio {})", id, priority);
        id
    })
}

/// The first (and only) thing ever running on a freshly `mctx_set` stack:
/// runs the fiber's boxed entry closure, then terminates the fiber. A panic
/// inside the closure is caught so one misbehaving fiber can't bring down
/// the whole process — it is treated as an ordinary (uncancelled) death.
extern "C" fn fiber_trampoline() -> ! {
    let (id, entry) = with_runtime(|rt| {
        let id = rt.current.get();
        let t = rt.tcb(id);
        let entry = t.entry.borrow_mut().take();
        (id, entry)
    });

    if let Some(f) = entry {
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
            say_warn!("fiber {} panicked; terminating it like a normal exit", id);
        }
    }

    terminate_current(false);
}

/// A fiber's own code must not call a blocking primitive inside a
/// cancellation cleanup handler run during async cancellation; also used
/// for other "you called this from the wrong context" misuses that
/// aren't simple argument errors.
pub(crate) fn check_cancellation() {
    let me = current();
    let should_die = with_runtime(|rt| {
        let t = rt.tcb(me);
        let die = t.cancel_request.get() && t.cancel_state.get().enabled;
        if die {
            t.cancel_request.set(false);
        }
        die
    });
    if should_die {
        terminate_current(true);
    }
}

/// Voluntary suspension with no event attached (spec §6 `yield`). Unlike
/// `wait`, this is not itself a cancellation point (spec §4.7 lists only
/// explicit `cancel_point` and the blocking primitives).
pub fn yield_now() {
    schedule();
}

/// Suspends the current fiber until any event in `events` becomes
/// `Occurred`/`Failed`, returning the triggering event. A cancel point
/// before and after the suspension (spec §4.7).
pub(crate) fn wait(mut events: EventSet) -> Result<Rc<Event>> {
    check_cancellation();

    let me = current();
    if events.poll_immediate_all(me) {
        if let Some(ev) = events.triggering() {
            return Ok(ev.clone());
        }
    }

    with_runtime(|rt| {
        let t = rt.tcb(me);
        t.state.set(FiberState::Waiting);
        *t.awaited_events.borrow_mut() = Some(std::mem::take(&mut events));
        rt.waiting.borrow_mut().push_back(me);
    });

    schedule();

    check_cancellation();

    let t = tcb(me);
    let woke = t.awaited_events.borrow_mut().take().unwrap_or_default();
    woke.triggering().cloned().ok_or(Error::Interrupted)
}

/// Requests cancellation of `target` (spec §4.7). Deferred-mode targets are
/// just flagged for their next cancel point; an async-mode target that is
/// not the caller is torn down immediately.
pub(crate) fn request_cancel(target: FiberId) {
    with_runtime(|rt| {
        let Some(t) = rt.try_tcb(target) else { return };
        let state = t.cancel_state.get();
        if !state.enabled {
            t.cancel_request.set(true);
            return;
        }
        match state.mode {
            CancelMode::Deferred => {
                t.cancel_request.set(true);
                say_debug!("fiber {} flagged for deferred cancellation", target);
            }
            CancelMode::Async => {
                if target == rt.current.get() {
                    // Can't tear our own stack down from under this call;
                    // the very next cancel point will act on it instead.
                    t.cancel_request.set(true);
                } else {
                    say_debug!("fiber {} cancelled asynchronously", target);
                    terminate_fiber(rt, target, true);
                }
            }
        }
    });
}

pub(crate) fn suspend_fiber(id: FiberId) -> Result<()> {
    with_runtime(|rt| {
        let t = rt
            .try_tcb(id)
            .ok_or_else(|| Error::NotFound(format!("fiber {id}")))?;
        match t.state.get() {
            FiberState::New => {
                rt.new_q.borrow_mut().remove_first(|&x| x == id);
            }
            FiberState::Ready => {
                rt.ready.borrow_mut().remove(id);
            }
            FiberState::Waiting => {
                rt.waiting.borrow_mut().remove_first(|&x| x == id);
            }
            FiberState::Suspended => return Ok(()),
            FiberState::Running => {
                return Err(Error::InvalidState("cannot suspend the running fiber".into()))
            }
            FiberState::Dead => return Err(Error::InvalidState("fiber is dead".into())),
        }
        t.state.set(FiberState::Suspended);
        rt.suspended.borrow_mut().push_back(id);
        Ok(())
    })
}

pub(crate) fn resume_fiber(id: FiberId) -> Result<()> {
    with_runtime(|rt| {
        let t = rt
            .try_tcb(id)
            .ok_or_else(|| Error::NotFound(format!("fiber {id}")))?;
        if t.state.get() != FiberState::Suspended {
            return Ok(());
        }
        rt.suspended.borrow_mut().remove_first(|&x| x == id);
        t.state.set(FiberState::Ready);
        rt.ready.borrow_mut().insert(id, t.effective_priority());
        Ok(())
    })
}

/// Removes a joined, joinable-dead fiber from the registry. Called exactly
/// once by the joiner (spec §8 invariant: "A Dead joinable fiber is reaped
/// exactly once").
pub(crate) fn reap_joined(id: FiberId) {
    with_runtime(|rt| {
        rt.dead.borrow_mut().remove_first(|&x| x == id);
        rt.fibers.borrow_mut().remove(&id);
    });
}

fn terminate_fiber(rt: &Runtime, id: FiberId, canceled: bool) {
    let t = rt.tcb(id);

    loop {
        let handler = t.cleanup_stack.borrow_mut().pop();
        match handler {
            Some(h) => h(),
            None => break,
        }
    }
    crate::api::run_key_destructors(&t);
    crate::sync::mutex::release_all_held(&t);

    match t.state.get() {
        FiberState::New => {
            rt.new_q.borrow_mut().remove_first(|&x| x == id);
        }
        FiberState::Ready => {
            rt.ready.borrow_mut().remove(id);
        }
        FiberState::Waiting => {
            rt.waiting.borrow_mut().remove_first(|&x| x == id);
        }
        FiberState::Suspended => {
            rt.suspended.borrow_mut().remove_first(|&x| x == id);
        }
        FiberState::Running | FiberState::Dead => {}
    }

    t.canceled.set(canceled);
    t.state.set(FiberState::Dead);
    rt.dead.borrow_mut().push_back(id);
    say_debug!("fiber {} -> Dead (canceled={})", id, canceled);
}

pub(crate) fn terminate_current(canceled: bool) -> ! {
    let me = current();
    with_runtime(|rt| terminate_fiber(rt, me, canceled));
    schedule();
    unreachable!("a fiber whose state is Dead is never dispatched again");
}

// ---------------------------------------------------------------------
// Dispatch loop (spec §4.2)
// ---------------------------------------------------------------------

enum Action {
    StayHere,
    RunEventManager,
    SwitchTo(FiberId),
}

fn try_promote_one_new(rt: &Runtime) -> bool {
    if let Some(id) = rt.new_q.borrow_mut().pop_front() {
        let t = rt.tcb(id);
        t.state.set(FiberState::Ready);
        rt.ready.borrow_mut().insert(id, t.effective_priority());
        say_debug!("fiber {} promoted New -> Ready", id);
        true
    } else {
        false
    }
}

fn age_ready(rt: &Runtime) {
    let positions: Vec<(FiberId, u64)> = rt
        .ready
        .borrow()
        .iter_with_position()
        .map(|(pos, id)| (id, pos as u64))
        .collect();
    if positions.is_empty() {
        return;
    }
    for (id, pos) in &positions {
        if *pos > 0 {
            let t = rt.tcb(*id);
            t.dispatches.set(t.dispatches.get() + pos);
        }
    }
    // Dispatch counts changed; some fibers may have aged into a higher band,
    // so the whole queue is rebuilt from current effective priorities.
    let ids = rt.ready.borrow_mut().drain_all();
    let mut q = rt.ready.borrow_mut();
    for id in ids {
        let t = rt.tcb(id);
        q.insert(id, t.effective_priority());
    }
}

fn sample_avload(rt: &Runtime) {
    let now = Deadline::now();
    let elapsed = (now - rt.last_sample.get()).as_secs_f64().max(1e-3);
    rt.last_sample.set(now);
    let tau = rt.config.avload_smoothing.as_secs_f64().max(1e-3);
    let alpha = 1.0 - (-elapsed / tau).exp();
    let sample = rt.ready.borrow().len() as f64;
    let prev = rt.avload.get();
    rt.avload.set(prev + alpha * (sample - prev));
}

fn schedule() {
    loop {
        let action = with_runtime(|rt| -> Action {
            reap_detached_dead(rt);
            sample_avload(rt);

            if rt.favour_new.get() {
                try_promote_one_new(rt);
            }

            if rt.ready.borrow().is_empty() {
                if !rt.favour_new.get() {
                    try_promote_one_new(rt);
                }
                if rt.ready.borrow().is_empty() {
                    let nothing_waiting = rt.waiting.borrow().is_empty();
                    let nothing_new = rt.new_q.borrow().is_empty();
                    if nothing_waiting && nothing_new {
                        return Action::StayHere;
                    }
                    if !nothing_waiting {
                        return Action::RunEventManager;
                    }
                    // Only New fibers remain but promotion somehow found
                    // none (race-free in a single-threaded runtime, so this
                    // is unreachable in practice); fall through and retry.
                    return Action::StayHere;
                }
            }

            age_ready(rt);
            match rt.ready.borrow_mut().dequeue_max() {
                Some(id) => {
                    let t = rt.tcb(id);
                    t.dispatches.set(t.dispatches.get().saturating_sub(1));
                    Action::SwitchTo(id)
                }
                None => Action::StayHere,
            }
        });

        match action {
            Action::StayHere => return,
            Action::RunEventManager => {
                with_runtime(run_event_manager);
                continue;
            }
            Action::SwitchTo(id) => {
                switch_to(id);
                return;
            }
        }
    }
}

fn reap_detached_dead(rt: &Runtime) {
    // The fiber that just died is still `current` until the dispatch that
    // follows actually switches away from it; its `Tcb` has to survive that
    // final `switch_to` call, so skip it this cycle and reap it the next
    // time a (now different) fiber calls in here.
    let current = rt.current.get();
    let ids: Vec<FiberId> = rt.dead.borrow().iter().copied().collect();
    for id in ids {
        if id == current {
            continue;
        }
        let t = rt.tcb(id);
        if !t.joinable.get() {
            rt.dead.borrow_mut().remove_first(|&x| x == id);
            rt.fibers.borrow_mut().remove(&id);
            say_debug!("reaped detached fiber {}", id);
        }
    }
}

#[cfg(target_os = "linux")]
unsafe fn errno_location() -> *mut i32 {
    libc::__errno_location()
}

#[cfg(not(target_os = "linux"))]
unsafe fn errno_location() -> *mut i32 {
    libc::__error()
}

fn errno_get() -> i32 {
    unsafe { *errno_location() }
}

fn errno_set(v: i32) {
    unsafe { *errno_location() = v };
}

fn switch_to(next_id: FiberId) {
    let (from_ptr, to_ptr, next_errno) = with_runtime(|rt| {
        let prev_id = rt.current.get();
        let prev = rt.tcb(prev_id);
        let next = rt.tcb(next_id);

        prev.errno.set(errno_get());
        let now = Deadline::now();
        prev.last_ran_at.set(Some(now));
        if let Some(started) = prev.running_since.take() {
            prev.cumulative_running.set(prev.cumulative_running.get() + (now - started));
        }

        // A fiber that suspended itself via `schedule()` without first
        // setting a terminal/waiting state (a plain yield) is still
        // logically Ready; put it back on the queue.
        if prev.state.get() == FiberState::Running {
            prev.state.set(FiberState::Ready);
            rt.ready.borrow_mut().insert(prev_id, prev.effective_priority());
        }

        next.state.set(FiberState::Running);
        next.running_since.set(Some(now));
        rt.current.set(next_id);

        (prev.ctx.as_ptr(), next.ctx.as_ptr() as *const MachineContext, next.errno.get())
    });

    errno_set(next_errno);

    unsafe {
        context::mctx_switch(from_ptr, to_ptr);
    }

    // Resumed: some later switch brought this fiber back. Check its stack
    // guard (spec §7) before doing anything else with it.
    with_runtime(|rt| {
        let me = rt.current.get();
        let t = rt.tcb(me);
        if !t.stack.guard_intact() {
            say_error!("stack guard corrupted for fiber {}; aborting", me);
            std::process::abort();
        }
    });
}

// ---------------------------------------------------------------------
// Event manager (spec §4.2.1)
// ---------------------------------------------------------------------

fn fd_goal_to_poll_events(goal: FdGoal) -> libc::c_short {
    match goal {
        FdGoal::Readable => libc::POLLIN,
        FdGoal::Writable => libc::POLLOUT,
        FdGoal::Exception => libc::POLLPRI,
    }
}

fn fd_goal_matches(goal: FdGoal, revents: libc::c_short) -> bool {
    revents & fd_goal_to_poll_events(goal) != 0
}

unsafe fn set_nonblocking(fd: RawFd) {
    let flags = libc::fcntl(fd, libc::F_GETFL);
    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
}

fn ensure_signal_relay(rt: &Runtime, sig: libc::c_int) {
    {
        let mut pipe = rt.signal_pipe.borrow_mut();
        if pipe.is_none() {
            let mut fds = [0 as RawFd; 2];
            let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
            if rc != 0 {
                say_warn!(
                    "failed to create signal-relay pipe: {}",
                    std::io::Error::last_os_error()
                );
                return;
            }
            unsafe {
                set_nonblocking(fds[0]);
                set_nonblocking(fds[1]);
            }
            SIGNAL_WRITE_FD.store(fds[1], AtomicOrdering::Relaxed);
            *pipe = Some((fds[0], fds[1]));
        }
    }
    let mut registered = rt.registered_signals.borrow_mut();
    if registered.insert(sig) {
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = relay_signal as usize;
            libc::sigemptyset(&mut sa.sa_mask);
            sa.sa_flags = 0;
            libc::sigaction(sig, &sa, std::ptr::null_mut());
        }
        say_debug!("installed signal relay for signal {}", sig);
    }
}

#[cfg(target_os = "linux")]
fn block_on_poll(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> libc::c_int {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: libc::c_long::from(d.subsec_nanos() as i32),
    });
    let ts_ptr = ts.as_ref().map_or(std::ptr::null(), |t| t as *const libc::timespec);
    unsafe { libc::ppoll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, ts_ptr, std::ptr::null()) }
}

/// Without `ppoll`, a signal delivered during the wait is only observed at
/// ordinary `poll` granularity rather than atomically unmasked for exactly
/// the call's duration; acceptable since the self-pipe still catches it on
/// the next pass.
#[cfg(not(target_os = "linux"))]
fn block_on_poll(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> libc::c_int {
    let millis = timeout.map_or(-1, |d| d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int);
    unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis) }
}

struct Watch {
    event: Rc<Event>,
    fd: RawFd,
    goal: FdGoal,
}

/// Invoked whenever `Ready` is empty and at least one fiber is `Waiting`.
/// Classifies every waiting fiber's events, blocks in one `ppoll`/`poll`
/// covering every pending fd and the earliest timer, then wakes everything
/// whose event fired.
fn run_event_manager(rt: &Runtime) {
    let waiting_ids: Vec<FiberId> = rt.waiting.borrow().iter().copied().collect();
    say_debug!("event manager: {} fiber(s) waiting", waiting_ids.len());

    let mut watches: Vec<Watch> = Vec::new();
    let mut signals_needed: HashSet<libc::c_int> = HashSet::new();
    let mut min_deadline: Option<Deadline> = None;
    let mut any_immediate = false;

    for &fid in &waiting_ids {
        let t = rt.tcb(fid);
        let guard = t.awaited_events.borrow();
        let Some(set) = guard.as_ref() else { continue };
        for ev in set.iter_rc() {
            any_immediate |= ev.poll_immediate(fid);
            if ev.status() != Status::Pending {
                // Already resolved, whether just now by `poll_immediate` or
                // earlier out-of-band (e.g. `Cond::notify` flipping another
                // fiber's event directly) — either way the wait shouldn't
                // block, so this counts the same as an immediate hit.
                any_immediate = true;
                continue;
            }
            match &ev.kind {
                Kind::Fd { fd, goal } => watches.push(Watch {
                    event: ev.clone(),
                    fd: *fd,
                    goal: *goal,
                }),
                Kind::Select { fds, .. } => {
                    for &(fd, goal) in fds {
                        watches.push(Watch {
                            event: ev.clone(),
                            fd,
                            goal,
                        });
                    }
                }
                Kind::Sigs { signals, .. } => {
                    signals_needed.extend(signals.iter().copied());
                }
                Kind::Time { deadline } => {
                    min_deadline = crate::time::earliest(min_deadline, Some(*deadline));
                }
                Kind::Func { next_poll, .. } => {
                    min_deadline = crate::time::earliest(min_deadline, Some(next_poll.get()));
                }
                Kind::Mutex(_) | Kind::Cond(_) | Kind::Msg(_) | Kind::Tid { .. } => {}
            }
        }
    }

    for &sig in &signals_needed {
        ensure_signal_relay(rt, sig);
    }
    let sigpipe_read = rt.signal_pipe.borrow().map(|(r, _)| r);

    let mut pollfds: Vec<libc::pollfd> = watches
        .iter()
        .map(|w| libc::pollfd {
            fd: w.fd,
            events: fd_goal_to_poll_events(w.goal),
            revents: 0,
        })
        .collect();
    let sigpipe_idx = sigpipe_read.map(|fd| {
        pollfds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
        pollfds.len() - 1
    });

    // `max_poll_interval` bounds every wait, even with no timer pending, so
    // load-average sampling keeps advancing (spec §6).
    let timeout = if any_immediate {
        Duration::ZERO
    } else {
        min_deadline
            .map(|d| d.remaining())
            .unwrap_or(rt.config.max_poll_interval)
            .min(rt.config.max_poll_interval)
    };

    let n = block_on_poll(&mut pollfds, Some(timeout));
    if n < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            say_warn!("event manager poll failed: {}", err);
        }
    }

    let mut fired_signals: Vec<libc::c_int> = Vec::new();
    if let Some(idx) = sigpipe_idx {
        if pollfds[idx].revents & libc::POLLIN != 0 {
            if let Some((read_fd, _)) = *rt.signal_pipe.borrow() {
                let mut buf = [0u8; 64];
                loop {
                    let n = unsafe {
                        libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                    };
                    if n <= 0 {
                        break;
                    }
                    fired_signals.extend(buf[..n as usize].iter().map(|&b| b as libc::c_int));
                }
            }
        }
    }

    for (watch, pfd) in watches.iter().zip(pollfds.iter()) {
        if pfd.revents == 0 {
            continue;
        }
        if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            watch.event.status.set(Status::Failed);
            continue;
        }
        if fd_goal_matches(watch.goal, pfd.revents) {
            if let Kind::Select { ready, .. } = &watch.event.kind {
                ready.borrow_mut().push((watch.fd, watch.goal));
            }
            watch.event.status.set(Status::Occurred);
        }
    }

    if !fired_signals.is_empty() {
        for &fid in &waiting_ids {
            let t = rt.tcb(fid);
            let guard = t.awaited_events.borrow();
            let Some(set) = guard.as_ref() else { continue };
            for ev in set.iter_rc() {
                if let Kind::Sigs { signals, fired } = &ev.kind {
                    if let Some(&sig) = signals.iter().find(|s| fired_signals.contains(s)) {
                        fired.set(Some(sig));
                        ev.status.set(Status::Occurred);
                    }
                }
            }
        }
    }

    // A timer may have elapsed while we were blocked on unrelated fds.
    for &fid in &waiting_ids {
        let t = rt.tcb(fid);
        let guard = t.awaited_events.borrow();
        if let Some(set) = guard.as_ref() {
            set.poll_immediate_all(fid);
        }
    }

    for fid in waiting_ids {
        let t = rt.tcb(fid);
        let guard = t.awaited_events.borrow();
        let triggered_by_mutex = guard
            .as_ref()
            .and_then(EventSet::triggering)
            .map(|ev| matches!(ev.kind, Kind::Mutex(_)))
            .unwrap_or(false);
        let woke = guard.as_ref().map(EventSet::any_occurred).unwrap_or(false);
        drop(guard);
        if woke {
            rt.waiting.borrow_mut().remove_first(|&x| x == fid);
            t.state.set(FiberState::Ready);
            rt.ready.borrow_mut().insert(fid, t.effective_priority());
            if triggered_by_mutex {
                // Ownership just transferred to this fiber (spec §3
                // "favorite"): put it at the head of its band so it's the
                // next one dispatched among its peers, instead of letting
                // it wait behind other fibers already queued in that band.
                favorite(fid);
            }
            say_debug!("fiber {} Waiting -> Ready", fid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    fn reset() {
        kill();
        init(RuntimeConfig::default());
    }

    #[test]
    fn spawn_and_yield_runs_both_fibers_to_completion() {
        reset();
        let trace = StdRc::new(StdRefCell::new(Vec::new()));
        let t1 = trace.clone();
        let id = spawn_fiber(
            "worker".into(),
            crate::priority_queue::PRIO_MIN,
            64 * 1024,
            Box::new(move || {
                t1.borrow_mut().push("worker-start");
                yield_now();
                t1.borrow_mut().push("worker-end");
            }),
            false,
        );
        assert_ne!(id, MAIN_FIBER);

        // Drive the scheduler until the spawned fiber has run to completion.
        for _ in 0..8 {
            yield_now();
        }

        assert_eq!(*trace.borrow(), vec!["worker-start", "worker-end"]);
        kill();
    }

    #[test]
    fn wait_on_an_already_elapsed_timer_returns_immediately() {
        reset();
        let set = EventSet::single(Event::time(Deadline::now()));
        let triggering = wait(set).expect("timer already elapsed");
        assert!(matches!(triggering.kind, Kind::Time { .. }));
        kill();
    }
}
