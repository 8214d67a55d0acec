//! Machine context switching (spec §4.1).
//!
//! `mctx_set` prepares a fresh [`MachineContext`] so that switching to it for
//! the first time begins executing a trampoline on the given stack;
//! `mctx_switch` saves the calling fiber's callee-saved registers and stack
//! pointer, restores the target's, and returns (to the caller's point of view
//! execution merely "resumes later" when someone switches back).
//!
//! Only the callee-saved register set and the stack pointer are preserved —
//! exactly what the System V / AAPCS64 calling conventions already guarantee
//! a callee must restore for its caller, which is why a `ret`-based switch
//! (rather than a real function call into the new fiber) is enough to resume
//! it. No allocation, no syscalls happen on the switch path, matching spec
//! §4.1(b).
//!
//! `errno` is not part of the machine context here: on this platform
//! `errno` already lives in thread-local storage private to the OS thread,
//! and all fibers in this runtime share that one OS thread, so each fiber
//! would otherwise see whichever fiber last touched `errno`. [`Tcb`] instead
//! carries its own `errno` slot and the scheduler saves/restores the libc
//! `errno` around every switch (see `scheduler::switch_to`), which is the
//! Rust-idiomatic reading of spec §4.1's "`errno` must be saved/restored
//! across switches" and avoids hand-rolling per-fiber TLS.
//!
//! [`Tcb`]: crate::tcb::Tcb

#[cfg(target_arch = "x86_64")]
#[path = "x86_64.rs"]
mod arch;

#[cfg(target_arch = "aarch64")]
#[path = "aarch64.rs"]
mod arch;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("pth's fiber context switch is only implemented for x86_64 and aarch64");

pub use arch::MachineContext;

/// Minimum stack size we'll accept; below this the prepared frame plus a
/// reasonable amount of fiber-body stack wouldn't fit.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Prepares `ctx` so that switching to it begins execution in `trampoline`
/// on the stack spanning `[stack_lo, stack_hi)`. `trampoline` is expected to
/// never return (spec §4.1(a): "the return address slot must be nil so an
/// accidental return traps").
///
/// # Safety
/// `stack_lo..stack_hi` must be a valid, exclusively-owned memory region that
/// outlives every future switch into this context.
pub unsafe fn mctx_set(ctx: &mut MachineContext, trampoline: extern "C" fn() -> !, stack_hi: *mut u8) {
    arch::mctx_set(ctx, trampoline, stack_hi)
}

/// Saves the currently running fiber's machine state into `from`, restores
/// `to`'s, and switches the stack pointer. Returns once some later call
/// switches back into `from`.
///
/// # Safety
/// Both contexts must have been initialized by [`mctx_set`] (or be the
/// context of a fiber that is currently running), and must not be
/// concurrently switched into from another context (there is only one OS
/// thread, so "concurrently" here just means "re-entrantly").
pub unsafe fn mctx_switch(from: *mut MachineContext, to: *const MachineContext) {
    arch::mctx_switch(from, to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    thread_local! {
        static SWITCH_BACK: Cell<*mut MachineContext> = Cell::new(std::ptr::null_mut());
        static STEP: Cell<u32> = Cell::new(0);
    }

    extern "C" fn trampoline() -> ! {
        STEP.with(|s| s.set(s.get() + 1));
        let back = SWITCH_BACK.with(|b| b.get());
        // Switch back to the caller; this context is never resumed again in
        // this test so we don't need a context to save into.
        let mut discard = MachineContext::fresh();
        unsafe { mctx_switch(&mut discard, back) };
        unreachable!("fiber context must never be resumed after the test ends");
    }

    #[test]
    fn switch_into_fresh_context_runs_trampoline_then_returns() {
        let mut stack = vec![0u8; 256 * 1024];
        let stack_hi = unsafe { stack.as_mut_ptr().add(stack.len()) };
        let mut fiber_ctx = MachineContext::fresh();
        unsafe { mctx_set(&mut fiber_ctx, trampoline, stack_hi) };

        let mut main_ctx = MachineContext::fresh();
        SWITCH_BACK.with(|b| b.set(&mut main_ctx as *mut _));
        STEP.with(|s| s.set(0));

        unsafe { mctx_switch(&mut main_ctx, &fiber_ctx) };

        assert_eq!(STEP.with(|s| s.get()), 1);
    }
}
