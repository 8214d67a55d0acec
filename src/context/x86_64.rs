//! x86_64 (System V ABI) machine context.
//!
//! Callee-saved registers per the ABI are `rbx`, `rbp`, `r12`-`r15` and the
//! stack pointer itself; everything else is caller-saved and the compiler
//! already spills what it needs around the call to [`mctx_switch`]. We push
//! the callee-saved set onto the fiber's own stack and just remember `rsp` —
//! the same trick used by `boost::context`/`libco`-style switchers: a fresh
//! context's stack is pre-loaded with a register frame that unwinds straight
//! into the trampoline via `ret`.

use std::arch::global_asm;

#[repr(C)]
pub struct MachineContext {
    /// Stack pointer at the point execution was suspended. Everything else
    /// (the callee-saved registers) lives *on* the stack `rsp` points into.
    rsp: u64,
}

impl MachineContext {
    /// An empty context. Only valid as a "from" context for a switch that
    /// will immediately be switched back into (see the scheduler's initial
    /// hand-off into the scheduler fiber), or as a placeholder that is never
    /// switched into.
    pub fn fresh() -> Self {
        MachineContext { rsp: 0 }
    }
}

global_asm!(
    ".text",
    ".global pth_mctx_switch",
    ".p2align 4",
    "pth_mctx_switch:",
    // rdi = *mut u64 (from.rsp), rsi = *const u64 (to.rsp)
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, [rsi]",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

extern "C" {
    fn pth_mctx_switch(from: *mut u64, to: *const u64);
}

pub unsafe fn mctx_switch(from: *mut super::MachineContext, to: *const super::MachineContext) {
    pth_mctx_switch(&mut (*from).rsp, &(*to).rsp);
}

pub unsafe fn mctx_set(
    ctx: &mut super::MachineContext,
    trampoline: extern "C" fn() -> !,
    stack_hi: *mut u8,
) {
    // 16-byte align the top of the stack, matching the guarantee a `call`
    // instruction's caller provides.
    let aligned_hi = (stack_hi as usize & !0xf) as *mut u8;

    // Layout, high to low addresses:
    //   [aligned_hi - 8]  return address = trampoline   <- popped by final `ret`
    //   [aligned_hi - 16] r15 = 0
    //   [aligned_hi - 24] r14 = 0
    //   [aligned_hi - 32] r13 = 0
    //   [aligned_hi - 40] r12 = 0
    //   [aligned_hi - 48] rbx = 0
    //   [aligned_hi - 56] rbp = 0   <- rsp lands here
    let frame = aligned_hi.sub(56) as *mut u64;
    std::ptr::write(frame.add(0), 0); // rbp
    std::ptr::write(frame.add(1), 0); // rbx
    std::ptr::write(frame.add(2), 0); // r12
    std::ptr::write(frame.add(3), 0); // r13
    std::ptr::write(frame.add(4), 0); // r14
    std::ptr::write(frame.add(5), 0); // r15
    std::ptr::write(frame.add(6), trampoline as usize as u64); // return address

    ctx.rsp = frame as u64;
}
