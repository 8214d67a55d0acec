//! Fork integration (spec §4.8, component K).
//!
//! `fork(2)` duplicates the whole process, including every fiber's stack
//! and machine context as the kernel sees them — but only the calling
//! fiber's context switch will ever resume in the child; every other
//! fiber's saved registers describe a context switch that is never coming
//! back. `atfork_push` lets a caller register prepare/parent/child hooks
//! the way `pthread_atfork` does, and [`fork`] itself reinitializes the
//! scheduler in the child so it starts from one bootstrap fiber instead of
//! a frozen, unreachable snapshot of the parent's.

use std::cell::RefCell;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::scheduler;

type Hook = Box<dyn FnMut()>;

struct HookRecord {
    prepare: Option<Hook>,
    parent: Option<Hook>,
    child: Option<Hook>,
}

thread_local! {
    static HOOKS: RefCell<Vec<HookRecord>> = RefCell::new(Vec::new());
}

/// Identifies a hook set registered with [`atfork_push`], for [`atfork_pop`].
pub type HookId = usize;

/// Registers handlers to run around [`fork`] (spec §4.8): `prepare` just
/// before the OS fork, `parent` just after in the parent, `child` just
/// after in the child. Any of the three may be `None`.
pub fn atfork_push(
    prepare: Option<Box<dyn FnMut()>>,
    parent: Option<Box<dyn FnMut()>>,
    child: Option<Box<dyn FnMut()>>,
) -> HookId {
    HOOKS.with(|hooks| {
        let mut hooks = hooks.borrow_mut();
        hooks.push(HookRecord {
            prepare,
            parent,
            child,
        });
        hooks.len() - 1
    })
}

/// Unregisters a hook set so it no longer runs on the next `fork`. Past
/// calls (if `id` has already fired) are unaffected.
pub fn atfork_pop(id: HookId) {
    HOOKS.with(|hooks| {
        let mut hooks = hooks.borrow_mut();
        if let Some(rec) = hooks.get_mut(id) {
            *rec = HookRecord {
                prepare: None,
                parent: None,
                child: None,
            };
        }
    });
}

/// Which side of the fork the caller is now running as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkResult {
    Parent(libc::pid_t),
    Child,
}

/// Forks the process (spec §4.8). Runs every registered `prepare` handler
/// LIFO, calls the real `fork(2)`, then runs `parent` handlers FIFO in the
/// parent or `child` handlers FIFO in the child.
///
/// The child additionally drops every fiber but the caller and
/// reinitializes the scheduler: the caller becomes the sole bootstrap
/// fiber of a brand new runtime, exactly as if it had just called
/// [`crate::scheduler::init`] on a fresh OS thread.
pub fn fork() -> Result<ForkResult> {
    HOOKS.with(|hooks| {
        for rec in hooks.borrow_mut().iter_mut().rev() {
            if let Some(p) = rec.prepare.as_mut() {
                p();
            }
        }
    });

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    if pid == 0 {
        scheduler::kill();
        scheduler::init(RuntimeConfig::default());
        HOOKS.with(|hooks| {
            for rec in hooks.borrow_mut().iter_mut() {
                if let Some(c) = rec.child.as_mut() {
                    c();
                }
            }
        });
        Ok(ForkResult::Child)
    } else {
        HOOKS.with(|hooks| {
            for rec in hooks.borrow_mut().iter_mut() {
                if let Some(p) = rec.parent.as_mut() {
                    p();
                }
            }
        });
        Ok(ForkResult::Parent(pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn atfork_pop_prevents_a_hook_from_firing() {
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        let id = atfork_push(Some(Box::new(move || r.set(true))), None, None);
        atfork_pop(id);
        HOOKS.with(|hooks| {
            for rec in hooks.borrow_mut().iter_mut() {
                if let Some(p) = rec.prepare.as_mut() {
                    p();
                }
            }
        });
        assert!(!ran.get());
    }
}
