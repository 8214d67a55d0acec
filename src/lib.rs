//! A portable, user-space cooperative fiber runtime.
//!
//! This crate multiplexes many lightweight execution contexts ("fibers") on
//! top of a single OS thread. Each fiber owns its own stack and runs to a
//! voluntary suspension point — a `yield`, a `sleep`, a blocking I/O call,
//! acquiring a [`sync::Mutex`], waiting on a [`sync::Cond`], receiving from
//! a [`msgport::MsgPort`] — at which point [`scheduler::wait`] builds an
//! [`event::EventSet`] and hands control back to a central dispatcher. No
//! fiber ever runs in parallel with another; the scheduling model is
//! entirely cooperative, the same shape GNU Pth's `pth_*` API describes.
//!
//! # Getting started
//!
//! ```no_run
//! pth::init(pth::config::RuntimeConfig::default());
//!
//! let handle = pth::spawn(|| {
//!     pth::yield_now();
//!     42
//! });
//! assert_eq!(handle.join().unwrap(), 42);
//!
//! pth::kill();
//! ```
//!
//! # Layout
//!
//! - [`time`], [`ring`], [`priority_queue`] — the small leaf utilities
//!   everything else is built from.
//! - [`context`] — the assembly-level machine-context switch.
//! - [`tcb`] — the fiber descriptor.
//! - [`event`] — the typed, OR-composed event rings underlying every
//!   blocking call.
//! - [`scheduler`] — the dispatcher and event manager.
//! - [`sync`] — mutex, cond, rwlock, barrier, once.
//! - [`msgport`] — named mailboxes.
//! - [`io`] — fiber-safe non-blocking I/O wrappers.
//! - [`api`] — `spawn`/`join`/`cancel`/keys/the rest of the public surface,
//!   re-exported at the crate root.
//! - [`fork`] — `fork(2)` integration.

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod fork;
pub mod io;
pub(crate) mod log;
pub mod msgport;
pub mod priority_queue;
pub mod ring;
pub mod scheduler;
pub mod sync;
pub mod tcb;
pub mod time;

pub use api::*;
pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use event::{Event, EventSet, EventSource, FdGoal, Kind as EventKind, Status as EventStatus};
pub use scheduler::{init, is_initialized, kill, MAIN_FIBER};
pub use tcb::{CancelMode, CancelState, FiberId};
