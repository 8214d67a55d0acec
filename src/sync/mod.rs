//! Synchronization primitives layered on the event system (spec §4.4).
//!
//! Every primitive here follows the same shape: a small non-generic `*Inner`
//! type holds the actual state and implements [`crate::event::EventSource`]
//! so the scheduler's event manager can poll it without knowing anything
//! about the `T` a generic wrapper (`Mutex<T>`, guards, …) carries. This
//! mirrors the teacher's split between `fiber::mutex::Latch` (untyped) and
//! `Mutex<T>`/`MutexGuard<T>` (the typed RAII layer on top).

pub mod barrier;
pub mod cond;
pub mod mutex;
pub mod once;
pub mod rwlock;

pub use barrier::{Barrier, BarrierArrival};
pub use cond::Cond;
pub use mutex::{Mutex, MutexGuard};
pub use once::Once;
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
