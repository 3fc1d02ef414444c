//! The qutex locking stack.
//!
//! Three layers, bottom-up:
//!
//! - [`SpinLock`]: short-critical-section mutual exclusion. Guards qutex
//!   internals and the acquisition history tracker, both of which are
//!   touched from multiple reactor threads.
//! - [`Qutex`]: a mutex-like object with an internal FIFO of waiters and
//!   a positional acquisition rule. Waiters never block a thread; a
//!   failed acquisition leaves them queued until a release wakes them.
//! - [`LockSet`]: the ordered group of qutexes one continuation must
//!   acquire as a unit, with all-or-nothing acquisition and backoff.

mod lock_set;
mod qutex;
mod spin;

pub use lock_set::LockSet;
pub use qutex::{Qutex, Waiter, WaiterHandle};
pub use spin::{SpinGuard, SpinLock};
