//! Queue-based mutual exclusion for cooperatively-scheduled reactors.
//!
//! Spinqueue coordinates asynchronous continuations running on
//! single-threaded event loops ("reactors") through *qutexes*: mutex-like
//! objects that keep a FIFO of waiters and decide acquisition by queue
//! position. A continuation that needs several qutexes declares them as a
//! [`LockSet`](sync::LockSet) and acquires the whole set atomically; when
//! the set cannot be taken, the attempt backs off, rotates the queues it
//! touched, and goes back to sleep until a release wakes it. No physical
//! thread ever blocks on a qutex.
//!
//! # Architecture
//!
//! The crate is layered strictly bottom-up:
//!
//! - [`sync::SpinLock`]: short-critical-section mutual exclusion guarding
//!   qutex internals and the acquisition tracker.
//! - [`sync::Qutex`]: the queue-based mutex with the positional
//!   acquisition rule.
//! - [`sync::LockSet`]: a group of qutexes acquired as a unit.
//! - [`chain`]: continuation nodes, the caller chain, and the
//!   [`Lockvoker`](chain::Lockvoker) task that retries acquisition.
//! - [`runtime`]: the single-threaded FIFO [`Reactor`](runtime::Reactor)
//!   and its helpers.
//! - [`detect`]: the same-chain deadlock check and the cross-chain
//!   gridlock (circular dependency) detector.
//!
//! # Progress
//!
//! The positional rule is what keeps arbitrarily many contending lock
//! sets moving: a waiter that needs a single qutex must be first in that
//! qutex's queue, while a waiter that needs `S` qutexes only has to sit in
//! the leading `(S-1)/S` fraction of each queue. Combined with the
//! backoff rotation this breaks the symmetric NxN stalls where every
//! contender holds one lock and waits on another.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use spinqueue::{Callback, Qutex, Reactor, SerializedContinuation};
//!
//! let reactor = Reactor::spawn("worker");
//! let accounts = Arc::new(Qutex::new("accounts"));
//! let ledger = Arc::new(Qutex::new("ledger"));
//!
//! SerializedContinuation::spawn(
//!     &reactor,
//!     Callback::new(|| println!("transfer booked")),
//!     vec![accounts.clone(), ledger.clone()],
//!     &reactor,
//!     |cont| {
//!         // Both qutexes are held here; no other gated body can run.
//!         cont.call_original_cb();
//!     },
//! );
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod chain;
pub mod config;
pub mod detect;
pub mod error;
pub mod runtime;
pub mod sync;
pub mod test_logging;

pub use chain::{Callback, ChainLink, Continuation, ContinuationId, Lockvoker, SerializedContinuation};
pub use error::ChainError;
pub use runtime::{AsyncBridge, AsyncLoop, Reactor};
pub use sync::{LockSet, Qutex, SpinLock, Waiter, WaiterHandle};
