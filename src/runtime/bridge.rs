//! Synchronous waiting on the owning thread.
//!
//! An `AsyncBridge` lets code already running on (or driving) a
//! reactor's thread await a single asynchronous operation without
//! parking the thread: it keeps dispatching queued tasks one at a time
//! until the operation's completion flag is raised or the reactor is
//! stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::runtime::Reactor;

/// Bridges one async operation to a synchronous wait.
#[derive(Debug, Clone)]
pub struct AsyncBridge {
    complete: Arc<AtomicBool>,
    reactor: Arc<Reactor>,
}

impl AsyncBridge {
    /// Creates a bridge over `reactor`.
    #[must_use]
    pub fn new(reactor: Arc<Reactor>) -> Self {
        Self {
            complete: Arc::new(AtomicBool::new(false)),
            reactor,
        }
    }

    /// Marks the operation complete and nudges the waiting loop.
    ///
    /// The empty post is what wakes a [`wait`](Self::wait) that is
    /// blocked inside `run_one` with nothing else queued.
    pub fn complete(&self) {
        self.complete.store(true, Ordering::Release);
        self.reactor.post(|| {});
    }

    /// Dispatches tasks on the calling thread until the operation
    /// completes or the reactor stops.
    ///
    /// Must run on the reactor's owning thread (it binds the thread on
    /// first use, same as [`Reactor::run_one`]).
    pub fn wait(&self) {
        loop {
            self.reactor.run_one();
            if self.complete.load(Ordering::Acquire) || self.reactor.is_stopped() {
                break;
            }
        }
    }

    /// Whether the wait ended because the reactor stopped rather than
    /// because the operation completed.
    #[must_use]
    pub fn exited_because_stopped(&self) -> bool {
        self.reactor.is_stopped()
    }
}
