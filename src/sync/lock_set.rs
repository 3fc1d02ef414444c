//! Atomic acquisition of a group of qutexes.
//!
//! A `LockSet` owns the ordered list of qutexes one continuation must
//! hold before its body may run. Acquisition is all-or-nothing: the set
//! walks its qutexes in declaration order and, on the first failure,
//! backs off every qutex it took in this attempt so contenders can make
//! progress.
//!
//! The set is single-owner: its parent continuation mutates it only on
//! the owning reactor thread. There is no unregister-on-abandon path; a
//! waiter that never manages to acquire its set stays queued until the
//! process terminates.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::trace;

use crate::sync::{Qutex, Waiter, WaiterHandle};

/// One qutex the set must acquire, with its queue slot and early-release
/// marker.
#[derive(Debug)]
struct LockUsage {
    qutex: Arc<Qutex>,
    /// Valid iff the set has registered in the queues.
    handle: Option<WaiterHandle>,
    released_early: bool,
}

/// The ordered set of qutexes a continuation acquires as a unit.
#[derive(Debug)]
pub struct LockSet {
    locks: SmallVec<[LockUsage; 4]>,
    all_acquired: bool,
    registered_in_queues: bool,
}

impl LockSet {
    /// Builds a set over `qutexes`; the order given here is the
    /// try-acquire order.
    #[must_use]
    pub fn new(qutexes: Vec<Arc<Qutex>>) -> Self {
        Self {
            locks: qutexes
                .into_iter()
                .map(|qutex| LockUsage {
                    qutex,
                    handle: None,
                    released_early: false,
                })
                .collect(),
            all_acquired: false,
            registered_in_queues: false,
        }
    }

    /// Number of qutexes in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Whether the most recent acquisition attempt took every qutex and
    /// no release has run since.
    #[must_use]
    pub fn all_acquired(&self) -> bool {
        self.all_acquired
    }

    /// Whether `qutex` is a member of this set.
    #[must_use]
    pub fn contains(&self, qutex: &Arc<Qutex>) -> bool {
        self.locks
            .iter()
            .any(|usage| Arc::ptr_eq(&usage.qutex, qutex))
    }

    /// Snapshot of the member qutexes, in declaration order.
    #[must_use]
    pub fn qutexes(&self) -> Vec<Arc<Qutex>> {
        self.locks.iter().map(|usage| usage.qutex.clone()).collect()
    }

    /// Registers `waiter` in every member qutex's queue, recording the
    /// returned slot handles.
    ///
    /// Must be called exactly once per set, before any acquisition
    /// attempt.
    ///
    /// # Panics
    ///
    /// Panics on a second call.
    pub fn register_in_queues(&mut self, waiter: &Arc<dyn Waiter>) {
        assert!(
            !self.registered_in_queues,
            "register_in_queues called twice on the same lock set",
        );
        for usage in &mut self.locks {
            usage.handle = Some(usage.qutex.register_in_queue(waiter.clone()));
        }
        self.registered_in_queues = true;
    }

    /// Erases this set's waiter from every member qutex's queue.
    ///
    /// Called after a successful acquisition: holding the locks makes
    /// queue position meaningless, and vacating the slots shortens every
    /// contender's queue.
    ///
    /// # Panics
    ///
    /// Panics if the set never registered.
    pub fn unregister_from_queues(&mut self) {
        assert!(
            self.registered_in_queues,
            "unregister_from_queues called on a lock set that never registered",
        );
        for usage in &mut self.locks {
            let handle = usage
                .handle
                .take()
                .expect("lock usage is missing its queue slot handle");
            usage.qutex.unregister_from_queue(handle);
        }
    }

    /// Tries to acquire every member in declaration order.
    ///
    /// On the first refusal the qutexes already taken in this attempt are
    /// backed off in reverse order and the refusing qutex is returned as
    /// the error value.
    ///
    /// # Panics
    ///
    /// Panics if the set never registered, or if the set is already
    /// fully acquired.
    pub fn try_acquire_or_back_off(&mut self, waiter: &dyn Waiter) -> Result<(), Arc<Qutex>> {
        assert!(
            self.registered_in_queues,
            "try_acquire_or_back_off called on a lock set that never registered",
        );
        assert!(
            !self.all_acquired,
            "try_acquire_or_back_off called while the set is already fully acquired",
        );

        let n_required = self.locks.len();
        let mut first_failed = None;
        let mut n_acquired = 0;
        for usage in &self.locks {
            if !usage.qutex.try_acquire(waiter, n_required) {
                first_failed = Some(usage.qutex.clone());
                break;
            }
            n_acquired += 1;
        }

        if let Some(failed) = first_failed {
            for usage in self.locks[..n_acquired].iter().rev() {
                usage.qutex.backoff(waiter, n_required);
            }
            trace!(
                failed = %failed.name(),
                acquired_before_failure = n_acquired,
                "lock set acquisition failed"
            );
            return Err(failed);
        }

        self.all_acquired = true;
        trace!(locks = n_required, "lock set fully acquired");
        Ok(())
    }

    /// Releases every member that was not already released early.
    ///
    /// # Panics
    ///
    /// Panics if the set never registered or is not fully acquired.
    pub fn release(&mut self) {
        assert!(
            self.registered_in_queues,
            "release called on a lock set that never registered",
        );
        assert!(
            self.all_acquired,
            "release called on a lock set that is not fully acquired",
        );
        for usage in &self.locks {
            if usage.released_early {
                continue;
            }
            usage.qutex.release();
        }
        self.all_acquired = false;
    }

    /// Releases one member before the continuation body completes and
    /// marks it so the final [`release`](Self::release) skips it.
    ///
    /// # Panics
    ///
    /// Panics if the set is not fully acquired, or if `qutex` is not a
    /// member of this set.
    pub fn release_early(&mut self, qutex: &Arc<Qutex>) {
        assert!(
            self.all_acquired,
            "release_early called on a lock set that is not fully acquired",
        );
        let usage = self
            .locks
            .iter_mut()
            .find(|usage| Arc::ptr_eq(&usage.qutex, qutex))
            .unwrap_or_else(|| {
                panic!(
                    "release_early: qutex '{}' is not a member of this lock set",
                    qutex.name(),
                )
            });
        if !usage.released_early {
            usage.qutex.release();
            usage.released_early = true;
        }
    }
}
