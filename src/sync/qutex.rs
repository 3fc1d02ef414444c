//! Queue-based mutex with positional acquisition.
//!
//! A qutex combines a spinlock, an ownership flag, and a FIFO of waiting
//! lockvokers. Acquisition is decided by queue position: a waiter that
//! needs only this one lock must be at the front, while a waiter that
//! needs `S` locks succeeds from anywhere in the leading `(S-1)/S`
//! fraction of the queue. Failed group acquisitions back off through
//! [`backoff`](Qutex::backoff), which rotates the queue so that
//! symmetric contention cannot stall forever.
//!
//! # Waiter identity
//!
//! Queue entries are shared handles to [`Waiter`] implementations. Two
//! entries are the same waiter iff their parent continuations are the
//! same, i.e. their [`ContinuationId`]s match; the same logical waiter
//! sits in several qutex queues at once and compares equal across all of
//! them. The [`WaiterHandle`] returned by registration is that identity,
//! so it stays valid across the backoff splice.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::trace;

use crate::chain::ContinuationId;
use crate::sync::SpinLock;

/// A waiter that can be parked in qutex queues and woken on release.
///
/// Implemented by the lockvoker; qutex unit tests substitute stubs.
pub trait Waiter: Send + Sync {
    /// Identity of the parent continuation. Defines waiter equality.
    fn continuation_id(&self) -> ContinuationId;

    /// Re-posts this waiter's acquisition attempt on its target reactor.
    ///
    /// With `force == false` the wake collapses into an already-pending
    /// attempt; see the lockvoker's wake protocol.
    fn awaken(self: Arc<Self>, force: bool);
}

/// Identifies a waiter's slot in one qutex's queue.
///
/// The handle survives queue reordering; it is invalidated only by
/// [`Qutex::unregister_from_queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterHandle(ContinuationId);

struct QutexState {
    /// Waiters in arrival order, front is next in line.
    queue: VecDeque<Arc<dyn Waiter>>,
    is_owned: bool,
    #[cfg(feature = "debug-locks")]
    owner: Option<Arc<dyn Waiter>>,
}

/// Queue-based mutex for asynchronous lock management.
///
/// All operations are thread-safe; internal state is guarded by a
/// [`SpinLock`](crate::sync::SpinLock). Wakes always happen after the
/// spinlock is dropped, so a woken waiter can immediately re-enter the
/// qutex without contending on it.
pub struct Qutex {
    name: String,
    state: SpinLock<QutexState>,
}

impl Qutex {
    /// Creates an unowned qutex. The name appears only in diagnostics.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: SpinLock::new(QutexState {
                queue: VecDeque::with_capacity(4),
                is_owned: false,
                #[cfg(feature = "debug-locks")]
                owner: None,
            }),
        }
    }

    /// The diagnostic name given at construction.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of waiters currently queued.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether some waiter currently owns the qutex.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        self.state.lock().is_owned
    }

    /// Identity of the current owner, if ownership tracking is compiled
    /// in and the qutex is owned.
    #[cfg(feature = "debug-locks")]
    #[must_use]
    pub fn current_owner_id(&self) -> Option<ContinuationId> {
        self.state
            .lock()
            .owner
            .as_ref()
            .map(|owner| owner.continuation_id())
    }

    /// Appends `waiter` to the tail of the queue.
    ///
    /// # Panics
    ///
    /// Panics if the same waiter (by continuation identity) is already
    /// registered here.
    pub fn register_in_queue(&self, waiter: Arc<dyn Waiter>) -> WaiterHandle {
        let id = waiter.continuation_id();
        let mut state = self.state.lock();
        assert!(
            state.queue.iter().all(|queued| queued.continuation_id() != id),
            "register_in_queue: waiter {id:?} is already registered in qutex '{}'",
            self.name,
        );
        state.queue.push_back(waiter);
        trace!(qutex = %self.name, waiter = ?id, depth = state.queue.len(), "waiter registered");
        WaiterHandle(id)
    }

    /// Erases the slot identified by `handle`.
    ///
    /// # Panics
    ///
    /// Panics if the waiter is not registered; unregistering twice is a
    /// programming error.
    pub fn unregister_from_queue(&self, handle: WaiterHandle) {
        let mut state = self.state.lock();
        let position = state
            .queue
            .iter()
            .position(|queued| queued.continuation_id() == handle.0)
            .unwrap_or_else(|| {
                panic!(
                    "unregister_from_queue: waiter {:?} is not registered in qutex '{}'",
                    handle.0, self.name,
                )
            });
        state.queue.remove(position);
        trace!(qutex = %self.name, waiter = ?handle.0, "waiter unregistered");
    }

    /// Positional acquisition attempt for one member of a lock set of
    /// size `n_required_locks`.
    ///
    /// Let `Q` be the queue length and `S = n_required_locks`, with the
    /// rear window `Q / S` (integer division). The attempt succeeds iff
    /// the qutex is unowned and one of:
    ///
    /// - `Q == 1`, or the rear window is empty;
    /// - `S == 1` and `trying_waiter` is the queue front;
    /// - `S > 1` and `trying_waiter` is not among the last `Q / S`
    ///   entries.
    ///
    /// A single-lock waiter must be strictly first in line or it could
    /// starve behind multi-lock waiters; a multi-lock waiter only has to
    /// clear the rear fraction, which grows more permissive with `S`.
    ///
    /// # Panics
    ///
    /// Panics if the queue is empty: waiters register before attempting.
    pub fn try_acquire(&self, trying_waiter: &dyn Waiter, n_required_locks: usize) -> bool {
        assert!(n_required_locks >= 1, "try_acquire with an empty lock set");

        let mut state = self.state.lock();
        let q_len = state.queue.len();
        assert!(
            q_len >= 1,
            "try_acquire called on qutex '{}' with an empty queue - \
             waiters must be registered before attempting acquisition",
            self.name,
        );

        if state.is_owned {
            trace!(qutex = %self.name, "try_acquire: already owned");
            return false;
        }

        let trying_id = trying_waiter.continuation_id();
        let rear_window = q_len / n_required_locks;

        let acquired = if q_len == 1 || rear_window < 1 {
            true
        } else if n_required_locks == 1 {
            state
                .queue
                .front()
                .is_some_and(|front| front.continuation_id() == trying_id)
        } else {
            // In the leading fraction iff not found in the rear window.
            !state
                .queue
                .iter()
                .rev()
                .take(rear_window)
                .any(|queued| queued.continuation_id() == trying_id)
        };

        if acquired {
            state.is_owned = true;
            #[cfg(feature = "debug-locks")]
            {
                let entry = state
                    .queue
                    .iter()
                    .find(|queued| queued.continuation_id() == trying_id)
                    .cloned()
                    .unwrap_or_else(|| {
                        panic!(
                            "try_acquire: acquiring waiter {trying_id:?} is not registered \
                             in qutex '{}'",
                            self.name,
                        )
                    });
                state.owner = Some(entry);
            }
        }
        trace!(qutex = %self.name, waiter = ?trying_id, acquired, "try_acquire");
        acquired
    }

    /// Backs out of an acquisition after the waiter failed to take its
    /// whole lock set.
    ///
    /// If the failed waiter sits at the front, its entry is spliced to
    /// 1-based position `min(S, Q)` (the tail when `S >= Q`); this
    /// rotation is what breaks the symmetric NxN stall where every
    /// contender is at the front of one queue and in the rear of another.
    /// Ownership is cleared and the (possibly new) front is woken, unless
    /// the front is the failed waiter itself, which only happens when the
    /// queue holds a single entry.
    ///
    /// # Panics
    ///
    /// Panics if the queue is empty, or if the failed waiter is at the
    /// front with a single-lock set: that acquisition cannot have failed.
    pub fn backoff(&self, failed_waiter: &dyn Waiter, n_required_locks: usize) {
        let failed_id = failed_waiter.continuation_id();

        let front_to_wake = {
            let mut state = self.state.lock();
            let q_len = state.queue.len();
            assert!(
                q_len >= 1,
                "backoff called on qutex '{}' with an empty queue",
                self.name,
            );

            let front_is_failed = state
                .queue
                .front()
                .is_some_and(|front| front.continuation_id() == failed_id);
            assert!(
                !(front_is_failed && n_required_locks == 1),
                "backoff: waiter at the front of qutex '{}' with a single-lock set \
                 cannot have failed to acquire it",
                self.name,
            );

            if front_is_failed && q_len > 1 {
                let entry = state.queue.pop_front().expect("queue front vanished");
                let insert_at = if q_len > n_required_locks {
                    n_required_locks - 1
                } else {
                    state.queue.len()
                };
                state.queue.insert(insert_at, entry);
                trace!(
                    qutex = %self.name,
                    waiter = ?failed_id,
                    to_position = insert_at + 1,
                    "backoff rotated queue front"
                );
            }

            state.is_owned = false;
            #[cfg(feature = "debug-locks")]
            {
                state.owner = None;
            }

            if q_len > 1 {
                let new_front = state.queue.front().cloned().expect("queue emptied under lock");
                assert!(
                    new_front.continuation_id() != failed_id,
                    "backoff: failed acquirer is still at the front of qutex '{}' \
                     with more than one waiter queued",
                    self.name,
                );
                Some(new_front)
            } else {
                None
            }
        };

        // Wake after dropping the spinlock so the woken attempt can enter
        // try_acquire without spinning on us.
        if let Some(front) = front_to_wake {
            front.awaken(false);
        }
    }

    /// Releases an owned qutex and wakes the queue front.
    ///
    /// The wake is unconditional: skipping it when the releaser was not
    /// at the front loses wakeups once multi-lock waiters can acquire
    /// from the middle of the queue.
    ///
    /// # Panics
    ///
    /// Panics if the qutex is not owned.
    pub fn release(&self) {
        let front = {
            let mut state = self.state.lock();
            assert!(
                state.is_owned,
                "release() called on unowned qutex '{}'",
                self.name,
            );
            #[cfg(feature = "debug-locks")]
            assert!(
                state.owner.is_some(),
                "release() called on qutex '{}' with no tracked owner",
                self.name,
            );

            state.is_owned = false;
            #[cfg(feature = "debug-locks")]
            {
                state.owner = None;
            }
            state.queue.front().cloned()
        };

        trace!(qutex = %self.name, "released");
        if let Some(front) = front {
            front.awaken(false);
        }
    }
}

impl std::fmt::Debug for Qutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Qutex")
            .field("name", &self.name)
            .field("is_owned", &state.is_owned)
            .field("waiters", &state.queue.len())
            .finish()
    }
}
