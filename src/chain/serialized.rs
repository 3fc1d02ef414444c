//! Lock-gated continuations and the lockvoker that drives them.
//!
//! A `SerializedContinuation` is a continuation whose body may only run
//! while its whole [`LockSet`] is held. Construction registers a
//! [`Lockvoker`] in every required qutex's queue and posts it to the
//! target reactor; each time the lockvoker runs it either takes every
//! qutex and invokes the body, or backs off and leaves the reactor queue
//! until some qutex wakes it again. The physical thread never blocks:
//! contention is spent re-queueing, not spinning.
//!
//! # Wake protocol
//!
//! The continuation carries an `is_awake_or_being_awakened` flag. A wake
//! swaps it to true and only posts the lockvoker when the flag was
//! false (or the wake is forced); releases on several qutexes between
//! two attempts therefore collapse into a single reactor task. A failed
//! attempt resets the flag right before going back to sleep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
#[cfg(feature = "debug-locks")]
use std::time::Instant;

use parking_lot::Mutex;
use tracing::trace;

use crate::chain::{Callback, ChainLink, Continuation, ContinuationId};
use crate::error::{BoxError, ChainError};
use crate::runtime::Reactor;
use crate::sync::{LockSet, Qutex, Waiter};

type Body = Box<dyn FnOnce(Arc<SerializedContinuation>) + Send>;

/// A continuation whose body is gated by a lock set.
///
/// Kept alive by the caller's scope, by every qutex queue its lockvoker
/// sits in, and by the pending reactor post; it is destroyed when the
/// last of those drops.
pub struct SerializedContinuation {
    inner: Continuation,
    lock_set: Mutex<LockSet>,
    is_awake_or_being_awakened: AtomicBool,
    lockvoker: OnceLock<Arc<Lockvoker>>,
    self_ref: OnceLock<Weak<SerializedContinuation>>,
    #[cfg(feature = "debug-locks")]
    created_at: Instant,
}

impl SerializedContinuation {
    /// Creates the continuation, registers its lockvoker in every
    /// required qutex, and posts the first acquisition attempt to
    /// `target`.
    ///
    /// `qutexes` order matters: it is the try-acquire order. The body
    /// runs on `target`'s thread once every qutex is held and receives
    /// the continuation handle; the original callback in `callback` is
    /// posted to `caller` when the body invokes
    /// [`call_original_cb`](Self::call_original_cb).
    ///
    /// # Panics
    ///
    /// With `debug-locks`, panics when an ancestor in the caller chain
    /// already holds one of `qutexes`: waiting on it could never end.
    pub fn spawn(
        caller: &Arc<Reactor>,
        callback: Callback,
        qutexes: Vec<Arc<Qutex>>,
        target: &Arc<Reactor>,
        body: impl FnOnce(Arc<SerializedContinuation>) + Send + 'static,
    ) -> Arc<Self> {
        let continuation = Arc::new(Self {
            inner: Continuation::from_parts(caller.clone(), callback),
            lock_set: Mutex::new(LockSet::new(qutexes)),
            is_awake_or_being_awakened: AtomicBool::new(false),
            lockvoker: OnceLock::new(),
            self_ref: OnceLock::new(),
            #[cfg(feature = "debug-locks")]
            created_at: Instant::now(),
        });
        continuation
            .self_ref
            .set(Arc::downgrade(&continuation))
            .unwrap_or_else(|_| unreachable!("self reference installed twice"));

        #[cfg(feature = "debug-locks")]
        continuation.assert_no_chain_deadlock();

        let lockvoker = Arc::new(Lockvoker {
            continuation: continuation.clone(),
            target: target.clone(),
            body: Mutex::new(Some(Box::new(body) as Body)),
        });
        continuation
            .lockvoker
            .set(lockvoker.clone())
            .unwrap_or_else(|_| unreachable!("lockvoker installed twice"));

        // First wake: raise the flag before registering so a release
        // racing with registration cannot post a duplicate attempt, then
        // force the post because the flag is already up.
        continuation
            .is_awake_or_being_awakened
            .store(true, Ordering::SeqCst);
        {
            let as_waiter: Arc<dyn Waiter> = lockvoker.clone();
            continuation.lock_set.lock().register_in_queues(&as_waiter);
        }
        trace!(continuation = ?continuation.id(), target = %target.name(), "serialized continuation spawned");
        lockvoker.awaken(true);

        continuation
    }

    /// This continuation's identity.
    #[must_use]
    pub fn id(&self) -> ContinuationId {
        self.inner.id()
    }

    /// The caller's chain link, absent at the chain root.
    #[must_use]
    pub fn caller_link(&self) -> Option<&Arc<ChainLink>> {
        self.inner.caller_link()
    }

    /// Releases the lock set, then posts the original callback to the
    /// caller's reactor.
    ///
    /// Every qutex that was not released early is released here, waking
    /// its queue front.
    pub fn call_original_cb(&self) {
        self.lock_set.lock().release();
        self.inner.call_original_cb();
    }

    /// Releases one qutex of the set before the body completes.
    ///
    /// The final release skips it. Useful when a body finishes with a
    /// hot resource early and keeps the rest for its tail work.
    pub fn release_qutex_early(&self, qutex: &Arc<Qutex>) {
        self.lock_set.lock().release_early(qutex);
    }

    /// Re-posts the acquisition attempt unless one is already pending.
    ///
    /// Wakes normally come from qutex releases; this exists for
    /// embedders that sweep stalled operations, and it is how the
    /// detectors get a chance to run on a waiter nothing will ever wake.
    pub fn nudge(&self) {
        if let Some(lockvoker) = self.lockvoker.get() {
            lockvoker.clone().awaken(false);
        }
    }

    /// Stores an error for the caller to pick up on its own reactor.
    pub fn set_error(&self, error: impl Into<BoxError>) {
        self.inner.set_error(error);
    }

    /// Takes the stored error, if the callee set one.
    pub fn check_error(&self) -> Result<(), ChainError> {
        self.inner.check_error()
    }

    /// Whether `qutex` is part of this continuation's lock set.
    #[must_use]
    pub fn lock_set_contains(&self, qutex: &Arc<Qutex>) -> bool {
        self.lock_set.lock().contains(qutex)
    }

    /// Wraps this continuation as a chain link for its callees.
    #[must_use]
    pub fn as_link(&self) -> Arc<ChainLink> {
        let shared = self
            .self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("continuation self reference is gone");
        Arc::new(ChainLink::Serialized(shared))
    }

    #[cfg(test)]
    pub(crate) fn lockvoker_for_tests(&self) -> Arc<Lockvoker> {
        self.lockvoker.get().expect("lockvoker not installed").clone()
    }

    /// Snapshot of the lock set members, in declaration order.
    #[must_use]
    pub fn lock_set_qutexes(&self) -> Vec<Arc<Qutex>> {
        self.lock_set.lock().qutexes()
    }

    /// Clears the wake flag so the next wake posts a fresh attempt.
    fn allow_awakening(&self) {
        self.is_awake_or_being_awakened
            .store(false, Ordering::Release);
    }

    #[cfg(feature = "debug-locks")]
    fn waited(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    #[cfg(feature = "debug-locks")]
    fn timed_out(&self) -> bool {
        self.waited() >= crate::config::deadlock_timeout()
    }

    /// Same-chain deadlock check, run before the lockvoker exists.
    ///
    /// An ancestor that still holds a qutex of the new set cannot
    /// release it before this continuation completes, so waiting on it
    /// could never end.
    #[cfg(feature = "debug-locks")]
    fn assert_no_chain_deadlock(&self) {
        let qutexes = self.lock_set.lock().qutexes();
        for qutex in &qutexes {
            if crate::detect::chain_holds_qutex(self.caller_link(), qutex) {
                eprintln!(
                    "Deadlock: continuation @{:p} requires qutex '{}' which an ancestor \
                     in its caller chain already holds",
                    self as *const Self,
                    qutex.name(),
                );
                panic!(
                    "Deadlock detected at construction: qutex '{}' is already held by an \
                     ancestor continuation",
                    qutex.name(),
                );
            }
        }
    }
}

impl std::fmt::Debug for SerializedContinuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializedContinuation")
            .field("id", &self.id())
            .field("locks", &self.lock_set.lock().len())
            .field(
                "awake",
                &self.is_awake_or_being_awakened.load(Ordering::Relaxed),
            )
            .finish()
    }
}

/// The re-postable task that tries to acquire a continuation's lock set
/// and invokes its body on success.
///
/// One lockvoker exists per serialized continuation; every qutex queue
/// holds a shared handle to it, and all of those handles compare equal
/// because equality is the parent continuation's identity.
pub struct Lockvoker {
    continuation: Arc<SerializedContinuation>,
    target: Arc<Reactor>,
    body: Mutex<Option<Body>>,
}

impl Lockvoker {
    /// One acquisition attempt, dispatched by the target reactor.
    fn run(&self) {
        assert!(
            self.target.is_owner_thread(),
            "lockvoker for continuation {:?} executed on a thread that does not own \
             reactor '{}'",
            self.continuation.id(),
            self.target.name(),
        );

        #[cfg(feature = "debug-locks")]
        let timed_out = self.continuation.timed_out();

        let attempt = {
            let mut lock_set = self.continuation.lock_set.lock();
            lock_set.try_acquire_or_back_off(self)
        };

        match attempt {
            Err(first_failed) => {
                // Off the reactor queue until some qutex wakes us.
                self.continuation.allow_awakening();
                trace!(
                    continuation = ?self.continuation.id(),
                    failed_on = %first_failed.name(),
                    "acquisition attempt failed, parking"
                );
                #[cfg(feature = "debug-locks")]
                if timed_out {
                    self.run_detectors(&first_failed);
                }
                #[cfg(not(feature = "debug-locks"))]
                let _ = first_failed;
            }
            Ok(()) => {
                // Holding the locks makes queue position meaningless;
                // vacate the slots so contenders advance.
                self.continuation.lock_set.lock().unregister_from_queues();

                #[cfg(feature = "debug-locks")]
                if timed_out {
                    self.retract_tracker_entry();
                }

                trace!(continuation = ?self.continuation.id(), "lock set acquired, invoking body");
                let body = self
                    .body
                    .lock()
                    .take()
                    .expect("lockvoker body invoked twice");
                body(self.continuation.clone());
            }
        }
    }

    /// Deadlock and gridlock detection, entered only after a failed
    /// attempt past the timeout.
    #[cfg(feature = "debug-locks")]
    fn run_detectors(&self, first_failed: &Arc<Qutex>) {
        use crate::detect::{self, AcquisitionHistoryTracker};

        let is_deadlock = detect::chain_holds_qutex(self.continuation.caller_link(), first_failed);

        let tracker = AcquisitionHistoryTracker::global();
        let held = detect::acquired_qutex_history(self.continuation.caller_link());
        tracker.add_if_absent(self.continuation.as_link(), first_failed.clone(), held);

        let heuristic = tracker.heuristic_gridlock(first_failed, self.continuation.id());
        let confirmed = heuristic && tracker.confirm_gridlock();

        if is_deadlock {
            eprintln!(
                "Deadlock: lockvoker for continuation @{:p} has been waiting for {}ms, \
                 failed on qutex '{}' held by its own caller chain",
                Arc::as_ptr(&self.continuation),
                self.continuation.waited().as_millis(),
                first_failed.name(),
            );
        }
        if heuristic || confirmed {
            eprintln!(
                "Gridlock: lockvoker for continuation @{:p} has been waiting for {}ms, \
                 failed on qutex '{}'",
                Arc::as_ptr(&self.continuation),
                self.continuation.waited().as_millis(),
                first_failed.name(),
            );
        }
    }

    /// Drops this continuation's tracker entry after a late success: the
    /// suspected gridlock was a long wait, not a cycle.
    #[cfg(feature = "debug-locks")]
    fn retract_tracker_entry(&self) {
        use crate::detect::AcquisitionHistoryTracker;

        if AcquisitionHistoryTracker::global().remove(self.continuation.id()) {
            eprintln!(
                "False positive gridlock detection - continuation @{:p} was being \
                 tracked but successfully acquired all locks; likely a timed delay, \
                 long-running operation, or I/O wait",
                Arc::as_ptr(&self.continuation),
            );
        }
    }
}

impl Waiter for Lockvoker {
    fn continuation_id(&self) -> ContinuationId {
        self.continuation.id()
    }

    fn awaken(self: Arc<Self>, force: bool) {
        let was_awake = self
            .continuation
            .is_awake_or_being_awakened
            .swap(true, Ordering::AcqRel);
        if was_awake && !force {
            return;
        }
        trace!(continuation = ?self.continuation.id(), force, "lockvoker awakened");
        let lockvoker = self.clone();
        self.target.post(move || lockvoker.run());
    }
}

impl PartialEq for Lockvoker {
    fn eq(&self, other: &Self) -> bool {
        self.continuation.id() == other.continuation.id()
    }
}

impl Eq for Lockvoker {}

impl std::fmt::Debug for Lockvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lockvoker")
            .field("continuation", &self.continuation.id())
            .field("target", &self.target.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_logging::init_test_logging;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    struct HolderWaiter {
        id: ContinuationId,
        wakes: AtomicUsize,
    }

    impl HolderWaiter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: ContinuationId::next(),
                wakes: AtomicUsize::new(0),
            })
        }
    }

    impl Waiter for HolderWaiter {
        fn continuation_id(&self) -> ContinuationId {
            self.id
        }

        fn awaken(self: Arc<Self>, _force: bool) {
            self.wakes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Takes `qutex` through a private single-member lock set so tests
    /// can hold it against a continuation. The holder vacates its queue
    /// slot, as a real acquirer would, so releases wake the right front.
    fn hold(qutex: &Arc<Qutex>) -> LockSet {
        let holder: Arc<dyn Waiter> = HolderWaiter::new();
        let mut set = LockSet::new(vec![qutex.clone()]);
        set.register_in_queues(&holder);
        assert!(set.try_acquire_or_back_off(&*holder).is_ok());
        set.unregister_from_queues();
        set
    }

    #[test]
    fn body_runs_with_locks_held_and_callback_follows() {
        init_test_logging();
        crate::test_phase!("body_runs_with_locks_held_and_callback_follows");
        let reactor = Reactor::new("worker");
        let qutex = Arc::new(Qutex::new("a"));
        let (cb_tx, cb_rx) = mpsc::channel();
        let (body_tx, body_rx) = mpsc::channel();

        let observed = qutex.clone();
        SerializedContinuation::spawn(
            &reactor,
            Callback::new(move || cb_tx.send(()).expect("receiver alive")),
            vec![qutex.clone()],
            &reactor,
            move |cont| {
                body_tx
                    .send(observed.is_owned())
                    .expect("receiver alive");
                cont.call_original_cb();
            },
        );

        // First dispatch: the lockvoker acquires and runs the body.
        assert!(reactor.run_one());
        let owned_during_body = body_rx.recv().expect("body ran");
        crate::assert_with_log!(owned_during_body, "qutex held in body", true, owned_during_body);

        // The body released the set and posted the original callback.
        assert!(!qutex.is_owned());
        assert_eq!(qutex.waiters(), 0);
        assert!(reactor.run_one());
        cb_rx.recv().expect("original callback ran");
        crate::test_complete!("body_runs_with_locks_held_and_callback_follows");
    }

    #[test]
    fn failed_attempt_parks_until_release() {
        let reactor = Reactor::new("worker");
        let qutex = Arc::new(Qutex::new("a"));
        let mut holder = hold(&qutex);

        let (tx, rx) = mpsc::channel();
        let cont = SerializedContinuation::spawn(
            &reactor,
            Callback::new(|| {}),
            vec![qutex.clone()],
            &reactor,
            move |cont| {
                tx.send(()).expect("receiver alive");
                cont.call_original_cb();
            },
        );

        // The first attempt fails and the lockvoker leaves the queue.
        assert_eq!(reactor.pending_tasks(), 1);
        assert!(reactor.run_one());
        assert_eq!(reactor.pending_tasks(), 0);
        assert!(rx.try_recv().is_err());

        // Wake idempotence: any number of nudges posts one attempt.
        cont.nudge();
        cont.nudge();
        cont.nudge();
        assert_eq!(reactor.pending_tasks(), 1);
        assert!(reactor.run_one());
        assert!(rx.try_recv().is_err());

        // The release wakes the queue front, which acquires and runs.
        holder.release();
        assert_eq!(reactor.pending_tasks(), 1);
        assert!(reactor.run_one());
        rx.recv().expect("body ran after release");
    }

    #[test]
    fn early_release_is_skipped_by_completion() {
        let reactor = Reactor::new("worker");
        let a = Arc::new(Qutex::new("a"));
        let b = Arc::new(Qutex::new("b"));

        let (tx, rx) = mpsc::channel();
        let early = a.clone();
        SerializedContinuation::spawn(
            &reactor,
            Callback::new(|| {}),
            vec![a.clone(), b.clone()],
            &reactor,
            move |cont| {
                cont.release_qutex_early(&early);
                tx.send(early.is_owned()).expect("receiver alive");
                cont.call_original_cb();
            },
        );

        assert!(reactor.run_one());
        let owned_after_early_release = rx.recv().expect("body ran");
        assert!(!owned_after_early_release);
        // Completion released only `b`; both end up free exactly once.
        assert!(!a.is_owned());
        assert!(!b.is_owned());
    }

    #[test]
    fn lockvoker_handles_compare_by_parent_continuation() {
        let reactor = Reactor::new("worker");
        let a = Arc::new(Qutex::new("a"));
        let first = SerializedContinuation::spawn(
            &reactor,
            Callback::new(|| {}),
            vec![a.clone()],
            &reactor,
            |cont| cont.call_original_cb(),
        );
        let second = SerializedContinuation::spawn(
            &reactor,
            Callback::new(|| {}),
            vec![a.clone()],
            &reactor,
            |cont| cont.call_original_cb(),
        );

        let one = first.lockvoker_for_tests();
        let other = first.lockvoker_for_tests();
        assert_eq!(one, other);
        assert_ne!(one, second.lockvoker_for_tests());

        while reactor.pending_tasks() > 0 {
            reactor.run_one();
        }
    }

    #[test]
    fn chained_serialized_continuations_walk_to_their_ancestors() {
        let reactor = Reactor::new("worker");
        let a = Arc::new(Qutex::new("a"));
        let b = Arc::new(Qutex::new("b"));

        let (tx, rx) = mpsc::channel();
        let child_qutex = b.clone();
        let probe = a.clone();
        SerializedContinuation::spawn(
            &reactor,
            Callback::new(|| {}),
            vec![a.clone()],
            &reactor,
            move |parent| {
                let tx = tx.clone();
                let parent_cb = parent.clone();
                SerializedContinuation::spawn(
                    &Reactor::current().expect("on reactor thread"),
                    Callback::with_caller(parent.as_link(), move || {
                        parent_cb.call_original_cb();
                    }),
                    vec![child_qutex.clone()],
                    &Reactor::current().expect("on reactor thread"),
                    move |child| {
                        // The parent's qutex is visible from the child's chain.
                        let held = crate::chain::walk_chain(child.caller_link())
                            .filter_map(|link| {
                                link.as_serialized().map(|s| s.lock_set_qutexes())
                            })
                            .flatten()
                            .any(|q| Arc::ptr_eq(&q, &probe));
                        tx.send(held).expect("receiver alive");
                        child.call_original_cb();
                    },
                );
            },
        );

        // Parent body, child attempt, child callback, parent callback.
        while reactor.pending_tasks() > 0 {
            reactor.run_one();
        }
        assert!(rx.recv().expect("child body ran"));
    }
}
