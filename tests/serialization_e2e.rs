//! End-to-end serialization scenarios: single-qutex mutual exclusion,
//! the positional acquisition rule, and symmetric contention resolving
//! through backoff rotation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use spinqueue::{
    Callback, ContinuationId, LockSet, Qutex, Reactor, SerializedContinuation, Waiter,
};

#[cfg(feature = "debug-locks")]
use spinqueue::detect::AcquisitionHistoryTracker;

/// Ten continuations gated by one qutex on one reactor: every body runs
/// exactly once and never concurrently with another.
#[test]
fn single_qutex_serializes_ten_bodies() {
    let reactor = Reactor::spawn("serializer");
    let qutex = Arc::new(Qutex::new("shared"));

    let order = Arc::new(Mutex::new(Vec::new()));
    let active = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();

    for index in 0..10 {
        let order = order.clone();
        let active = active.clone();
        let overlapped = overlapped.clone();
        let tx = tx.clone();
        SerializedContinuation::spawn(
            &reactor,
            Callback::new(move || tx.send(index).expect("receiver alive")),
            vec![qutex.clone()],
            &reactor,
            move |cont| {
                if active.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlapped.store(true, Ordering::SeqCst);
                }
                order.lock().expect("order list poisoned").push(index);
                active.fetch_sub(1, Ordering::SeqCst);
                cont.call_original_cb();
            },
        );
    }

    let mut completed: Vec<usize> = (0..10).map(|_| rx.recv().expect("completion")).collect();
    completed.sort_unstable();
    assert_eq!(completed, (0..10).collect::<Vec<_>>());

    let mut recorded = order.lock().expect("order list poisoned").clone();
    recorded.sort_unstable();
    assert_eq!(recorded, (0..10).collect::<Vec<_>>());
    assert!(!overlapped.load(Ordering::SeqCst), "two bodies overlapped");

    assert!(!qutex.is_owned());
    assert_eq!(qutex.waiters(), 0);

    reactor.stop();
    reactor.join();
}

struct ScriptedWaiter {
    id: ContinuationId,
    wakes: AtomicUsize,
}

impl ScriptedWaiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ContinuationId::next(),
            wakes: AtomicUsize::new(0),
        })
    }

    fn wake_count(&self) -> usize {
        self.wakes.load(Ordering::SeqCst)
    }
}

impl Waiter for ScriptedWaiter {
    fn continuation_id(&self) -> ContinuationId {
        self.id
    }

    fn awaken(self: Arc<Self>, _force: bool) {
        self.wakes.fetch_add(1, Ordering::SeqCst);
    }
}

/// The positional rule under multi-lock contention, driven attempt by
/// attempt. With queue `[W1, W2, W3]` on `a` and `[W2, W3]` on `b`, the
/// rear window of `a` for a two-lock set is `3 / 2 = 1`: only W3 is
/// excluded, so W2 takes both qutexes on its first turn while the
/// single-lock W1 waits for the front of the queue to clear.
#[test]
fn positional_rule_lets_leading_multi_lock_waiter_through() {
    let a = Arc::new(Qutex::new("a"));
    let b = Arc::new(Qutex::new("b"));

    let w1 = ScriptedWaiter::new();
    let w2 = ScriptedWaiter::new();
    let w3 = ScriptedWaiter::new();

    let mut set1 = LockSet::new(vec![a.clone()]);
    let mut set2 = LockSet::new(vec![a.clone(), b.clone()]);
    let mut set3 = LockSet::new(vec![a.clone(), b.clone()]);

    set1.register_in_queues(&(w1.clone() as Arc<dyn Waiter>));
    set2.register_in_queues(&(w2.clone() as Arc<dyn Waiter>));
    set3.register_in_queues(&(w3.clone() as Arc<dyn Waiter>));

    // W2's first turn takes the whole set.
    assert!(set2.try_acquire_or_back_off(&*w2).is_ok());

    // W1 and W3 wait behind the ownership.
    let failed1 = set1.try_acquire_or_back_off(&*w1).unwrap_err();
    assert!(Arc::ptr_eq(&failed1, &a));
    let failed3 = set3.try_acquire_or_back_off(&*w3).unwrap_err();
    assert!(Arc::ptr_eq(&failed3, &a));

    // W2 completes: vacates its slots and releases, waking both fronts.
    set2.unregister_from_queues();
    set2.release();
    assert!(w1.wake_count() >= 1, "front of `a` must be woken");
    assert!(w3.wake_count() >= 1, "front of `b` must be woken");

    // W1 is now the front of `a` with a single-lock set.
    assert!(set1.try_acquire_or_back_off(&*w1).is_ok());
    let failed3 = set3.try_acquire_or_back_off(&*w3).unwrap_err();
    assert!(Arc::ptr_eq(&failed3, &a));

    set1.unregister_from_queues();
    set1.release();

    // W3 is alone in both queues and finally gets its turn.
    assert!(set3.try_acquire_or_back_off(&*w3).is_ok());
    set3.unregister_from_queues();
    set3.release();

    assert!(!a.is_owned());
    assert!(!b.is_owned());
    assert_eq!(a.waiters(), 0);
    assert_eq!(b.waiters(), 0);
}

/// Symmetric 2x2 contention: two continuations wanting the same two
/// qutexes in opposite orders. The backoff rotation breaks the stall
/// within a bounded number of attempts and no detector fires.
#[test]
fn symmetric_two_by_two_contention_resolves() {
    let reactor = Reactor::new("contended");
    let a = Arc::new(Qutex::new("a"));
    let b = Arc::new(Qutex::new("b"));

    let completed = Arc::new(AtomicUsize::new(0));

    for qutexes in [vec![a.clone(), b.clone()], vec![b.clone(), a.clone()]] {
        let completed = completed.clone();
        SerializedContinuation::spawn(
            &reactor,
            Callback::new(move || {
                completed.fetch_add(1, Ordering::SeqCst);
            }),
            qutexes,
            &reactor,
            move |cont| cont.call_original_cb(),
        );
    }

    // Both registered before any attempt ran; drive to completion. The
    // rotation guarantees this terminates, the dispatch bound is just a
    // tripwire against regressions.
    let mut dispatched = 0;
    while completed.load(Ordering::SeqCst) < 2 {
        assert!(reactor.run_one(), "reactor stopped mid-scenario");
        dispatched += 1;
        assert!(dispatched < 100, "contention did not resolve in a bounded number of turns");
    }

    assert!(!a.is_owned());
    assert!(!b.is_owned());
    assert_eq!(a.waiters(), 0);
    assert_eq!(b.waiters(), 0);

    // Well below the detection timeout: nothing was ever tracked.
    #[cfg(feature = "debug-locks")]
    assert!(AcquisitionHistoryTracker::global().is_empty());
}
