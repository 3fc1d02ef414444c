//! False-positive retraction: a waiter that times out behind a slow
//! holder registers in the tracker, but no cycle confirms, and the
//! entry retracts itself once the waiter finally acquires.

#![cfg(feature = "debug-locks")]

use std::sync::{mpsc, Arc};
use std::time::Duration;

use spinqueue::detect::AcquisitionHistoryTracker;
use spinqueue::{config, Callback, Qutex, Reactor, SerializedContinuation};

const TIMEOUT: Duration = Duration::from_millis(50);

#[test]
fn slow_holder_is_not_a_gridlock() {
    config::set_deadlock_timeout(TIMEOUT);

    let reactor = Reactor::spawn("slow-io");
    let qutex = Arc::new(Qutex::new("device"));

    // The holder takes the qutex and keeps it across an I/O-like delay:
    // its body returns immediately and completion arrives much later.
    let (held_tx, held_rx) = mpsc::channel();
    let holder = SerializedContinuation::spawn(
        &reactor,
        Callback::new(|| {}),
        vec![qutex.clone()],
        &reactor,
        move |_cont| {
            held_tx.send(()).expect("receiver alive");
        },
    );
    held_rx.recv().expect("holder owns the qutex");
    assert!(qutex.is_owned());

    let (done_tx, done_rx) = mpsc::channel();
    let waiter = SerializedContinuation::spawn(
        &reactor,
        Callback::new(move || done_tx.send(()).expect("receiver alive")),
        vec![qutex.clone()],
        &reactor,
        |cont| cont.call_original_cb(),
    );

    // Past the timeout the nudged attempt fails and registers in the
    // tracker; the holder is not tracked (it is not failing anything),
    // so no stage can confirm a gridlock.
    std::thread::sleep(TIMEOUT + Duration::from_millis(30));
    waiter.nudge();

    let tracker = AcquisitionHistoryTracker::global();
    for _ in 0..200 {
        if tracker.is_tracked(waiter.id()) {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(tracker.is_tracked(waiter.id()), "waiter never registered");
    assert!(!tracker.confirm_gridlock());

    // The holder finally completes; the waiter acquires, retracts its
    // entry, and finishes.
    let holder_done = holder.clone();
    reactor.post(move || holder_done.call_original_cb());

    done_rx.recv().expect("waiter completed after the release");
    assert!(!tracker.is_tracked(waiter.id()));
    assert!(!qutex.is_owned());

    reactor.stop();
    reactor.join();
}
