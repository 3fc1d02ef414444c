//! Deadlock and gridlock detection.
//!
//! Two distinct stuck states are recognized, both only in builds with
//! the `debug-locks` feature:
//!
//! - **Deadlock**: the same chain re-acquires a lock. Caught by walking
//!   a continuation's caller chain and asking every serialized ancestor
//!   whether its lock set contains the wanted qutex. Checked at
//!   construction time and re-checked when a timed-out attempt fails.
//! - **Gridlock**: a circular wait across independent chains. Timed-out
//!   failing waiters register in the [`AcquisitionHistoryTracker`]; a
//!   fast heuristic pass looks for any other tracked waiter holding the
//!   wanted qutex, and only when it fires does the complete pass build a
//!   [`DependencyGraph`] and run DFS cycle detection. Entries retract
//!   themselves when they later acquire their set, which is how long
//!   I/O waits are told apart from true circularity.
//!
//! Reports are plain text on stderr with stable leading tokens
//! (`Deadlock`, `GRIDLOCK DETECTED`, `CIRCULAR DEPENDENCIES DETECTED`,
//! `False positive`) so log scrapers can match them.

mod graph;
#[cfg(feature = "debug-locks")]
mod tracker;

pub use graph::DependencyGraph;
#[cfg(feature = "debug-locks")]
pub use tracker::AcquisitionHistoryTracker;

#[cfg(feature = "debug-locks")]
use std::sync::Arc;

#[cfg(feature = "debug-locks")]
use crate::chain::{walk_chain, ChainLink};
#[cfg(feature = "debug-locks")]
use crate::sync::Qutex;

/// Whether any serialized ancestor on the chain starting at `start`
/// holds `qutex` in its lock set.
///
/// Callers pass the caller link, not the continuation's own link: the
/// continuation asking naturally has the qutex in its own set.
#[cfg(feature = "debug-locks")]
pub fn chain_holds_qutex(start: Option<&Arc<ChainLink>>, qutex: &Arc<Qutex>) -> bool {
    for link in walk_chain(start) {
        let Some(serialized) = link.as_serialized() else {
            continue;
        };
        if serialized.lock_set_contains(qutex) {
            tracing::debug!(
                qutex = %qutex.name(),
                ancestor = ?serialized.id(),
                "qutex found in an ancestor's lock set"
            );
            return true;
        }
    }
    false
}

/// Every qutex in the lock sets of the serialized ancestors on the
/// chain starting at `start`.
///
/// This is the "held" side of a tracker entry: the failing continuation
/// itself is excluded because it is the one backing off.
#[cfg(feature = "debug-locks")]
pub fn acquired_qutex_history(start: Option<&Arc<ChainLink>>) -> Vec<Arc<Qutex>> {
    let mut held = Vec::new();
    for link in walk_chain(start) {
        if let Some(serialized) = link.as_serialized() {
            held.extend(serialized.lock_set_qutexes());
        }
    }
    held
}
