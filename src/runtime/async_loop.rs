//! Completion bookkeeping for fan-out continuations.
//!
//! A body that launches N sub-operations and completes when the last one
//! reports back keeps an `AsyncLoop` and asks it after every callback
//! whether the fan-out is done. Counters are atomic because callbacks
//! may land on different reactors.

use std::sync::atomic::{AtomicU32, Ordering};

/// Success/failure tally over a known number of sub-operations.
#[derive(Debug)]
pub struct AsyncLoop {
    total: u32,
    succeeded: AtomicU32,
    failed: AtomicU32,
}

impl AsyncLoop {
    /// A tally expecting `total` completions.
    #[must_use]
    pub fn new(total: u32) -> Self {
        Self {
            total,
            succeeded: AtomicU32::new(0),
            failed: AtomicU32::new(0),
        }
    }

    /// Whether every expected completion has been recorded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.succeeded.load(Ordering::Acquire) + self.failed.load(Ordering::Acquire) == self.total
    }

    /// Whether the loop expects no completions at all.
    ///
    /// Callers branch on this before waiting: a zero-iteration fan-out
    /// never produces a callback to advance it.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Records one completion.
    pub fn record(&self, success: bool) {
        if success {
            self.succeeded.fetch_add(1, Ordering::AcqRel);
        } else {
            self.failed.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Records one completion and reports whether it was the last.
    pub fn record_and_check(&self, success: bool) -> bool {
        self.record(success);
        self.is_complete()
    }

    /// Writes off every outstanding completion as failed.
    ///
    /// Used when the fan-out is abandoned midway and the remaining
    /// callbacks will never arrive.
    pub fn fail_remaining(&self) {
        let succeeded = self.succeeded.load(Ordering::Acquire);
        self.failed.store(self.total - succeeded, Ordering::Release);
    }

    /// Completions recorded as successful so far.
    #[must_use]
    pub fn succeeded(&self) -> u32 {
        self.succeeded.load(Ordering::Acquire)
    }

    /// Completions recorded as failed so far.
    #[must_use]
    pub fn failed(&self) -> u32 {
        self.failed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_after_every_record() {
        let tally = AsyncLoop::new(3);
        assert!(!tally.is_complete());
        assert!(!tally.record_and_check(true));
        assert!(!tally.record_and_check(false));
        assert!(tally.record_and_check(true));
        assert_eq!(tally.succeeded(), 2);
        assert_eq!(tally.failed(), 1);
    }

    #[test]
    fn zero_iterations_is_complete_and_empty() {
        let tally = AsyncLoop::new(0);
        assert!(tally.is_empty());
        assert!(tally.is_complete());
    }

    #[test]
    fn fail_remaining_closes_the_tally() {
        let tally = AsyncLoop::new(5);
        tally.record(true);
        tally.record(true);
        tally.fail_remaining();
        assert!(tally.is_complete());
        assert_eq!(tally.succeeded(), 2);
        assert_eq!(tally.failed(), 3);
    }
}
