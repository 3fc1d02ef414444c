//! Runtime knobs for the deadlock and gridlock detectors.
//!
//! The single tunable is the detection timeout: once a lockvoker has been
//! waiting longer than this threshold and an acquisition attempt fails,
//! the debug detectors run. The same threshold gates both the same-chain
//! deadlock re-check and the cross-chain gridlock tracker.
//!
//! The default is 5000 ms. It can be overridden at process start with the
//! `DEBUG_QUTEX_DEADLOCK_TIMEOUT_MS` environment variable or at any time
//! with [`set_deadlock_timeout`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

const DEFAULT_DEADLOCK_TIMEOUT_MS: u64 = 5_000;

fn timeout_ms() -> &'static AtomicU64 {
    static CELL: OnceLock<AtomicU64> = OnceLock::new();
    CELL.get_or_init(|| {
        let ms = std::env::var("DEBUG_QUTEX_DEADLOCK_TIMEOUT_MS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_DEADLOCK_TIMEOUT_MS);
        AtomicU64::new(ms)
    })
}

/// Returns the current detector timeout.
#[must_use]
pub fn deadlock_timeout() -> Duration {
    Duration::from_millis(timeout_ms().load(Ordering::Relaxed))
}

/// Sets the detector timeout for the whole process.
pub fn set_deadlock_timeout(timeout: Duration) {
    let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    timeout_ms().store(ms, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_round_trips() {
        let previous = deadlock_timeout();
        set_deadlock_timeout(Duration::from_millis(250));
        assert_eq!(deadlock_timeout(), Duration::from_millis(250));
        set_deadlock_timeout(previous);
    }
}
