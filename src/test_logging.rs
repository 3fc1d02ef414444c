//! Structured test logging for the locking stack.
//!
//! Tests capture typed, timestamped events - qutex transitions, reactor
//! posts, lockvoker wakes - so a failing interleaving can be read back
//! as a timeline instead of re-run under a debugger.
//!
//! # Example
//!
//! ```ignore
//! use spinqueue::test_logging::{TestEvent, TestLogLevel, TestLogger};
//!
//! let logger = TestLogger::new(TestLogLevel::Debug);
//! logger.log(TestEvent::QutexAcquired { qutex: "accounts".into(), acquired: true });
//! println!("{}", logger.report());
//! ```

use std::fmt::Write as _;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Logging verbosity for tests, ordered `Error < Warn < Info < Debug <
/// Trace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TestLogLevel {
    /// Only errors and failures.
    Error,
    /// Warnings and above.
    Warn,
    /// General test progress.
    #[default]
    Info,
    /// Locking operations.
    Debug,
    /// All events including wakes and posts.
    Trace,
}

impl TestLogLevel {
    /// Human-readable name of the level.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    /// Reads the level from the `TEST_LOG_LEVEL` environment variable.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var("TEST_LOG_LEVEL")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default()
    }
}

impl std::fmt::Display for TestLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for TestLogLevel {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(()),
        }
    }
}

/// A typed event captured by the test logger.
#[derive(Debug, Clone)]
pub enum TestEvent {
    /// A qutex acquisition attempt finished.
    QutexAcquired {
        /// Qutex name.
        qutex: String,
        /// Whether the attempt succeeded.
        acquired: bool,
    },
    /// A failed lock-set attempt backed off a qutex.
    QutexBackoff {
        /// Qutex name.
        qutex: String,
    },
    /// A qutex was released.
    QutexReleased {
        /// Qutex name.
        qutex: String,
    },
    /// A lockvoker was posted to its target reactor.
    LockvokerWake {
        /// Identity of the continuation being woken.
        continuation: u64,
        /// Whether the wake bypassed the collapse flag.
        forced: bool,
    },
    /// A continuation's body started running.
    BodyRun {
        /// Identity of the continuation.
        continuation: u64,
    },
    /// A task was posted to a reactor.
    TaskPosted {
        /// Reactor name.
        reactor: String,
    },
    /// Custom event for test-specific logging.
    Custom {
        /// Category for filtering.
        category: &'static str,
        /// Human-readable message.
        message: String,
    },
    /// Error event.
    Error {
        /// Error category.
        category: &'static str,
        /// Error message.
        message: String,
    },
    /// Warning event.
    Warn {
        /// Warning category.
        category: &'static str,
        /// Warning message.
        message: String,
    },
}

impl TestEvent {
    /// Minimum level required to capture this event.
    #[must_use]
    pub fn level(&self) -> TestLogLevel {
        match self {
            Self::Error { .. } => TestLogLevel::Error,
            Self::Warn { .. } => TestLogLevel::Warn,
            Self::BodyRun { .. } | Self::Custom { .. } => TestLogLevel::Info,
            Self::QutexAcquired { .. } | Self::QutexBackoff { .. } | Self::QutexReleased { .. } => {
                TestLogLevel::Debug
            }
            Self::LockvokerWake { .. } | Self::TaskPosted { .. } => TestLogLevel::Trace,
        }
    }
}

impl std::fmt::Display for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QutexAcquired { qutex, acquired } => {
                write!(f, "qutex acquire: qutex={qutex} acquired={acquired}")
            }
            Self::QutexBackoff { qutex } => write!(f, "qutex backoff: qutex={qutex}"),
            Self::QutexReleased { qutex } => write!(f, "qutex release: qutex={qutex}"),
            Self::LockvokerWake {
                continuation,
                forced,
            } => write!(f, "lockvoker wake: continuation={continuation} forced={forced}"),
            Self::BodyRun { continuation } => write!(f, "body run: continuation={continuation}"),
            Self::TaskPosted { reactor } => write!(f, "task posted: reactor={reactor}"),
            Self::Custom { category, message } => write!(f, "[{category}] {message}"),
            Self::Error { category, message } => write!(f, "ERROR [{category}] {message}"),
            Self::Warn { category, message } => write!(f, "WARN [{category}] {message}"),
        }
    }
}

/// A timestamped event record.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Time since logger creation.
    pub elapsed: Duration,
    /// The event that occurred.
    pub event: TestEvent,
}

/// Captures typed events with timestamps and renders them as a report.
#[derive(Debug)]
pub struct TestLogger {
    level: TestLogLevel,
    events: Mutex<Vec<LogRecord>>,
    start_time: Instant,
    verbose: bool,
}

impl TestLogger {
    /// A logger capturing events at `level` and below.
    #[must_use]
    pub fn new(level: TestLogLevel) -> Self {
        Self {
            level,
            events: Mutex::new(Vec::new()),
            start_time: Instant::now(),
            verbose: level >= TestLogLevel::Trace,
        }
    }

    /// A logger configured from the `TEST_LOG_LEVEL` environment
    /// variable.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(TestLogLevel::from_env())
    }

    /// The configured level.
    #[must_use]
    pub fn level(&self) -> TestLogLevel {
        self.level
    }

    /// Captures `event` if it meets the configured level.
    pub fn log(&self, event: TestEvent) {
        let event_level = event.level();
        if event_level > self.level {
            return;
        }
        let elapsed = self.start_time.elapsed();
        if self.verbose {
            eprintln!(
                "[{:>10.3}ms] [{:>5}] {}",
                elapsed.as_secs_f64() * 1000.0,
                event_level.name(),
                &event,
            );
        }
        self.events
            .lock()
            .expect("test logger poisoned")
            .push(LogRecord { elapsed, event });
    }

    /// Logs a custom event.
    pub fn custom(&self, category: &'static str, message: impl Into<String>) {
        self.log(TestEvent::Custom {
            category,
            message: message.into(),
        });
    }

    /// Logs an error event.
    pub fn error(&self, category: &'static str, message: impl Into<String>) {
        self.log(TestEvent::Error {
            category,
            message: message.into(),
        });
    }

    /// Number of captured events.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.lock().expect("test logger poisoned").len()
    }

    /// Snapshot of all captured events.
    #[must_use]
    pub fn events(&self) -> Vec<LogRecord> {
        self.events.lock().expect("test logger poisoned").clone()
    }

    /// Renders the timeline with per-category statistics.
    #[must_use]
    pub fn report(&self) -> String {
        let events = self.events.lock().expect("test logger poisoned");
        let mut report = String::new();

        let _ = writeln!(report, "=== Test Event Log ({} events) ===", events.len());
        for record in events.iter() {
            let _ = writeln!(
                report,
                "[{:>10.3}ms] [{:>5}] {}",
                record.elapsed.as_secs_f64() * 1000.0,
                record.event.level().name(),
                record.event,
            );
        }

        let acquires = events
            .iter()
            .filter(|r| matches!(r.event, TestEvent::QutexAcquired { .. }))
            .count();
        let backoffs = events
            .iter()
            .filter(|r| matches!(r.event, TestEvent::QutexBackoff { .. }))
            .count();
        let wakes = events
            .iter()
            .filter(|r| matches!(r.event, TestEvent::LockvokerWake { .. }))
            .count();
        let errors = events
            .iter()
            .filter(|r| matches!(r.event, TestEvent::Error { .. }))
            .count();

        let _ = writeln!(report, "=== Statistics ===");
        let _ = writeln!(report, "Acquire attempts: {acquires}");
        let _ = writeln!(report, "Backoffs: {backoffs}");
        let _ = writeln!(report, "Lockvoker wakes: {wakes}");
        let _ = writeln!(report, "Errors: {errors}");
        if let Some(last) = events.last() {
            let _ = writeln!(report, "Total duration: {:?}", last.elapsed);
        }
        report
    }

    /// Asserts that no error events were logged.
    ///
    /// # Panics
    ///
    /// Panics with the full report if any error event was captured.
    pub fn assert_no_errors(&self) {
        let errors = {
            let events = self.events.lock().expect("test logger poisoned");
            events
                .iter()
                .filter(|r| matches!(r.event, TestEvent::Error { .. }))
                .count()
        };
        assert!(errors == 0, "test logged {} errors\n{}", errors, self.report());
    }

    /// Clears all captured events.
    pub fn clear(&self) {
        self.events.lock().expect("test logger poisoned").clear();
    }
}

impl Default for TestLogger {
    fn default() -> Self {
        Self::new(TestLogLevel::Info)
    }
}

/// The process-wide logger used by the test macros, created on first
/// use from the environment.
pub fn global() -> &'static TestLogger {
    static GLOBAL: OnceLock<TestLogger> = OnceLock::new();
    GLOBAL.get_or_init(TestLogger::from_env)
}

/// Initializes the global test logger. Idempotent; call at the top of
/// every test that uses the logging macros.
pub fn init_test_logging() {
    let _ = global();
}

/// Marks the start of a named test phase in the global log.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        $crate::test_logging::global().custom("phase", $name);
    };
}

/// Marks a named test as complete in the global log.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        $crate::test_logging::global().custom("complete", $name);
    };
}

/// Logs a custom event to the global test logger.
#[macro_export]
macro_rules! test_log {
    ($cat:literal, $($arg:tt)*) => {
        $crate::test_logging::global().custom($cat, format!($($arg)*));
    };
}

/// Asserts a condition, recording expected and actual values in the
/// global log on the way through.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        if !$cond {
            $crate::test_logging::global().error("assert", String::from($msg));
            eprintln!("{}", $crate::test_logging::global().report());
            panic!(
                "{}: expected {:?}, got {:?}",
                $msg, $expected, $actual
            );
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(TestLogLevel::Error < TestLogLevel::Warn);
        assert!(TestLogLevel::Warn < TestLogLevel::Info);
        assert!(TestLogLevel::Info < TestLogLevel::Debug);
        assert!(TestLogLevel::Debug < TestLogLevel::Trace);
    }

    #[test]
    fn levels_parse_from_strings() {
        assert_eq!("error".parse(), Ok(TestLogLevel::Error));
        assert_eq!("WARNING".parse(), Ok(TestLogLevel::Warn));
        assert_eq!("trace".parse(), Ok(TestLogLevel::Trace));
        assert_eq!("bogus".parse::<TestLogLevel>(), Err(()));
    }

    #[test]
    fn logger_filters_by_level() {
        let logger = TestLogger::new(TestLogLevel::Info);
        logger.log(TestEvent::BodyRun { continuation: 1 });
        // Trace-level event is dropped at Info.
        logger.log(TestEvent::TaskPosted {
            reactor: "r".into(),
        });
        assert_eq!(logger.event_count(), 1);
    }

    #[test]
    fn report_includes_statistics() {
        let logger = TestLogger::new(TestLogLevel::Trace);
        logger.log(TestEvent::QutexAcquired {
            qutex: "a".into(),
            acquired: true,
        });
        logger.log(TestEvent::QutexBackoff { qutex: "a".into() });
        logger.log(TestEvent::LockvokerWake {
            continuation: 3,
            forced: false,
        });

        let report = logger.report();
        assert!(report.contains("3 events"));
        assert!(report.contains("Acquire attempts: 1"));
        assert!(report.contains("Backoffs: 1"));
        assert!(report.contains("Lockvoker wakes: 1"));
    }

    #[test]
    #[should_panic(expected = "test logged 1 errors")]
    fn assert_no_errors_fails_on_error_events() {
        let logger = TestLogger::new(TestLogLevel::Error);
        logger.error("io", "boom");
        logger.assert_no_errors();
    }

    #[test]
    fn clear_empties_the_log() {
        let logger = TestLogger::new(TestLogLevel::Trace);
        logger.custom("t", "one");
        logger.clear();
        assert_eq!(logger.event_count(), 0);
    }
}
