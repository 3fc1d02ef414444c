//! Error types and the error-conveyance contract.
//!
//! Failures fall into three buckets:
//!
//! - **Programming errors** abort the process via `panic!` and are never
//!   represented as values: releasing an unowned qutex, unregistering a
//!   waiter that is not queued, running a lockvoker on the wrong reactor
//!   thread, and the like.
//! - **Expected transient states** are plain control flow: a failed
//!   acquisition attempt is not an error, the waiter re-arms and sleeps.
//! - **User-facing errors** inside an async chain are carried as a stored
//!   [`ChainError`] on the continuation and re-raised on the caller's
//!   reactor when it inspects the continuation.

use core::fmt;

/// Boxed error payload carried along a continuation chain.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An error stored on a continuation by an async callee.
///
/// A callee that hits an error in caller-supplied data does not unwind on
/// its own stack; it stores the error on the continuation and invokes the
/// original callback. The caller then calls
/// [`check_error`](crate::chain::Continuation::check_error) to take the
/// error on its own reactor.
#[derive(Debug)]
pub struct ChainError {
    source: BoxError,
}

impl ChainError {
    /// Wraps an error payload for conveyance along the chain.
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Consumes the carrier, returning the original payload.
    #[must_use]
    pub fn into_inner(self) -> BoxError {
        self.source
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error conveyed along continuation chain: {}", self.source)
    }
}

impl std::error::Error for ChainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}
