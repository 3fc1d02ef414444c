//! Continuation nodes and the caller chain.
//!
//! Every asynchronous operation is represented by a continuation node
//! that knows the reactor its original callback must be posted to and,
//! through [`Callback`], the continuation of its own caller. The nodes
//! form a singly-linked *caller chain* of [`ChainLink`]s; walking it is
//! how the deadlock and gridlock detectors learn which qutexes an
//! operation's ancestors hold.
//!
//! Two node kinds exist: the plain posted [`Continuation`], and the
//! [`SerializedContinuation`] whose body is gated by a
//! [`LockSet`](crate::sync::LockSet).

mod serialized;

pub use serialized::{Lockvoker, SerializedContinuation};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{BoxError, ChainError};
use crate::runtime::Reactor;

/// Process-unique identity of a continuation.
///
/// Waiter equality, tracker keys, and dependency-graph nodes are all
/// this identity; copies of a waiter in different qutex queues compare
/// equal because they share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContinuationId(u64);

impl ContinuationId {
    /// Mints a fresh process-unique identity.
    ///
    /// Continuations mint their own; this is public for embedders (and
    /// tests) that park custom [`Waiter`](crate::sync::Waiter)
    /// implementations in qutex queues.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

type CallbackFn = Box<dyn FnOnce() + Send>;

/// An original callback paired with the caller's chain link.
///
/// The link is what lets detectors walk from a callee back through its
/// caller, the caller's caller, and so on. A chain root passes no link.
pub struct Callback {
    caller: Option<Arc<ChainLink>>,
    f: CallbackFn,
}

impl Callback {
    /// A callback at the root of a chain.
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            caller: None,
            f: Box::new(f),
        }
    }

    /// A callback linked to the caller's continuation.
    pub fn with_caller(caller: Arc<ChainLink>, f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            caller: Some(caller),
            f: Box::new(f),
        }
    }

    fn into_parts(self) -> (Option<Arc<ChainLink>>, CallbackFn) {
        (self.caller, self.f)
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("caller", &self.caller.as_ref().map(|link| link.id()))
            .finish()
    }
}

/// A plain posted continuation.
///
/// Posts its original callback to the caller's reactor on completion and
/// carries a stored error across the async boundary.
pub struct Continuation {
    id: ContinuationId,
    caller_reactor: Arc<Reactor>,
    caller_link: Option<Arc<ChainLink>>,
    callback: Mutex<Option<CallbackFn>>,
    error: Mutex<Option<ChainError>>,
    /// Back-reference to the owning `Arc`; unset when this node is
    /// embedded inside a serialized continuation, which links itself.
    self_ref: OnceLock<Weak<Continuation>>,
}

impl Continuation {
    /// Creates a continuation whose callback will be posted to
    /// `caller_reactor`.
    #[must_use]
    pub fn new(caller_reactor: &Arc<Reactor>, callback: Callback) -> Arc<Self> {
        let continuation = Arc::new(Self::from_parts(caller_reactor.clone(), callback));
        continuation
            .self_ref
            .set(Arc::downgrade(&continuation))
            .unwrap_or_else(|_| unreachable!("self reference installed twice"));
        continuation
    }

    pub(crate) fn from_parts(caller_reactor: Arc<Reactor>, callback: Callback) -> Self {
        let (caller_link, f) = callback.into_parts();
        Self {
            id: ContinuationId::next(),
            caller_reactor,
            caller_link,
            callback: Mutex::new(Some(f)),
            error: Mutex::new(None),
            self_ref: OnceLock::new(),
        }
    }

    /// This continuation's identity.
    #[must_use]
    pub fn id(&self) -> ContinuationId {
        self.id
    }

    /// The caller's chain link, absent at the chain root.
    #[must_use]
    pub fn caller_link(&self) -> Option<&Arc<ChainLink>> {
        self.caller_link.as_ref()
    }

    /// Posts the original callback to the caller's reactor.
    ///
    /// A second call is a no-op; the callback is consumed by the first.
    pub fn call_original_cb(&self) {
        if let Some(callback) = self.callback.lock().take() {
            trace!(continuation = ?self.id, reactor = %self.caller_reactor.name(), "posting original callback");
            self.caller_reactor.post(callback);
        }
    }

    /// Stores an error for the caller to pick up on its own reactor.
    pub fn set_error(&self, error: impl Into<BoxError>) {
        *self.error.lock() = Some(ChainError::new(error));
    }

    /// Takes the stored error, if the callee set one.
    ///
    /// Callers invoke this from their original callback to re-raise the
    /// callee's failure on their own stack.
    pub fn check_error(&self) -> Result<(), ChainError> {
        match self.error.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Wraps this continuation as a chain link for its callees.
    ///
    /// # Panics
    ///
    /// Panics on a continuation that is not shared behind an `Arc`
    /// (only [`new`](Self::new) produces linkable nodes).
    #[must_use]
    pub fn as_link(&self) -> Arc<ChainLink> {
        let shared = self
            .self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("continuation is not shared, cannot become a chain link");
        Arc::new(ChainLink::Plain(shared))
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Continuation")
            .field("id", &self.id)
            .field("caller", &self.caller_link.as_ref().map(|link| link.id()))
            .finish()
    }
}

/// One node in the caller chain.
///
/// Walkers classify nodes by the tag: serialized nodes expose a lock
/// set, plain nodes only forward to their own caller.
pub enum ChainLink {
    /// A continuation without a lock set.
    Plain(Arc<Continuation>),
    /// A continuation gated by a lock set.
    Serialized(Arc<SerializedContinuation>),
}

impl ChainLink {
    /// Identity of the continuation behind this link.
    #[must_use]
    pub fn id(&self) -> ContinuationId {
        match self {
            Self::Plain(continuation) => continuation.id(),
            Self::Serialized(continuation) => continuation.id(),
        }
    }

    /// The next link up the chain, absent at the root.
    #[must_use]
    pub fn caller(&self) -> Option<&Arc<ChainLink>> {
        match self {
            Self::Plain(continuation) => continuation.caller_link(),
            Self::Serialized(continuation) => continuation.caller_link(),
        }
    }

    /// The serialized continuation behind this link, if it has one.
    #[must_use]
    pub fn as_serialized(&self) -> Option<&Arc<SerializedContinuation>> {
        match self {
            Self::Plain(_) => None,
            Self::Serialized(continuation) => Some(continuation),
        }
    }

    /// Stable address of the underlying continuation, for diagnostics.
    #[must_use]
    pub fn continuation_ptr(&self) -> *const () {
        match self {
            Self::Plain(continuation) => Arc::as_ptr(continuation).cast(),
            Self::Serialized(continuation) => Arc::as_ptr(continuation).cast(),
        }
    }
}

impl std::fmt::Debug for ChainLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::Plain(_) => "Plain",
            Self::Serialized(_) => "Serialized",
        };
        write!(f, "ChainLink::{tag}({:?})", self.id())
    }
}

/// Walks a chain from `start` toward the root, yielding every link.
pub fn walk_chain(start: Option<&Arc<ChainLink>>) -> ChainWalk {
    ChainWalk {
        next: start.cloned(),
    }
}

/// Iterator over a caller chain; see [`walk_chain`].
pub struct ChainWalk {
    next: Option<Arc<ChainLink>>,
}

impl Iterator for ChainWalk {
    type Item = Arc<ChainLink>;

    fn next(&mut self) -> Option<Self::Item> {
        let link = self.next.take()?;
        self.next = link.caller().cloned();
        Some(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn ids_are_unique_and_ordered() {
        let first = ContinuationId::next();
        let second = ContinuationId::next();
        assert_ne!(first, second);
        assert!(first < second);
    }

    #[test]
    fn callback_is_posted_to_caller_reactor_once() {
        let reactor = Reactor::new("caller");
        let (tx, rx) = mpsc::channel();
        let continuation = Continuation::new(
            &reactor,
            Callback::new(move || tx.send(()).expect("receiver alive")),
        );

        continuation.call_original_cb();
        continuation.call_original_cb();
        assert_eq!(reactor.pending_tasks(), 1);

        assert!(reactor.run_one());
        rx.recv().expect("callback ran");
    }

    #[test]
    fn error_conveyance_round_trip() {
        let reactor = Reactor::new("caller");
        let continuation = Continuation::new(&reactor, Callback::new(|| {}));

        assert!(continuation.check_error().is_ok());
        continuation.set_error("callee rejected the request");
        let err = continuation.check_error().unwrap_err();
        assert!(err.to_string().contains("callee rejected the request"));
        // The error is taken, a second inspection sees none.
        assert!(continuation.check_error().is_ok());
    }

    #[test]
    fn chain_walk_visits_every_ancestor() {
        let reactor = Reactor::new("caller");
        let root = Continuation::new(&reactor, Callback::new(|| {}));
        let middle = Continuation::new(
            &reactor,
            Callback::with_caller(root.as_link(), || {}),
        );
        let leaf = Continuation::new(
            &reactor,
            Callback::with_caller(middle.as_link(), || {}),
        );

        let ids: Vec<ContinuationId> = walk_chain(leaf.caller_link()).map(|link| link.id()).collect();
        assert_eq!(ids, vec![middle.id(), root.id()]);
        assert!(walk_chain(root.caller_link()).next().is_none());
    }

    #[test]
    fn plain_links_are_not_serialized() {
        let reactor = Reactor::new("caller");
        let continuation = Continuation::new(&reactor, Callback::new(|| {}));
        let link = continuation.as_link();
        assert!(link.as_serialized().is_none());
        assert_eq!(link.id(), continuation.id());
        assert!(!link.continuation_ptr().is_null());
    }
}
