//! The single-threaded FIFO task queue.
//!
//! Every reactor is bound to exactly one OS thread, either by
//! [`Reactor::spawn`] (which starts the thread) or by running
//! [`run`](Reactor::run) / [`run_one`](Reactor::run_one) manually on a
//! thread of the embedder's choosing. Tasks posted from any thread
//! execute strictly in post order on the owning thread.
//!
//! With the `trace-callables` feature the creation site of every posted
//! task is recorded and logged at dispatch time, which is the tool of
//! choice when hunting a stale closure that was posted from the wrong
//! place.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// A unit of work for a reactor.
struct PostedTask {
    f: Box<dyn FnOnce() + Send>,
    #[cfg(feature = "trace-callables")]
    posted_from: &'static Location<'static>,
}

impl PostedTask {
    fn run(self) {
        #[cfg(feature = "trace-callables")]
        trace!(posted_from = %self.posted_from, "dispatching task");
        (self.f)();
    }
}

thread_local! {
    static CURRENT_REACTOR: RefCell<Option<Arc<Reactor>>> = const { RefCell::new(None) };
}

/// A cooperative single-threaded event loop with a FIFO task queue.
pub struct Reactor {
    name: String,
    queue: Mutex<VecDeque<PostedTask>>,
    task_available: Condvar,
    stopped: AtomicBool,
    /// Set exactly once, when the owning thread first runs the loop.
    owner: OnceLock<ThreadId>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    /// Back-reference to the owning `Arc`, so the loop can install
    /// itself in the thread-local current-reactor cell.
    self_ref: OnceLock<Weak<Reactor>>,
}

impl Reactor {
    /// Creates a reactor with no owning thread yet.
    ///
    /// The embedder later binds a thread by calling [`run`](Self::run)
    /// or [`run_one`](Self::run_one) on it.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let reactor = Arc::new(Self {
            name: name.into(),
            queue: Mutex::new(VecDeque::with_capacity(16)),
            task_available: Condvar::new(),
            stopped: AtomicBool::new(false),
            owner: OnceLock::new(),
            join_handle: Mutex::new(None),
            self_ref: OnceLock::new(),
        });
        reactor
            .self_ref
            .set(Arc::downgrade(&reactor))
            .unwrap_or_else(|_| unreachable!("self reference installed twice"));
        reactor
    }

    fn shared(&self) -> Arc<Reactor> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("reactor self reference is gone")
    }

    /// Creates a reactor and starts its owning thread.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn the thread.
    #[must_use]
    pub fn spawn(name: impl Into<String>) -> Arc<Self> {
        let reactor = Self::new(name);
        let handle = {
            let reactor = reactor.clone();
            thread::Builder::new()
                .name(reactor.name.clone())
                .spawn(move || reactor.run())
                .expect("failed to spawn reactor thread")
        };
        *reactor.join_handle.lock() = Some(handle);
        reactor
    }

    /// The diagnostic name given at construction.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The reactor owning the current thread, if this thread runs one.
    #[must_use]
    pub fn current() -> Option<Arc<Reactor>> {
        CURRENT_REACTOR.with(|current| current.borrow().clone())
    }

    /// Whether the calling thread is this reactor's owning thread.
    #[must_use]
    pub fn is_owner_thread(&self) -> bool {
        self.owner.get() == Some(&thread::current().id())
    }

    /// Number of tasks waiting to be dispatched.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.queue.lock().len()
    }

    /// Enqueues `task` for execution on the owning thread. Never blocks.
    #[track_caller]
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        #[cfg(feature = "trace-callables")]
        let posted_from = Location::caller();
        #[cfg(not(feature = "trace-callables"))]
        let _ = Location::caller();

        let depth = {
            let mut queue = self.queue.lock();
            queue.push_back(PostedTask {
                f: Box::new(task),
                #[cfg(feature = "trace-callables")]
                posted_from,
            });
            queue.len()
        };
        self.task_available.notify_one();
        trace!(reactor = %self.name, depth, "task posted");
    }

    /// Asks the loop to exit at its next natural boundary.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.task_available.notify_all();
        trace!(reactor = %self.name, "stop requested");
    }

    /// Whether [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Runs the loop on the calling thread until stopped.
    ///
    /// Pending tasks are dropped when the loop exits; teardown relies on
    /// [`stop`](Self::stop) followed by this queue clearing.
    ///
    /// # Panics
    ///
    /// Panics if another thread already owns this reactor.
    pub fn run(&self) {
        let _current = self.enter();
        loop {
            let Some(task) = self.next_task() else {
                break;
            };
            task.run();
        }
        self.queue.lock().clear();
        trace!(reactor = %self.name, "loop exited");
    }

    /// Dispatches a single task on the calling thread, blocking until one
    /// is available or the reactor is stopped.
    ///
    /// Returns whether a task ran. Re-entrant: a task may itself call
    /// `run_one` to drain further work while it waits.
    ///
    /// # Panics
    ///
    /// Same ownership rules as [`run`](Self::run).
    pub fn run_one(&self) -> bool {
        let _current = self.enter();
        match self.next_task() {
            Some(task) => {
                task.run();
                true
            }
            None => false,
        }
    }

    /// Waits for the owning thread to exit, if this reactor was started
    /// with [`spawn`](Self::spawn).
    pub fn join(&self) {
        let handle = self.join_handle.lock().take();
        if let Some(handle) = handle {
            handle.join().expect("reactor thread panicked");
        }
    }

    /// Blocks until a task is available; `None` means the reactor
    /// stopped.
    fn next_task(&self) -> Option<PostedTask> {
        let mut queue = self.queue.lock();
        loop {
            if self.is_stopped() {
                return None;
            }
            if let Some(task) = queue.pop_front() {
                return Some(task);
            }
            self.task_available.wait(&mut queue);
        }
    }

    /// Binds the calling thread as the owner and makes this reactor the
    /// thread's current one for the duration of the returned guard.
    ///
    /// The owner is set at most once per reactor; running it from any
    /// other thread afterwards is a programming error. The current-
    /// reactor cell is saved and restored so that one thread may drive
    /// several reactors (a loop nested inside a task, a bridge wait).
    fn enter(&self) -> CurrentGuard {
        let thread_id = thread::current().id();
        let owner = self.owner.get_or_init(|| thread_id);
        assert!(
            *owner == thread_id,
            "reactor '{}' is owned by another thread",
            self.name,
        );
        let previous =
            CURRENT_REACTOR.with(|current| current.borrow_mut().replace(self.shared()));
        CurrentGuard { previous }
    }
}

/// Restores the thread's previous current reactor, also on panic.
struct CurrentGuard {
    previous: Option<Arc<Reactor>>,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_REACTOR.with(|current| *current.borrow_mut() = previous);
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("name", &self.name)
            .field("pending_tasks", &self.pending_tasks())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
