//! Process-wide registry of timed-out acquisition attempts.
//!
//! Every lockvoker that fails an attempt after the detection timeout
//! records itself here: the qutex it wants and the qutexes its caller
//! chain holds. Later-arriving timed-out waiters compare against the
//! registry to spot circular waits. An entry retracts itself when its
//! continuation eventually does acquire its set, which is what keeps a
//! long-running peer or a slow I/O wait from being reported as a
//! gridlock.
//!
//! The registry is guarded by a [`SpinLock`], not a qutex: the tracker
//! is invoked from inside the lockvoker machinery, and gating it on a
//! qutex would make the detector depend on the thing it diagnoses.
//! Tracker critical sections are O(entries); they run only on the
//! timeout path, never on hot acquisition paths.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::chain::{ChainLink, ContinuationId};
use crate::detect::DependencyGraph;
use crate::sync::{Qutex, SpinLock};

struct TrackerEntry {
    /// Keeps the stuck continuation alive for reporting.
    link: Arc<ChainLink>,
    /// The qutex this continuation wants but cannot acquire.
    wanted: Arc<Qutex>,
    /// Every qutex held by its caller chain at registration time.
    held: Vec<Arc<Qutex>>,
}

/// Registry of suspected-stuck continuations; see the module docs.
pub struct AcquisitionHistoryTracker {
    entries: SpinLock<HashMap<ContinuationId, TrackerEntry>>,
}

impl AcquisitionHistoryTracker {
    /// A fresh, empty tracker. Production code uses [`global`]
    /// (Self::global); standalone instances exist for tests.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: SpinLock::new(HashMap::new()),
        }
    }

    /// The process-wide tracker, created lazily on first use and never
    /// destroyed.
    #[must_use]
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<AcquisitionHistoryTracker> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Registers a timed-out continuation with its wanted qutex and the
    /// qutexes held along its caller chain. A continuation that is
    /// already tracked keeps its original entry.
    pub fn add_if_absent(&self, link: Arc<ChainLink>, wanted: Arc<Qutex>, held: Vec<Arc<Qutex>>) {
        let id = link.id();
        let mut entries = self.entries.lock();
        entries.entry(id).or_insert_with(|| {
            debug!(continuation = ?id, wanted = %wanted.name(), held = held.len(), "tracking timed-out waiter");
            TrackerEntry { link, wanted, held }
        });
    }

    /// Removes a continuation's entry, returning whether one existed.
    pub fn remove(&self, id: ContinuationId) -> bool {
        let removed = self.entries.lock().remove(&id).is_some();
        if removed {
            debug!(continuation = ?id, "tracker entry retracted");
        }
        removed
    }

    /// Number of tracked continuations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no continuation is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Whether `id` currently has a tracker entry.
    #[must_use]
    pub fn is_tracked(&self, id: ContinuationId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    /// Heuristic gridlock check: does any *other* tracked continuation
    /// hold the qutex `current` wants?
    ///
    /// Fast and possibly wrong in both directions - it sees only waiters
    /// that already timed out, and a hit may still be a long delay
    /// rather than a cycle. A hit is reported and gates the complete
    /// check.
    pub fn heuristic_gridlock(&self, wanted: &Arc<Qutex>, current: ContinuationId) -> bool {
        let found = {
            let entries = self.entries.lock();
            let current_ptr = entries.get(&current).map(|entry| entry.link.continuation_ptr());
            entries
                .iter()
                .find(|(id, entry)| {
                    **id != current && entry.held.iter().any(|held| Arc::ptr_eq(held, wanted))
                })
                .map(|(_, culprit)| (current_ptr, culprit.link.continuation_ptr()))
        };

        match found {
            Some((current_ptr, culprit_ptr)) => {
                eprintln!(
                    "GRIDLOCK DETECTED: current continuation @{:?} wants lock '{}' which is \
                     held by continuation @{culprit_ptr:?}",
                    current_ptr.unwrap_or(std::ptr::null()),
                    wanted.name(),
                );
                true
            }
            None => false,
        }
    }

    /// Builds the dependency graph over the current tracker state.
    ///
    /// An edge `A -> B` means A's wanted qutex appears in B's held list.
    /// There may be a circular dependency the tracker has not heard
    /// about yet; the graph only reflects reported waiters.
    #[must_use]
    pub fn generate_graph(&self) -> DependencyGraph<ContinuationId> {
        let entries = self.entries.lock();
        Self::graph_from(&entries)
    }

    /// Complete gridlock check: cycle detection over the dependency
    /// graph. Prints every cycle edge with its offending qutex name and
    /// returns whether any cycle exists.
    pub fn confirm_gridlock(&self) -> bool {
        let entries = self.entries.lock();
        let graph = Self::graph_from(&entries);
        if !graph.has_cycles() {
            return false;
        }

        let cycles = graph.find_cycles();
        eprintln!(
            "CIRCULAR DEPENDENCIES DETECTED: found {} cycle(s) in lock dependency graph:",
            cycles.len(),
        );
        for (index, cycle) in cycles.iter().enumerate() {
            eprintln!("  Cycle {}:", index + 1);
            // find_cycles closes each cycle with a repeated node, so
            // pairwise windows cover the wrap-around edge too.
            for edge in cycle.windows(2) {
                Self::print_dependency(&entries, edge[0], edge[1]);
            }
        }
        true
    }

    fn graph_from(
        entries: &HashMap<ContinuationId, TrackerEntry>,
    ) -> DependencyGraph<ContinuationId> {
        let mut graph = DependencyGraph::new();
        for id in entries.keys() {
            graph.add_node(*id);
        }
        for (id, entry) in entries {
            for (other_id, other) in entries {
                if id == other_id {
                    continue;
                }
                if other.held.iter().any(|held| Arc::ptr_eq(held, &entry.wanted)) {
                    graph.add_edge(*id, *other_id);
                }
            }
        }
        graph
    }

    fn print_dependency(
        entries: &HashMap<ContinuationId, TrackerEntry>,
        from: ContinuationId,
        to: ContinuationId,
    ) {
        let to_ptr = entries
            .get(&to)
            .map(|entry| entry.link.continuation_ptr())
            .unwrap_or(std::ptr::null());
        match entries.get(&from) {
            Some(entry) => eprintln!(
                "    continuation @{:?} wants lock[\"{}\"], held by continuation @{to_ptr:?}",
                entry.link.continuation_ptr(),
                entry.wanted.name(),
            ),
            None => eprintln!("    continuation {from:?} -> continuation {to:?}"),
        }
    }
}

impl Default for AcquisitionHistoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AcquisitionHistoryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionHistoryTracker")
            .field("entries", &self.len())
            .finish()
    }
}
