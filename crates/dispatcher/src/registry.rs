//! SinkRegistry - generation-stamped snapshot-and-swap sink list
//!
//! A dispatch thread takes an `Arc` snapshot of the sink list for each
//! batch, so no lock is held while sinks run. Mutations publish a new
//! snapshot under a bumped generation; removal then waits until every
//! snapshot older than that generation has been released.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use contracts::{LogSink, SinkStats};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// Handle returned by `add`, used to remove the sink again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(u64);

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink#{}", self.0)
    }
}

/// Registered sink
#[derive(Clone)]
pub struct SinkEntry {
    pub id: SinkId,
    pub sink: Arc<dyn LogSink>,
}

struct RegistryState {
    generation: u64,
    snapshot: Arc<Vec<SinkEntry>>,
    next_id: u64,
    /// Pinned snapshot count per generation; a detached loop and its
    /// successor may both hold one
    pinned: BTreeMap<u64, usize>,
    dispatch_threads: Vec<ThreadId>,
}

impl RegistryState {
    fn pinned_before(&self, generation: u64) -> bool {
        self.pinned.range(..generation).next().is_some()
    }
}

/// Thread-safe ordered list of sinks
pub struct SinkRegistry {
    state: Mutex<RegistryState>,
    released: Condvar,
}

impl Default for SinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                generation: 0,
                snapshot: Arc::new(Vec::new()),
                next_id: 1,
                pinned: BTreeMap::new(),
                dispatch_threads: Vec::new(),
            }),
            released: Condvar::new(),
        }
    }

    /// Append a sink; dispatch order is registration order
    pub fn add(&self, sink: Arc<dyn LogSink>) -> SinkId {
        let mut state = self.state.lock();
        let id = SinkId(state.next_id);
        state.next_id += 1;

        let mut entries = state.snapshot.as_ref().clone();
        debug!(sink = %sink.name(), id = %id, "Sink registered");
        entries.push(SinkEntry { id, sink });
        state.snapshot = Arc::new(entries);
        state.generation += 1;
        id
    }

    /// Remove a sink and wait until no in-flight dispatch can still reach it
    ///
    /// Returns `None` for unknown ids. When called from a dispatch thread
    /// (a sink removing itself) the wait is skipped.
    pub fn remove(&self, id: SinkId) -> Option<Arc<dyn LogSink>> {
        let mut state = self.state.lock();
        let position = state.snapshot.iter().position(|entry| entry.id == id)?;

        let mut entries = state.snapshot.as_ref().clone();
        let removed = entries.remove(position);
        state.snapshot = Arc::new(entries);
        state.generation += 1;
        let published = state.generation;

        if !state.dispatch_threads.contains(&thread::current().id()) {
            self.released
                .wait_while(&mut state, |s| s.pinned_before(published));
        }

        debug!(sink = %removed.sink.name(), id = %id, "Sink removed");
        Some(removed.sink)
    }

    /// Take the current snapshot for one dispatch
    pub fn acquire(&self) -> SnapshotGuard<'_> {
        let mut state = self.state.lock();
        let generation = state.generation;
        *state.pinned.entry(generation).or_insert(0) += 1;
        SnapshotGuard {
            registry: self,
            generation,
            entries: Arc::clone(&state.snapshot),
        }
    }

    /// Current sinks, without marking a dispatch in flight
    pub fn sinks(&self) -> Vec<Arc<dyn LogSink>> {
        self.state
            .lock()
            .snapshot
            .iter()
            .map(|entry| Arc::clone(&entry.sink))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().snapshot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Vec<SinkStats> {
        self.sinks().iter().map(|sink| sink.stats()).collect()
    }

    /// Record a thread that dispatches
    pub fn set_dispatch_thread(&self, thread: ThreadId) {
        let mut state = self.state.lock();
        if !state.dispatch_threads.contains(&thread) {
            state.dispatch_threads.push(thread);
        }
    }

    pub fn clear_dispatch_thread(&self, thread: ThreadId) {
        self.state.lock().dispatch_threads.retain(|t| *t != thread);
    }

    pub fn is_dispatch_thread(&self) -> bool {
        self.state
            .lock()
            .dispatch_threads
            .contains(&thread::current().id())
    }

    fn release(&self, generation: u64) {
        let mut state = self.state.lock();
        if let Some(count) = state.pinned.get_mut(&generation) {
            *count -= 1;
            if *count == 0 {
                state.pinned.remove(&generation);
            }
        }
        drop(state);
        self.released.notify_all();
    }
}

/// Snapshot held for the duration of one dispatch
pub struct SnapshotGuard<'a> {
    registry: &'a SinkRegistry,
    generation: u64,
    entries: Arc<Vec<SinkEntry>>,
}

impl SnapshotGuard<'_> {
    pub fn entries(&self) -> &[SinkEntry] {
        &self.entries
    }
}

impl Drop for SnapshotGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{ContractError, FlushOutcome, LogRecord};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct NamedSink(&'static str);

    impl LogSink for NamedSink {
        fn name(&self) -> &str {
            self.0
        }

        fn consume(&self, _batch: &[LogRecord]) -> Result<(), ContractError> {
            Ok(())
        }

        fn flush(&self) -> FlushOutcome {
            FlushOutcome::Completed
        }

        fn stats(&self) -> SinkStats {
            SinkStats {
                name: self.0.to_string(),
                ..Default::default()
            }
        }
    }

    #[test]
    fn test_registration_order() {
        let registry = SinkRegistry::new();
        registry.add(Arc::new(NamedSink("a")));
        let b = registry.add(Arc::new(NamedSink("b")));
        registry.add(Arc::new(NamedSink("c")));

        let names: Vec<_> = registry.sinks().iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, ["a", "b", "c"]);

        let removed = registry.remove(b).unwrap();
        assert_eq!(removed.name(), "b");
        assert_eq!(registry.len(), 2);
        assert!(registry.remove(b).is_none());
    }

    #[test]
    fn test_snapshot_unaffected_by_later_add() {
        let registry = SinkRegistry::new();
        registry.add(Arc::new(NamedSink("a")));
        let guard = registry.acquire();
        registry.add(Arc::new(NamedSink("b")));
        assert_eq!(guard.entries().len(), 1);
        drop(guard);
        assert_eq!(registry.acquire().entries().len(), 2);
    }

    #[test]
    fn test_remove_waits_for_in_flight_snapshot() {
        let registry = Arc::new(SinkRegistry::new());
        let id = registry.add(Arc::new(NamedSink("a")));
        let removed = Arc::new(AtomicBool::new(false));

        let guard = registry.acquire();
        let remover = {
            let registry = Arc::clone(&registry);
            let removed = Arc::clone(&removed);
            std::thread::spawn(move || {
                registry.remove(id);
                removed.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!removed.load(Ordering::SeqCst));
        drop(guard);

        remover.join().unwrap();
        assert!(removed.load(Ordering::SeqCst));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_waits_for_every_pinned_snapshot() {
        let registry = Arc::new(SinkRegistry::new());
        let id = registry.add(Arc::new(NamedSink("a")));
        let removed = Arc::new(AtomicBool::new(false));

        // A detached loop and its replacement each hold a snapshot
        let old_loop = registry.acquire();
        let new_loop = registry.acquire();
        let remover = {
            let registry = Arc::clone(&registry);
            let removed = Arc::clone(&removed);
            std::thread::spawn(move || {
                registry.remove(id);
                removed.store(true, Ordering::SeqCst);
            })
        };

        drop(new_loop);
        std::thread::sleep(Duration::from_millis(50));
        assert!(!removed.load(Ordering::SeqCst));
        assert_eq!(old_loop.entries().len(), 1);

        drop(old_loop);
        remover.join().unwrap();
        assert!(removed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_remove_from_dispatch_thread_does_not_wait() {
        let registry = SinkRegistry::new();
        let id = registry.add(Arc::new(NamedSink("a")));
        registry.set_dispatch_thread(std::thread::current().id());

        let _guard = registry.acquire();
        assert!(registry.remove(id).is_some());
    }
}
