use crate::commitlog::{Index, RaftLogEntry};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// InFlightCache holds recently appended entries, so shippers can forward them without going back
/// to log storage. A miss is never an error; the caller falls back to the log.
pub trait InFlightCache: Send + Sync {
    fn retrieve(&self, index: Index) -> Option<RaftLogEntry>;
}

/// Bounded cache which evicts the oldest entries once it holds more than `max_entries`.
pub struct InMemoryInFlightCache {
    max_entries: usize,
    entries: Mutex<BTreeMap<Index, RaftLogEntry>>,
}

impl InMemoryInFlightCache {
    pub fn new(max_entries: usize) -> Self {
        InMemoryInFlightCache {
            max_entries,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn put(&self, index: Index, entry: RaftLogEntry) {
        let mut entries = self.lock();
        entries.insert(index, entry);

        while entries.len() > self.max_entries {
            let oldest = match entries.keys().next() {
                Some(oldest) => *oldest,
                None => break,
            };
            entries.remove(&oldest);
        }
    }

    /// Drops `from` and everything after it, mirroring a log truncation.
    pub fn truncate(&self, from: Index) {
        self.lock().split_off(&from);
    }

    /// Drops everything up to and including `up_to`, mirroring a log prune.
    pub fn prune(&self, up_to: Index) {
        let mut entries = self.lock();
        let retained = entries.split_off(&up_to.plus(1));
        *entries = retained;
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Index, RaftLogEntry>> {
        self.entries.lock().expect("InMemoryInFlightCache mutex guard poison")
    }
}

impl InFlightCache for InMemoryInFlightCache {
    fn retrieve(&self, index: Index) -> Option<RaftLogEntry> {
        self.lock().get(&index).cloned()
    }
}
