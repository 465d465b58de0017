use crate::commitlog::{Index, LogCursor, RaftLogEntry, ReadableRaftLog, Term};
use std::collections::VecDeque;
use std::io;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

// Durability is somebody else's problem. This log exists so the shipping protocol can be exercised
// against something that appends, truncates and prunes like the real thing.
pub struct InMemoryRaftLog {
    inner: RwLock<Inner>,
}

struct Inner {
    // Last pruned index and its term. Entries start at `prev_index + 1`.
    prev_index: Option<Index>,
    prev_term: Term,
    entries: VecDeque<RaftLogEntry>,
}

impl Inner {
    fn first_index(&self) -> Index {
        Index::after(self.prev_index)
    }

    fn append_index(&self) -> Option<Index> {
        match self.entries.len() {
            0 => self.prev_index,
            n => Some(self.first_index().plus(n as u64 - 1)),
        }
    }

    fn offset(&self, index: Index) -> Option<usize> {
        let first = self.first_index();
        if index < first {
            return None;
        }
        let offset = (index.as_u64() - first.as_u64()) as usize;
        if offset < self.entries.len() {
            Some(offset)
        } else {
            None
        }
    }

    fn entry(&self, index: Index) -> Option<&RaftLogEntry> {
        self.offset(index).and_then(|offset| self.entries.get(offset))
    }
}

impl InMemoryRaftLog {
    pub fn new() -> Self {
        InMemoryRaftLog {
            inner: RwLock::new(Inner {
                prev_index: None,
                prev_term: Term::new(0),
                entries: VecDeque::new(),
            }),
        }
    }

    /// Appends `entry` at the next index and returns that index.
    pub fn append(&self, entry: RaftLogEntry) -> Index {
        let mut inner = self.write();
        let index = Index::after(inner.append_index());
        inner.entries.push_back(entry);
        index
    }

    /// Removes `index` and every entry after it. Pruned entries are never truncated.
    pub fn truncate(&self, index: Index) {
        let mut inner = self.write();
        let first = inner.first_index();
        let keep = if index <= first {
            0
        } else {
            (index.as_u64() - first.as_u64()) as usize
        };
        inner.entries.truncate(keep);
    }

    /// Discards every entry up to and including `up_to`, remembering the term of `up_to` so the
    /// predecessor of the earliest retained entry can still be matched against.
    pub fn prune(&self, up_to: Index) {
        let mut inner = self.write();
        if Some(up_to) <= inner.prev_index {
            return;
        }
        let up_to = match inner.append_index() {
            Some(append_index) if up_to > append_index => append_index,
            Some(_) => up_to,
            None => return,
        };

        while inner.first_index() <= up_to {
            match inner.entries.pop_front() {
                Some(entry) => {
                    let pruned = inner.first_index();
                    inner.prev_index = Some(pruned);
                    inner.prev_term = entry.term;
                }
                None => break,
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("InMemoryRaftLog read lock poison")
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("InMemoryRaftLog write lock poison")
    }
}

impl Default for InMemoryRaftLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadableRaftLog for InMemoryRaftLog {
    fn append_index(&self) -> Option<Index> {
        self.read().append_index()
    }

    fn prev_index(&self) -> Option<Index> {
        self.read().prev_index
    }

    fn read_entry_term(&self, index: Index) -> Result<Option<Term>, io::Error> {
        let inner = self.read();
        if Some(index) == inner.prev_index {
            return Ok(Some(inner.prev_term));
        }

        Ok(inner.entry(index).map(|entry| entry.term))
    }

    fn cursor(&self, from: Index) -> Result<LogCursor<'_>, io::Error> {
        Ok(Box::new(InMemoryCursor { log: self, next: from }))
    }
}

// Takes the read lock per entry so a long batch read never stalls appends.
struct InMemoryCursor<'a> {
    log: &'a InMemoryRaftLog,
    next: Index,
}

impl<'a> Iterator for InMemoryCursor<'a> {
    type Item = Result<RaftLogEntry, io::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.log.read().entry(self.next).cloned()?;
        self.next = self.next.plus(1);
        Some(Ok(entry))
    }
}
