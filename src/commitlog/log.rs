use bytes::Bytes;
use std::{fmt, io};

/// Index is an index of an entry in the log; i.e. a log entry's index.
///
/// The first entry ever appended to a log is written at index 0. Positions which may lie before
/// the first entry (e.g. "nothing pruned yet" or "follower log is empty") are modeled as
/// `Option<Index>`, where `None` orders before every `Some(_)`.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Index(u64);

impl Index {
    pub fn new(index: u64) -> Self {
        Index(index)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index(self.0 + delta)
    }

    pub fn checked_minus(&self, delta: u64) -> Option<Index> {
        self.0.checked_sub(delta).map(Index)
    }

    /// Index of the entry immediately following `position`.
    pub fn after(position: Option<Index>) -> Index {
        position.map(|i| i.plus(1)).unwrap_or(Index(0))
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raft leadership term.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Term(u64);

impl Term {
    pub fn new(term: u64) -> Self {
        Term(term)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RaftLogEntry {
    pub term: Term,
    pub data: Bytes,
}

impl RaftLogEntry {
    pub fn new(term: Term, data: impl Into<Bytes>) -> Self {
        RaftLogEntry {
            term,
            data: data.into(),
        }
    }
}

/// Yields consecutive entries starting at the index the cursor was opened at. A cursor ends early
/// (returns `None`) when it walks past the entries the log currently retains.
pub type LogCursor<'a> = Box<dyn Iterator<Item = Result<RaftLogEntry, io::Error>> + Send + 'a>;

/// ReadableRaftLog is the read-only view of the leader's replicated log. Implementations must be
/// safe for concurrent reads; every follower's shipper reads the same log.
pub trait ReadableRaftLog: Send + Sync {
    /// Index of the most recently appended entry, or `None` if nothing was ever appended.
    fn append_index(&self) -> Option<Index>;

    /// Index immediately preceding the earliest retained entry. `None` if the log was never
    /// pruned. An empty log has `append_index() == prev_index()`.
    fn prev_index(&self) -> Option<Index>;

    /// Term of the entry at `index`. Returns `Ok(None)` if the entry is not retained (pruned or not
    /// yet appended). The term at `prev_index()` stays readable after pruning.
    fn read_entry_term(&self, index: Index) -> Result<Option<Term>, io::Error>;

    /// Opens a cursor positioned at `from`.
    fn cursor(&self, from: Index) -> Result<LogCursor<'_>, io::Error>;
}
