use crate::commitlog::{Index, Term};

/// Snapshot of the leader's term and commit index, handed in with every shipping event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LeaderContext {
    pub term: Term,
    pub commit_index: Option<Index>,
}

impl LeaderContext {
    pub fn new(term: Term, commit_index: Option<Index>) -> Self {
        LeaderContext { term, commit_index }
    }
}
