use crate::cluster::MemberId;
use crate::commitlog::{Index, RaftLogEntry, Term};

/// ShipCommand is what the Raft core decided about replication while handling one of its inputs.
/// The shipping manager routes each command to the shipper(s) it concerns.
#[derive(Clone, Debug, PartialEq)]
pub enum ShipCommand<M> {
    /// `target` rejected an append because its log does not contain our predecessor entry.
    Mismatch {
        target: M,
        last_remote_append_index: Option<Index>,
    },
    /// `target` accepted an append and now matches our log up to `new_match_index`.
    Match {
        target: M,
        new_match_index: Option<Index>,
    },
    /// The leader appended `entries` right after `prev_log_index`.
    NewEntries {
        prev_log_index: Option<Index>,
        prev_log_term: Term,
        entries: Vec<RaftLogEntry>,
    },
    /// The leader's commit index advanced.
    CommitUpdate,
}

impl<M: MemberId> ShipCommand<M> {
    pub(crate) fn applies_to(&self, member: &M) -> bool {
        match self {
            ShipCommand::Mismatch { target, .. } | ShipCommand::Match { target, .. } => target == member,
            ShipCommand::NewEntries { .. } | ShipCommand::CommitUpdate => true,
        }
    }
}
