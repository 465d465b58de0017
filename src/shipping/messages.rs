use crate::cluster::MemberId;
use crate::commitlog::{Index, RaftLogEntry, Term};
use tokio::sync::mpsc;

/// Identifies the replicated log (i.e. the cluster) a message belongs to, so a follower can reject
/// traffic from a different cluster.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct LogIdentity(String);

impl LogIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        LogIdentity(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Messages the leader ships to followers. Framing and serialization happen in the transport.
#[derive(Clone, Debug, PartialEq)]
pub enum RaftMessage<M> {
    AppendEntries(AppendEntriesRequest<M>),
    Heartbeat(Heartbeat<M>),
    LogCompactionInfo(LogCompactionInfo<M>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct AppendEntriesRequest<M> {
    pub leader_id: M,
    pub term: Term,
    // `None` when the first entry is the very first entry of the log.
    pub prev_log_index: Option<Index>,
    pub prev_log_term: Term,
    // Empty for a pure probe.
    pub entries: Vec<RaftLogEntry>,
    pub leader_commit_index: Option<Index>,
    pub log_identity: LogIdentity,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Heartbeat<M> {
    pub leader_id: M,
    pub term: Term,
    pub leader_commit_index: Option<Index>,
    pub commit_index_term: Term,
    pub log_identity: LogIdentity,
}

/// Tells a follower that the entries it needs for incremental catch-up have been pruned.
#[derive(Clone, Debug, PartialEq)]
pub struct LogCompactionInfo<M> {
    pub leader_id: M,
    pub term: Term,
    pub compacted_prev_index: Index,
    pub log_identity: LogIdentity,
}

/// Outbound is fire-and-forget, at-most-once delivery to a peer. Nothing is reported back; the
/// shippers find out about lost messages through their retry timers.
pub trait Outbound<M: MemberId>: Send + Sync {
    fn send(&self, to: &M, message: RaftMessage<M>);
}

/// Outbound which hands every message to a channel, for a transport task (or a test) to drain.
pub struct ChannelOutbound<M> {
    sender: mpsc::UnboundedSender<(M, RaftMessage<M>)>,
}

impl<M: MemberId> ChannelOutbound<M> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(M, RaftMessage<M>)>) {
        let (sender, receiver) = mpsc::unbounded_channel();

        (ChannelOutbound { sender }, receiver)
    }
}

impl<M: MemberId> Outbound<M> for ChannelOutbound<M> {
    fn send(&self, to: &M, message: RaftMessage<M>) {
        // The receiving side going away is indistinguishable from a lost message.
        let _ = self.sender.send((to.clone(), message));
    }
}
