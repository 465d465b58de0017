use crate::cluster::MemberId;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, Weak};

pub trait MembershipListener: Send + Sync {
    fn on_membership_changed(&self);
}

/// RaftMembership is the leader's view of which members the log must be replicated to.
pub trait RaftMembership<M: MemberId>: Send + Sync {
    fn replication_members(&self) -> HashSet<M>;

    /// Listeners are held weakly. A listener that has been dropped is silently forgotten.
    fn register_listener(&self, listener: Weak<dyn MembershipListener>);
}

/// In-memory membership. Whoever decides membership (config, joint consensus, ...) calls
/// `set_replication_members()`, and every live listener gets notified.
pub struct ClusterMembership<M: MemberId> {
    state: Mutex<State<M>>,
}

struct State<M> {
    members: HashSet<M>,
    listeners: Vec<Weak<dyn MembershipListener>>,
}

impl<M: MemberId> ClusterMembership<M> {
    pub fn new(members: impl IntoIterator<Item = M>) -> Self {
        ClusterMembership {
            state: Mutex::new(State {
                members: members.into_iter().collect(),
                listeners: Vec::new(),
            }),
        }
    }

    pub fn set_replication_members(&self, members: impl IntoIterator<Item = M>) {
        let listeners = {
            let mut state = self.lock();
            state.members = members.into_iter().collect();
            state.listeners.retain(|listener| listener.strong_count() > 0);
            state.listeners.clone()
        };

        // Notify without holding the lock. Listeners read members back from us.
        for listener in listeners {
            if let Some(listener) = listener.upgrade() {
                listener.on_membership_changed();
            }
        }
    }

    pub fn add_member(&self, member: M) {
        let mut members = self.replication_members();
        members.insert(member);
        self.set_replication_members(members);
    }

    pub fn remove_member(&self, member: &M) {
        let mut members = self.replication_members();
        members.remove(member);
        self.set_replication_members(members);
    }

    fn lock(&self) -> MutexGuard<'_, State<M>> {
        self.state.lock().expect("ClusterMembership mutex guard poison")
    }
}

impl<M: MemberId> RaftMembership<M> for ClusterMembership<M> {
    fn replication_members(&self) -> HashSet<M> {
        self.lock().members.clone()
    }

    fn register_listener(&self, listener: Weak<dyn MembershipListener>) {
        self.lock().listeners.push(listener);
    }
}
