use std::fmt::Debug;
use std::hash::Hash;

/// MemberId is whatever the cluster uses to tell its members apart. The shipping layer only needs
/// to compare, hash and log it.
pub trait MemberId: Clone + Debug + Eq + Hash + Send + Sync + 'static {}

impl<T> MemberId for T where T: Clone + Debug + Eq + Hash + Send + Sync + 'static {}

/// ReplicaId...or maybe it should be NodeId or ServerId. Idk.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        ReplicaId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}
