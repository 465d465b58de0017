mod membership;
mod peers;

pub use membership::ClusterMembership;
pub use membership::MembershipListener;
pub use membership::RaftMembership;
pub use peers::MemberId;
pub use peers::ReplicaId;
