mod api;
mod cluster;
mod commitlog;
mod shipping;

pub use api::create_log_shipping_manager;
pub use api::LogShippingConfig;
pub use api::LogShippingCreationError;
pub use api::ShippingOptions;
pub use cluster::ClusterMembership;
pub use cluster::MemberId;
pub use cluster::MembershipListener;
pub use cluster::RaftMembership;
pub use cluster::ReplicaId;
pub use commitlog::InFlightCache;
pub use commitlog::InMemoryInFlightCache;
pub use commitlog::InMemoryRaftLog;
pub use commitlog::Index;
pub use commitlog::LogCursor;
pub use commitlog::RaftLogEntry;
pub use commitlog::ReadableRaftLog;
pub use commitlog::Term;
pub use shipping::AppendEntriesRequest;
pub use shipping::ChannelOutbound;
pub use shipping::Clock;
pub use shipping::Heartbeat;
pub use shipping::LeaderContext;
pub use shipping::LogCompactionInfo;
pub use shipping::LogIdentity;
pub use shipping::Outbound;
pub use shipping::RaftLogShippingManager;
pub use shipping::RaftMessage;
pub use shipping::RealClock;
pub use shipping::ShipCommand;

