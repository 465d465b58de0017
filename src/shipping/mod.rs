mod actor;
mod entry_reader;
mod leader_context;
mod manager;
mod messages;
mod ship_command;
mod shipper;
mod stop_signal;
mod timers;

pub use leader_context::LeaderContext;
pub use manager::RaftLogShippingManager;
pub use messages::AppendEntriesRequest;
pub use messages::ChannelOutbound;
pub use messages::Heartbeat;
pub use messages::LogCompactionInfo;
pub use messages::LogIdentity;
pub use messages::Outbound;
pub use messages::RaftMessage;
pub use ship_command::ShipCommand;
pub use timers::Clock;
pub use timers::RealClock;

// So wiring can assemble shippers.
pub(crate) use shipper::ShipperConfig;
