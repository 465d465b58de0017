use crate::api::options::{ShippingOptions, ShippingOptionsValidated};
use crate::cluster::{MemberId, RaftMembership};
use crate::commitlog::{InFlightCache, ReadableRaftLog};
use crate::shipping::{LogIdentity, Outbound, RaftLogShippingManager, RealClock, ShipperConfig};
use std::convert::TryFrom;
use std::sync::Arc;

pub struct LogShippingConfig<M: MemberId> {
    pub my_member_id: M,
    // Identifies this replicated log to followers, e.g. the cluster or database name.
    pub log_identity: String,
    pub raft_log: Arc<dyn ReadableRaftLog>,
    pub in_flight_cache: Arc<dyn InFlightCache>,
    pub outbound: Arc<dyn Outbound<M>>,
    pub membership: Arc<dyn RaftMembership<M>>,
    pub info_logger: slog::Logger,
    pub options: ShippingOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum LogShippingCreationError {
    #[error("Illegal options for configuring log shipping: {0}")]
    IllegalShippingOptions(String),
    #[error("my member ID is not a replication member")]
    MeNotInCluster,
    #[error("Log shipping must be created from within a tokio runtime")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// Creates the leader's shipping manager. It registers itself with `membership` and stays idle
/// until `start()` is called with the leader's first `LeaderContext`.
pub fn create_log_shipping_manager<M: MemberId>(
    config: LogShippingConfig<M>,
) -> Result<Arc<RaftLogShippingManager<M>>, LogShippingCreationError> {
    let options = ShippingOptionsValidated::try_from(config.options)
        .map_err(|e| LogShippingCreationError::IllegalShippingOptions(e.to_string()))?;

    if !config.membership.replication_members().contains(&config.my_member_id) {
        return Err(LogShippingCreationError::MeNotInCluster);
    }

    let runtime = tokio::runtime::Handle::try_current()?;

    let logger = config
        .info_logger
        .new(slog::o!("Log" => config.log_identity.clone()));

    let shipper_config = ShipperConfig {
        leader: config.my_member_id.clone(),
        log_identity: LogIdentity::new(config.log_identity),
        raft_log: config.raft_log,
        in_flight: config.in_flight_cache,
        outbound: config.outbound,
        clock: RealClock,
        options,
    };

    Ok(RaftLogShippingManager::new(
        logger,
        config.my_member_id,
        config.membership,
        shipper_config,
        runtime,
    ))
}
