use std::convert::TryFrom;
use tokio::time::Duration;

#[derive(Clone, Debug, Default)]
pub struct ShippingOptions {
    /// How long a shipper waits for a follower to answer before resending.
    pub retry_interval: Option<Duration>,
    /// Most entries shipped in a single catch-up batch.
    pub catchup_batch_size: Option<u64>,
    /// Most entries a pipelining follower may fall behind before it drops back to catch-up.
    pub max_allowed_shipping_lag: Option<u64>,
}

#[derive(Clone, Debug)]
pub(crate) struct ShippingOptionsValidated {
    pub retry_interval: Duration,
    pub catchup_batch_size: u64,
    pub max_allowed_shipping_lag: u64,
}

impl ShippingOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.retry_interval == Duration::from_millis(0) {
            return Err("Retry interval must be greater than zero");
        }
        if self.catchup_batch_size == 0 {
            return Err("Catch-up batch size must be at least 1");
        }
        if self.max_allowed_shipping_lag == 0 {
            return Err("Max allowed shipping lag must be at least 1");
        }

        Ok(())
    }
}

impl TryFrom<ShippingOptions> for ShippingOptionsValidated {
    type Error = &'static str;

    fn try_from(options: ShippingOptions) -> Result<Self, Self::Error> {
        let values = ShippingOptionsValidated {
            retry_interval: options.retry_interval.unwrap_or(Duration::from_millis(500)),
            catchup_batch_size: options.catchup_batch_size.unwrap_or(64),
            max_allowed_shipping_lag: options.max_allowed_shipping_lag.unwrap_or(256),
        };

        values.validate()?;
        Ok(values)
    }
}
