//! This mod is meant to hold the code for the library's client-facing API.
mod options;
mod wiring;

pub use options::ShippingOptions;
pub use wiring::create_log_shipping_manager;
pub use wiring::LogShippingConfig;
pub use wiring::LogShippingCreationError;

// So shippers can read their tuning.
pub(crate) use options::ShippingOptionsValidated;
