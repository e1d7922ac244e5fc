//! Bridge configuration

mod schema;
mod store;

pub use schema::{BridgeConfig, ChannelConfig, DeviceConfig, TelemetryConfig};
pub use store::{ConfigChange, ConfigStore};
