pub mod address;
pub mod base36;
pub mod config;
pub mod logging;
pub mod relay;

pub use address::MessageId;
pub use config::{Config, ConfigError};
pub use relay::{RelayDenied, RelayTable};
