//! Configuration management for Vireo.
//!
//! - [`schema`]: typed destination, transport, network and broker settings
//! - [`validator`]: eager consistency rules
//! - [`loader`]: TOML + environment layering
//!
//! ```rust
//! use vireo_core::config::ConfigLoader;
//!
//! let config = ConfigLoader::new()
//!     .load_from_str("[transport]\nping_interval_secs = 10\n")
//!     .unwrap();
//! assert_eq!(config.transport.ping_interval_secs, 10);
//! ```

pub mod loader;
pub mod schema;
pub mod validator;

use std::path::Path;

pub use loader::ConfigLoader;
pub use schema::{
    BrokerConfig, DestinationDescriptor, NetworkConfig, StorageSyncMethod, TransportSettings,
};
pub use validator::{ConfigValidator, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Load and validate a configuration file with environment overrides.
///
/// # Errors
/// Returns an error if the file cannot be read, parsed or validated.
pub fn load_from_file(path: impl AsRef<Path>) -> crate::Result<BrokerConfig> {
    ConfigLoader::new().load_from_file(path)
}
