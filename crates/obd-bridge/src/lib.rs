//! OBD Bridge
//!
//! Runs the ELM327 link and its session state machines, and speaks SVIP
//! to a remote consumer: decoded data points go out as `DPN_ARRIVED`,
//! link changes as `OOB_ARRIVED`, and requests come back in.

pub mod bridge;
pub mod config;
pub mod error;
pub mod lookup;

pub use bridge::Bridge;
pub use config::{BridgeConfig, LoggingConfig, SniffRuleEntry, DEFAULT_CONFIG_PATH};
pub use error::BridgeError;
pub use lookup::{CacheScope, CachedLookup};

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install the global subscriber. Logs go to stderr; stdout carries SVIP.
pub fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let installed = if config.json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    installed.expect("Failed to set tracing subscriber");
}
