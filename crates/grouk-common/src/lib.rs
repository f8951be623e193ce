//! Shared utilities for the Grouk binaries: logging setup, JSON config
//! files, token comparison, and the connect-request codec spoken at the
//! start of every tunneled stream.

#![forbid(unsafe_code)]

pub mod config;
pub mod helpers;
pub mod protocol;

pub use config::{load_json, ConfigError};
pub use helpers::constant_time_eq;
pub use protocol::{
    ConnectRequest, ProtocolError, TargetHost, CONNECT_FAILED, CONNECT_SUCCESS, LEN_PREFIX_SIZE,
    MAX_REQUEST_LEN,
};

/// Initialize tracing.
///
/// Log level is controlled by the `RUST_LOG` environment variable and falls
/// back to `default_level` when it is unset or invalid.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
