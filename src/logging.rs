//! Tracing setup.
//!
//! The library only emits `tracing` events; installing a subscriber is left to
//! the embedding binary. [`init`] is a convenience for binaries and tests.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Install a stderr subscriber with compact formatting.
///
/// `RUST_LOG` takes precedence; `level` is used when it is unset or invalid.
/// Returns false if a global subscriber was already installed.
///
/// ```bash
/// RUST_LOG=taskloom=debug my-binary
/// ```
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init()
        .is_ok()
}

/// [`init`] with the configured fallback level.
pub fn init_from(config: &LoggingConfig) -> bool {
    init(&config.level)
}
