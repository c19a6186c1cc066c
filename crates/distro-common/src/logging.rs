//! Console logging bootstrap.
//!
//! Installs a `tracing` registry with an `EnvFilter` and a `fmt` layer.
//! `RUST_LOG` takes precedence over [`LoggingConfig::level`].

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;

/// Install the global subscriber.
///
/// Returns `Ok(false)` when a global subscriber was already installed.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<bool> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(config.with_target)
                .with_ansi(config.ansi),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(level = %config.level, "Logging initialized");
    }
    Ok(installed)
}
