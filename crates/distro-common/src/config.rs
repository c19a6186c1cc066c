// Lock configuration
// Provides lease, wake-up and watch settings for the distributed read-write lock

use std::time::Duration;

use anyhow::Context;
use config::{Config, Environment};
use serde::{Deserialize, Serialize};

/// Environment variable prefix read by [`LockConfig::from_env`]
pub const ENV_PREFIX: &str = "DISTRO_LOCK";

/// Configuration for the distributed read-write lock
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Write-lease TTL in milliseconds (0 = leases disabled)
    /// An expired writer claim may be reclaimed by any waiting actor
    pub writer_lease_ms: u64,

    /// Longest time a waiter sleeps on a watch before re-reading the record
    /// 0 derives a third of the lease when leases are enabled, otherwise waits on the watch alone
    pub recheck_interval_ms: u64,

    /// Renew the write lease while a scoped write section is running
    pub auto_renew: bool,

    /// Per-key change channel capacity for the in-memory store
    pub watch_channel_capacity: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            writer_lease_ms: 0,
            recheck_interval_ms: 0,
            auto_renew: true,
            watch_channel_capacity: 64,
        }
    }
}

impl LockConfig {
    /// Create a config with write leases enabled
    pub fn with_lease(writer_lease_ms: u64) -> Self {
        Self {
            writer_lease_ms,
            ..Default::default()
        }
    }

    /// Load from an already built `config::Config`, falling back to defaults for missing keys
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        config
            .clone()
            .try_deserialize::<LockConfig>()
            .context("invalid lock configuration")
    }

    /// Load from `DISTRO_LOCK_*` environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Config::builder()
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .context("failed to read lock configuration from environment")?;
        Self::from_config(&config)
    }

    pub fn leases_enabled(&self) -> bool {
        self.writer_lease_ms > 0
    }

    /// Get the write lease as Duration, if enabled
    pub fn writer_lease(&self) -> Option<Duration> {
        self.leases_enabled()
            .then(|| Duration::from_millis(self.writer_lease_ms))
    }

    /// Get the wake-up interval used while waiting on a watch
    ///
    /// With leases enabled this is never longer than a third of the lease, so
    /// waiters and auto-renewal run before a claim can expire.
    pub fn recheck_interval(&self) -> Option<Duration> {
        let explicit =
            (self.recheck_interval_ms > 0).then(|| Duration::from_millis(self.recheck_interval_ms));
        let lease_bound = self
            .writer_lease()
            .map(|lease| (lease / 3).max(Duration::from_millis(1)));
        match (explicit, lease_bound) {
            (Some(explicit), Some(bound)) => Some(explicit.min(bound)),
            (explicit, bound) => explicit.or(bound),
        }
    }
}

/// Configuration for the tracing subscriber installed by [`crate::logging::init_logging`]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    pub level: String,
    pub with_target: bool,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: true,
            ansi: true,
        }
    }
}
