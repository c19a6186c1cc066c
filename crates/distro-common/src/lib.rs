//! Distro Common - Shared types for the distributed read-write lock
//!
//! This crate provides:
//! - Error taxonomy shared by the store, keyed-value and lock layers
//! - Lock and logging configuration
//! - Logging bootstrap
//! - Time helpers

pub mod config;
pub mod error;
pub mod logging;

// Re-exports for convenience
pub use config::{LockConfig, LoggingConfig};
pub use error::{DistroRwLockError, Result};
pub use logging::init_logging;

/// Current wall-clock time in Unix milliseconds
pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
