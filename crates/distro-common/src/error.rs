//! Error types for the distro read-write lock
//!
//! This module defines:
//! - `DistroRwLockError`: the error taxonomy shared by the KV, keyed-value and lock layers
//! - `Result`: crate-wide result alias

/// Errors raised by the KV store interface, keyed-value bindings and the lock protocol
#[derive(thiserror::Error, Debug)]
pub enum DistroRwLockError {
    /// A conditional write observed a revision other than the one it expected.
    /// Always retried inside the lock; surfaces only from raw store and keyed-value calls.
    #[error("version conflict on '{key}': expected revision {expected}, found {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Caller protocol violation: double release, release without acquire, count underflow
    #[error("invalid lock state for '{key}': {reason}")]
    InvalidLockState { key: String, reason: String },

    #[error("store error: {0}")]
    StoreError(#[source] anyhow::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("watch stream closed for '{0}'")]
    WatchClosed(String),
}

impl DistroRwLockError {
    pub fn version_conflict(key: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::VersionConflict {
            key: key.into(),
            expected,
            actual,
        }
    }

    pub fn invalid_state(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLockState {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn store(err: impl Into<anyhow::Error>) -> Self {
        Self::StoreError(err.into())
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }

    /// Whether the lock layer may transparently retry after this error
    pub fn is_retryable(&self) -> bool {
        self.is_version_conflict()
    }
}

pub type Result<T> = std::result::Result<T, DistroRwLockError>;
