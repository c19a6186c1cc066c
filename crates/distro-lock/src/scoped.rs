//! Scoped Lock Wrapper
//!
//! Runs a unit of work between a matching acquire and release. The release
//! happens on every exit path: success, operation error, and cancellation
//! (via the guard's background release on drop).

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use distro_common::DistroRwLockError;
use distro_kv::KvStore;

use crate::guard::LockGuard;
use crate::rwlock::{DistroRwLock, LockMode};

/// Failure of a scoped run
#[derive(Error, Debug)]
pub enum ScopedLockError<E> {
    /// The lock could not be acquired; the operation never ran
    #[error("lock acquisition failed: {0}")]
    Acquire(#[source] DistroRwLockError),

    #[error("operation failed: {0}")]
    Operation(E),

    /// The operation succeeded but the lock could not be released
    #[error("lock release failed: {0}")]
    Release(#[source] DistroRwLockError),

    #[error("operation failed: {operation}; lock release also failed: {release}")]
    OperationAndRelease {
        operation: E,
        release: DistroRwLockError,
    },
}

impl<E> ScopedLockError<E> {
    /// The operation's own error, if it ran and failed
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            ScopedLockError::Operation(e) => Some(e),
            ScopedLockError::OperationAndRelease { operation, .. } => Some(operation),
            _ => None,
        }
    }

    /// The lock error, if acquisition or release failed
    pub fn lock_error(&self) -> Option<&DistroRwLockError> {
        match self {
            ScopedLockError::Acquire(e) | ScopedLockError::Release(e) => Some(e),
            ScopedLockError::OperationAndRelease { release, .. } => Some(release),
            ScopedLockError::Operation(_) => None,
        }
    }

    pub fn is_release_failure(&self) -> bool {
        matches!(
            self,
            ScopedLockError::Release(_) | ScopedLockError::OperationAndRelease { .. }
        )
    }
}

/// A unit of work bound to a lock on one resource. Defaults to write mode.
pub struct ScopedLock<F> {
    operation: Arc<F>,
    lock: DistroRwLock,
    resource: Arc<str>,
    mode: LockMode,
}

impl<F> Clone for ScopedLock<F> {
    fn clone(&self) -> Self {
        Self {
            operation: self.operation.clone(),
            lock: self.lock.clone(),
            resource: self.resource.clone(),
            mode: self.mode,
        }
    }
}

impl<F> ScopedLock<F> {
    pub fn new(operation: F, store: Arc<dyn KvStore>, resource: impl Into<String>) -> Self {
        Self::with_lock(operation, DistroRwLock::new(store), resource)
    }

    /// Share an existing lock handle (and its configuration and statistics)
    pub fn with_lock(operation: F, lock: DistroRwLock, resource: impl Into<String>) -> Self {
        Self {
            operation: Arc::new(operation),
            lock,
            resource: resource.into().into(),
            mode: LockMode::Write,
        }
    }

    pub fn with_mode(mut self, mode: LockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Run under a read lease instead of exclusive access
    pub fn shared(self) -> Self {
        self.with_mode(LockMode::Read)
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn lock(&self) -> &DistroRwLock {
        &self.lock
    }

    /// Acquire, run the operation exactly once, release.
    pub async fn run<I, O, E, Fut>(&self, input: I) -> Result<O, ScopedLockError<E>>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<O, E>>,
    {
        let guard = self
            .lock
            .guard(&self.resource, self.mode)
            .await
            .map_err(ScopedLockError::Acquire)?;

        let outcome = self.run_holding(&guard, input).await;
        let released = guard.release().await;

        match (outcome, released) {
            (Ok(output), Ok(())) => Ok(output),
            (Ok(_), Err(release)) => Err(ScopedLockError::Release(release)),
            (Err(operation), Ok(())) => Err(ScopedLockError::Operation(operation)),
            (Err(operation), Err(release)) => {
                Err(ScopedLockError::OperationAndRelease { operation, release })
            }
        }
    }

    /// Run the operation, renewing a write lease in the background while it executes
    async fn run_holding<I, O, E, Fut>(&self, guard: &LockGuard, input: I) -> Result<O, E>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<O, E>>,
    {
        let config = self.lock.config();
        let renew_every = match (self.mode, config.auto_renew, config.recheck_interval()) {
            (LockMode::Write, true, Some(interval)) if config.leases_enabled() => interval,
            _ => return (self.operation)(input).await,
        };

        let operation = (self.operation)(input);
        tokio::pin!(operation);
        let mut ticker = tokio::time::interval(renew_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                output = &mut operation => return output,
                _ = ticker.tick() => {
                    match guard.renew().await {
                        Ok(()) => debug!(resource = %self.resource, "Renewed write lease during scoped run"),
                        Err(e) => warn!(resource = %self.resource, error = %e, "Write lease renewal failed during scoped run"),
                    }
                }
            }
        }
    }
}
