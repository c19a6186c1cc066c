//! Held-lock guard

use tracing::{error, warn};

use distro_common::Result;

use crate::rwlock::{DistroRwLock, LockMode};

/// A held read or write lease on one resource.
///
/// Prefer [`LockGuard::release`], which reports release failures. A guard
/// dropped while still armed releases in the background on the current tokio
/// runtime and can only log a failure.
pub struct LockGuard {
    lock: DistroRwLock,
    resource: String,
    mode: LockMode,
    armed: bool,
}

impl LockGuard {
    pub(crate) fn new(lock: DistroRwLock, resource: String, mode: LockMode) -> Self {
        Self {
            lock,
            resource,
            mode,
            armed: true,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Extend the write lease. Read guards have no lease to extend.
    pub async fn renew(&self) -> Result<()> {
        match self.mode {
            LockMode::Write => self.lock.renew_write(&self.resource).await,
            LockMode::Read => Ok(()),
        }
    }

    /// Release the lease. The guard stays armed until the release completes,
    /// so cancelling this future falls back to the background release on drop.
    pub async fn release(mut self) -> Result<()> {
        let result = self.lock.release(&self.resource, self.mode).await;
        self.armed = false;
        result
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let lock = self.lock.clone();
        let resource = std::mem::take(&mut self.resource);
        let mode = self.mode;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lock.release(&resource, mode).await {
                        warn!(resource = %resource, mode = %mode, error = %e, "Background lock release failed");
                    }
                });
            }
            Err(_) => {
                error!(resource = %resource, mode = %mode, "Lock guard dropped outside a tokio runtime, lock not released");
            }
        }
    }
}
