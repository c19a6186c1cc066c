//! Lock statistics
//!
//! Counters are kept per `DistroRwLock` handle and mirrored to the `metrics` facade.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::rwlock::LockMode;

/// Snapshot of lock activity seen through one handle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStats {
    pub read_acquisitions: u64,
    pub write_acquisitions: u64,
    pub read_releases: u64,
    pub write_releases: u64,
    /// Conditional puts that lost a race and were retried
    pub version_conflicts: u64,
    /// Times an acquisition suspended on a watch
    pub watch_waits: u64,
    /// Expired writer claims cleared by this handle
    pub lease_reclaims: u64,
    /// Non-blocking or timed acquisitions that gave up
    pub failed_acquisitions: u64,
}

#[derive(Default)]
pub(crate) struct LockStatsCollector {
    read_acquisitions: AtomicU64,
    write_acquisitions: AtomicU64,
    read_releases: AtomicU64,
    write_releases: AtomicU64,
    version_conflicts: AtomicU64,
    watch_waits: AtomicU64,
    lease_reclaims: AtomicU64,
    failed_acquisitions: AtomicU64,
}

impl LockStatsCollector {
    pub(crate) fn record_acquire(&self, mode: LockMode) {
        match mode {
            LockMode::Read => self.read_acquisitions.fetch_add(1, Ordering::Relaxed),
            LockMode::Write => self.write_acquisitions.fetch_add(1, Ordering::Relaxed),
        };
        metrics::counter!("distro_rwlock_acquisitions_total", "mode" => mode.as_str()).increment(1);
    }

    pub(crate) fn record_release(&self, mode: LockMode) {
        match mode {
            LockMode::Read => self.read_releases.fetch_add(1, Ordering::Relaxed),
            LockMode::Write => self.write_releases.fetch_add(1, Ordering::Relaxed),
        };
        metrics::counter!("distro_rwlock_releases_total", "mode" => mode.as_str()).increment(1);
    }

    pub(crate) fn record_conflict(&self) {
        self.version_conflicts.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("distro_rwlock_version_conflicts_total").increment(1);
    }

    pub(crate) fn record_wait(&self) {
        self.watch_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reclaim(&self) {
        self.lease_reclaims.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("distro_rwlock_lease_reclaims_total").increment(1);
    }

    pub(crate) fn record_failed(&self) {
        self.failed_acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> LockStats {
        LockStats {
            read_acquisitions: self.read_acquisitions.load(Ordering::Relaxed),
            write_acquisitions: self.write_acquisitions.load(Ordering::Relaxed),
            read_releases: self.read_releases.load(Ordering::Relaxed),
            write_releases: self.write_releases.load(Ordering::Relaxed),
            version_conflicts: self.version_conflicts.load(Ordering::Relaxed),
            watch_waits: self.watch_waits.load(Ordering::Relaxed),
            lease_reclaims: self.lease_reclaims.load(Ordering::Relaxed),
            failed_acquisitions: self.failed_acquisitions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let stats = LockStatsCollector::default();
        stats.record_acquire(LockMode::Read);
        stats.record_acquire(LockMode::Read);
        stats.record_acquire(LockMode::Write);
        stats.record_release(LockMode::Read);
        stats.record_conflict();
        stats.record_wait();
        stats.record_reclaim();
        stats.record_failed();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.read_acquisitions, 2);
        assert_eq!(snapshot.write_acquisitions, 1);
        assert_eq!(snapshot.read_releases, 1);
        assert_eq!(snapshot.write_releases, 0);
        assert_eq!(snapshot.version_conflicts, 1);
        assert_eq!(snapshot.watch_waits, 1);
        assert_eq!(snapshot.lease_reclaims, 1);
        assert_eq!(snapshot.failed_acquisitions, 1);
    }
}
