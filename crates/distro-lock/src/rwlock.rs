//! Distributed Read-Write Lock
//!
//! Writer-priority read-write lock whose entire state is one [`LockState`]
//! record per resource. Every transition is read, compute next state,
//! conditional put against the observed revision, retry on conflict. While a
//! transition is blocked the caller suspends on a watch of the record and
//! re-validates the full condition on every wake-up.
//!
//! Acquisition loops are unbounded; wrap them in `tokio::time::timeout` or use
//! the `*_timeout` variants. Dropping a suspended acquisition leaves no state
//! behind except a `writer_waiting` registration, which
//! [`DistroRwLock::acquire_write_timeout`] withdraws.

use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use distro_common::{DistroRwLockError, LockConfig, Result, current_timestamp};
use distro_kv::{KeyedValue, KvStore, Revision, Versioned, WatchStream};

use crate::guard::LockGuard;
use crate::state::LockState;
use crate::stats::{LockStats, LockStatsCollector};

/// Shared (read) or exclusive (write) access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Read,
    #[default]
    Write,
}

impl LockMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LockMode::Read => "read",
            LockMode::Write => "write",
        }
    }
}

impl Display for LockMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lazily opened watch on one lock record.
///
/// The first call to [`Waiter::wait`] only subscribes and returns, so the
/// caller re-reads the record after the subscription exists and no change
/// between read and subscribe can be missed.
struct Waiter {
    key: String,
    watch: Option<WatchStream>,
}

impl Waiter {
    fn new(key: String) -> Self {
        Self { key, watch: None }
    }

    async fn wait(&mut self, lock: &DistroRwLock) -> Result<()> {
        if self.watch.is_none() {
            self.watch = Some(lock.store.watch(&self.key).await?);
            return Ok(());
        }
        let Some(watch) = self.watch.as_mut() else {
            return Ok(());
        };

        lock.stats.record_wait();
        let next = match lock.config.recheck_interval() {
            Some(interval) => match tokio::time::timeout(interval, watch.next()).await {
                Ok(event) => event.map(|_| ()),
                // Periodic re-check so an abandoned claim is noticed without a change event
                Err(_) => Some(()),
            },
            None => watch.next().await.map(|_| ()),
        };
        next.ok_or_else(|| DistroRwLockError::WatchClosed(self.key.clone()))
    }
}

/// `writer_waiting` registration committed by one `acquire_write` call.
///
/// Holds the fencing token current at registration time: once another writer
/// acquires, the token moves on and the flag no longer belongs to this call.
#[derive(Default)]
struct WaitingRegistration {
    registered: AtomicBool,
    token: AtomicU64,
}

impl WaitingRegistration {
    fn record(&self, token: u64) {
        self.token.store(token, Ordering::SeqCst);
        self.registered.store(true, Ordering::SeqCst);
    }

    fn token(&self) -> Option<u64> {
        self.registered
            .load(Ordering::SeqCst)
            .then(|| self.token.load(Ordering::SeqCst))
    }
}

/// Distributed read-write lock handle.
///
/// Cheap to clone; clones share statistics and the record of write locks
/// held through this handle.
#[derive(Clone)]
pub struct DistroRwLock {
    store: Arc<dyn KvStore>,
    config: Arc<LockConfig>,
    holder_id: Arc<str>,
    /// Fence tokens of write locks acquired through this handle: resource -> token
    held_writes: Arc<DashMap<String, u64>>,
    stats: Arc<LockStatsCollector>,
}

impl DistroRwLock {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_config(store, LockConfig::default())
    }

    pub fn with_config(store: Arc<dyn KvStore>, config: LockConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            holder_id: uuid::Uuid::new_v4().to_string().into(),
            held_writes: Arc::new(DashMap::new()),
            stats: Arc::new(LockStatsCollector::default()),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Identifier of this handle in log output
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn stats(&self) -> LockStats {
        self.stats.snapshot()
    }

    /// Store key of the record guarding `resource`
    pub fn lock_key(resource: &str) -> String {
        LockState::key_for(resource)
    }

    /// Current record of `resource`; an absent record reads as the zero state at `NOT_EXISTS`
    pub async fn state(&self, resource: &str) -> Result<Versioned<LockState>> {
        let key = Self::lock_key(resource);
        Ok(LockState::read(self.store.as_ref(), &key)
            .await?
            .unwrap_or_else(|| Versioned::new(LockState::new(resource), Revision::NOT_EXISTS)))
    }

    /// Write `next` if the record is still at `expected`. `None` means the put lost a race.
    async fn commit(&self, next: &LockState, expected: Revision) -> Result<Option<Revision>> {
        match next.write_atomically(self.store.as_ref(), expected).await {
            Ok(revision) => Ok(Some(revision)),
            Err(e) if e.is_version_conflict() => {
                self.stats.record_conflict();
                debug!(resource = %next.resource, expected = %expected, "Lock record changed concurrently, retrying");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn lease_millis(&self) -> Option<i64> {
        self.config
            .writer_lease()
            .map(|lease| i64::try_from(lease.as_millis()).unwrap_or(i64::MAX))
    }

    fn lease_deadline(&self, now: i64) -> Option<i64> {
        self.lease_millis().map(|lease| now.saturating_add(lease))
    }

    /// Whether a waiting writer should re-stamp its registration
    fn waiting_needs_refresh(&self, state: &LockState, now: i64) -> bool {
        match (self.lease_millis(), state.waiting_until_ms) {
            (Some(lease), Some(until)) => until.saturating_sub(now) < lease / 2,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Clear expired writer claims. Returns whether the record was changed.
    async fn reclaim_expired(&self, current: &Versioned<LockState>, now: i64) -> Result<bool> {
        if !current.value.has_expired_claim(now) {
            return Ok(false);
        }
        let next = current.value.with_expired_claims_reclaimed(now);
        if self.commit(&next, current.revision).await?.is_none() {
            return Ok(false);
        }
        self.stats.record_reclaim();
        warn!(
            resource = %current.value.resource,
            held_expired = current.value.held_lease_expired(now),
            waiting_expired = current.value.waiting_lease_expired(now),
            holder = %self.holder_id,
            "Reclaimed expired writer claim"
        );
        Ok(true)
    }

    /// Acquire a shared lease. Suspends while a writer holds or waits.
    pub async fn acquire_read(&self, resource: &str) -> Result<()> {
        let mut waiter = Waiter::new(Self::lock_key(resource));
        loop {
            let current = self.state(resource).await?;
            let now = current_timestamp();

            if !current.value.can_read() {
                if !self.reclaim_expired(&current, now).await? {
                    debug!(resource = %resource, holder = %self.holder_id, "Read blocked by writer, waiting");
                    waiter.wait(self).await?;
                }
                continue;
            }

            let next = current.value.with_reader_acquired(now);
            if self.commit(&next, current.revision).await?.is_some() {
                self.stats.record_acquire(LockMode::Read);
                debug!(resource = %resource, readers = next.reader_count, holder = %self.holder_id, "Read lock acquired");
                return Ok(());
            }
        }
    }

    /// Single attempt at a shared lease; `false` if a writer holds or waits
    pub async fn try_acquire_read(&self, resource: &str) -> Result<bool> {
        loop {
            let current = self.state(resource).await?;
            let now = current_timestamp();

            if !current.value.can_read() {
                if self.reclaim_expired(&current, now).await? {
                    continue;
                }
                self.stats.record_failed();
                return Ok(false);
            }

            let next = current.value.with_reader_acquired(now);
            if self.commit(&next, current.revision).await?.is_some() {
                self.stats.record_acquire(LockMode::Read);
                return Ok(true);
            }
        }
    }

    /// Acquire a shared lease, giving up after `timeout`
    pub async fn acquire_read_timeout(&self, resource: &str, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, self.acquire_read(resource)).await {
            Ok(result) => result.map(|_| true),
            Err(_) => {
                self.stats.record_failed();
                Ok(false)
            }
        }
    }

    /// Release one shared lease. Fails with `InvalidLockState` if no reader holds one.
    pub async fn release_read(&self, resource: &str) -> Result<()> {
        loop {
            let current = self.state(resource).await?;
            let next = current.value.with_reader_released(current_timestamp())?;
            if self.commit(&next, current.revision).await?.is_some() {
                self.stats.record_release(LockMode::Read);
                debug!(resource = %resource, readers = next.reader_count, holder = %self.holder_id, "Read lock released");
                return Ok(());
            }
        }
    }

    /// Acquire exclusive access. Registers `writer_waiting` first, which blocks
    /// new readers, then waits for existing readers and writers to leave.
    pub async fn acquire_write(&self, resource: &str) -> Result<()> {
        self.acquire_write_registered(resource, &WaitingRegistration::default())
            .await
    }

    async fn acquire_write_registered(
        &self,
        resource: &str,
        registration: &WaitingRegistration,
    ) -> Result<()> {
        let mut waiter = Waiter::new(Self::lock_key(resource));
        loop {
            let current = self.state(resource).await?;
            let state = &current.value;
            let now = current_timestamp();

            if state.can_write() {
                let next = state.with_writer_acquired(self.lease_deadline(now), now);
                if self.commit(&next, current.revision).await?.is_some() {
                    self.held_writes
                        .insert(resource.to_string(), next.fencing_token);
                    self.stats.record_acquire(LockMode::Write);
                    debug!(resource = %resource, fencing_token = next.fencing_token, holder = %self.holder_id, "Write lock acquired");
                    return Ok(());
                }
                continue;
            }

            if self.reclaim_expired(&current, now).await? {
                continue;
            }

            // Re-assert priority: the flag may have been consumed by another writer's acquisition
            if !state.writer_waiting || self.waiting_needs_refresh(state, now) {
                let next = state.with_writer_waiting(self.lease_deadline(now), now);
                if self.commit(&next, current.revision).await?.is_some() {
                    // Refreshing another writer's registration does not take it over
                    if !state.writer_waiting {
                        registration.record(next.fencing_token);
                    }
                    debug!(resource = %resource, readers = state.reader_count, holder = %self.holder_id, "Write request registered");
                }
                continue;
            }

            debug!(resource = %resource, readers = state.reader_count, writer_held = state.writer_held, "Write blocked, waiting");
            waiter.wait(self).await?;
        }
    }

    /// Single attempt at exclusive access; never registers `writer_waiting`
    pub async fn try_acquire_write(&self, resource: &str) -> Result<bool> {
        loop {
            let current = self.state(resource).await?;
            let now = current_timestamp();

            if !current.value.can_write() {
                if self.reclaim_expired(&current, now).await? {
                    continue;
                }
                self.stats.record_failed();
                return Ok(false);
            }

            let next = current
                .value
                .with_writer_acquired(self.lease_deadline(now), now);
            if self.commit(&next, current.revision).await?.is_some() {
                self.held_writes
                    .insert(resource.to_string(), next.fencing_token);
                self.stats.record_acquire(LockMode::Write);
                return Ok(true);
            }
        }
    }

    /// Acquire exclusive access, giving up after `timeout`. On timeout a
    /// `writer_waiting` flag registered by this call is withdrawn so readers
    /// are not blocked. A flag set by another waiting writer is left alone.
    pub async fn acquire_write_timeout(&self, resource: &str, timeout: Duration) -> Result<bool> {
        let registration = WaitingRegistration::default();
        let attempt = self.acquire_write_registered(resource, &registration);
        match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result.map(|_| true),
            Err(_) => {
                self.stats.record_failed();
                if let Some(token) = registration.token() {
                    self.withdraw_waiting(resource, token).await?;
                }
                Ok(false)
            }
        }
    }

    /// Clear `writer_waiting` if it is still the registration made under `token`
    async fn withdraw_waiting(&self, resource: &str, token: u64) -> Result<()> {
        loop {
            let current = self.state(resource).await?;
            if !current.value.writer_waiting || current.value.fencing_token != token {
                return Ok(());
            }
            let next = current.value.with_waiting_withdrawn(current_timestamp());
            if self.commit(&next, current.revision).await?.is_some() {
                debug!(resource = %resource, holder = %self.holder_id, "Write request withdrawn");
                return Ok(());
            }
        }
    }

    /// Fail if a write lock taken through this handle has since been reclaimed
    fn check_fence(&self, resource: &str, state: &LockState) -> Result<()> {
        let Some(token) = self.held_writes.get(resource).map(|entry| *entry) else {
            return Ok(());
        };
        if state.writer_held && state.fencing_token == token {
            return Ok(());
        }
        self.held_writes.remove(resource);
        Err(DistroRwLockError::invalid_state(
            Self::lock_key(resource),
            format!(
                "write lease lost: fencing token {} superseded by {}",
                token, state.fencing_token
            ),
        ))
    }

    /// Release exclusive access. Fails with `InvalidLockState` if no writer holds the lock.
    pub async fn release_write(&self, resource: &str) -> Result<()> {
        loop {
            let current = self.state(resource).await?;
            self.check_fence(resource, &current.value)?;
            let next = current.value.with_writer_released(current_timestamp())?;
            if self.commit(&next, current.revision).await?.is_some() {
                self.held_writes.remove(resource);
                self.stats.record_release(LockMode::Write);
                debug!(resource = %resource, holder = %self.holder_id, "Write lock released");
                return Ok(());
            }
        }
    }

    /// Extend the write lease. A no-op write when leases are disabled.
    pub async fn renew_write(&self, resource: &str) -> Result<()> {
        loop {
            let current = self.state(resource).await?;
            self.check_fence(resource, &current.value)?;
            if !current.value.writer_held {
                return Err(DistroRwLockError::invalid_state(
                    Self::lock_key(resource),
                    "renew_write without a held write lock",
                ));
            }
            if !self.config.leases_enabled() {
                return Ok(());
            }

            let now = current_timestamp();
            let next = current
                .value
                .with_lease_extended(self.lease_deadline(now), now);
            if self.commit(&next, current.revision).await?.is_some() {
                debug!(resource = %resource, held_until_ms = ?next.held_until_ms, "Write lease renewed");
                return Ok(());
            }
        }
    }

    pub async fn acquire(&self, resource: &str, mode: LockMode) -> Result<()> {
        match mode {
            LockMode::Read => self.acquire_read(resource).await,
            LockMode::Write => self.acquire_write(resource).await,
        }
    }

    pub async fn release(&self, resource: &str, mode: LockMode) -> Result<()> {
        match mode {
            LockMode::Read => self.release_read(resource).await,
            LockMode::Write => self.release_write(resource).await,
        }
    }

    /// Acquire in `mode` and return a guard that releases on `release()` or drop
    pub async fn guard(&self, resource: &str, mode: LockMode) -> Result<LockGuard> {
        self.acquire(resource, mode).await?;
        Ok(LockGuard::new(self.clone(), resource.to_string(), mode))
    }

    pub async fn read_guard(&self, resource: &str) -> Result<LockGuard> {
        self.guard(resource, LockMode::Read).await
    }

    pub async fn write_guard(&self, resource: &str) -> Result<LockGuard> {
        self.guard(resource, LockMode::Write).await
    }
}
