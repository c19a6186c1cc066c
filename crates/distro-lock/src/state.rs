//! Lock State Record
//!
//! The value stored at a resource's lock key. Every transition is a pure
//! function from the observed record to the next one; the lock writes the
//! result back with a conditional put against the observed revision.

use serde::{Deserialize, Serialize};

use distro_common::{DistroRwLockError, Result};
use distro_kv::{KeyScheme, KeyedValue};

/// Key prefix under which lock records are stored
pub const LOCK_KEY_PREFIX: &str = "distro-rwlock";

/// Reader count and writer status of one protected resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    /// Protected resource name
    pub resource: String,
    /// Number of currently held read leases
    pub reader_count: u32,
    /// A writer holds exclusive access
    pub writer_held: bool,
    /// A writer is registered and blocks new readers
    pub writer_waiting: bool,
    /// Incremented on every write acquisition
    #[serde(default)]
    pub fencing_token: u64,
    /// Expiry of the held write lease (Unix millis), when leases are enabled
    #[serde(default)]
    pub held_until_ms: Option<i64>,
    /// Expiry of the waiting-writer registration (Unix millis), when leases are enabled
    #[serde(default)]
    pub waiting_until_ms: Option<i64>,
    /// Last transition timestamp
    #[serde(default)]
    pub updated_at: i64,
}

impl KeyedValue for LockState {
    const SCHEME: KeyScheme = KeyScheme::Dynamic(LOCK_KEY_PREFIX);

    fn identity(&self) -> String {
        self.resource.clone()
    }
}

impl LockState {
    /// The zero state an absent record stands for
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            reader_count: 0,
            writer_held: false,
            writer_waiting: false,
            fencing_token: 0,
            held_until_ms: None,
            waiting_until_ms: None,
            updated_at: 0,
        }
    }

    /// `writer_held` excludes readers
    pub fn is_consistent(&self) -> bool {
        !(self.writer_held && self.reader_count > 0)
    }

    /// New readers are refused while a writer holds or waits
    pub fn can_read(&self) -> bool {
        !self.writer_held && !self.writer_waiting
    }

    pub fn can_write(&self) -> bool {
        self.reader_count == 0 && !self.writer_held
    }

    pub fn is_free(&self) -> bool {
        self.reader_count == 0 && !self.writer_held && !self.writer_waiting
    }

    pub fn held_lease_expired(&self, now: i64) -> bool {
        self.writer_held && self.held_until_ms.is_some_and(|until| now >= until)
    }

    pub fn waiting_lease_expired(&self, now: i64) -> bool {
        self.writer_waiting && self.waiting_until_ms.is_some_and(|until| now >= until)
    }

    /// A writer claim whose holder stopped renewing it
    pub fn has_expired_claim(&self, now: i64) -> bool {
        self.held_lease_expired(now) || self.waiting_lease_expired(now)
    }

    pub fn with_reader_acquired(&self, now: i64) -> Self {
        Self {
            reader_count: self.reader_count + 1,
            updated_at: now,
            ..self.clone()
        }
    }

    pub fn with_reader_released(&self, now: i64) -> Result<Self> {
        let Some(reader_count) = self.reader_count.checked_sub(1) else {
            return Err(DistroRwLockError::invalid_state(
                Self::key_for(&self.resource),
                "release_read without a held read lease",
            ));
        };
        Ok(Self {
            reader_count,
            updated_at: now,
            ..self.clone()
        })
    }

    /// Register (or refresh) a waiting writer
    pub fn with_writer_waiting(&self, until: Option<i64>, now: i64) -> Self {
        Self {
            writer_waiting: true,
            waiting_until_ms: until,
            updated_at: now,
            ..self.clone()
        }
    }

    /// Withdraw a waiting-writer registration
    pub fn with_waiting_withdrawn(&self, now: i64) -> Self {
        Self {
            writer_waiting: false,
            waiting_until_ms: None,
            updated_at: now,
            ..self.clone()
        }
    }

    pub fn with_writer_acquired(&self, until: Option<i64>, now: i64) -> Self {
        Self {
            resource: self.resource.clone(),
            reader_count: 0,
            writer_held: true,
            writer_waiting: false,
            fencing_token: self.fencing_token + 1,
            held_until_ms: until,
            waiting_until_ms: None,
            updated_at: now,
        }
    }

    pub fn with_writer_released(&self, now: i64) -> Result<Self> {
        if !self.writer_held {
            return Err(DistroRwLockError::invalid_state(
                Self::key_for(&self.resource),
                "release_write without a held write lock",
            ));
        }
        Ok(Self {
            resource: self.resource.clone(),
            reader_count: 0,
            writer_held: false,
            writer_waiting: false,
            fencing_token: self.fencing_token,
            held_until_ms: None,
            waiting_until_ms: None,
            updated_at: now,
        })
    }

    pub fn with_lease_extended(&self, until: Option<i64>, now: i64) -> Self {
        Self {
            held_until_ms: until,
            updated_at: now,
            ..self.clone()
        }
    }

    /// Drop whichever writer claims have expired
    pub fn with_expired_claims_reclaimed(&self, now: i64) -> Self {
        let mut next = self.clone();
        if self.held_lease_expired(now) {
            next.writer_held = false;
            next.held_until_ms = None;
        }
        if self.waiting_lease_expired(now) {
            next.writer_waiting = false;
            next.waiting_until_ms = None;
        }
        next.updated_at = now;
        next
    }
}
