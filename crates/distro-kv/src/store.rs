//! KV Store Interface
//!
//! The contract the lock and keyed-value layers consume from a replicated,
//! versioned key-value store: revision-stamped reads, conditional writes and
//! deletes, and per-key change notification.

use std::fmt::{Display, Formatter};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use distro_common::Result;

/// Opaque, monotonically increasing version stamp of a stored value
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(u64);

impl Revision {
    /// Sentinel expected by a conditional write that creates an absent key
    pub const NOT_EXISTS: Revision = Revision(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// Whether this revision refers to a live value
    pub const fn exists(self) -> bool {
        self.0 != 0
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live value and the revision it was written at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Bytes,
    pub revision: Revision,
}

/// A change to a watched key. `value` is `None` when the key was deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    pub key: String,
    pub value: Option<Bytes>,
    pub revision: Revision,
}

impl KvEvent {
    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }
}

/// Lazy, unbounded sequence of changes to one key, starting after the watch was opened
pub type WatchStream = BoxStream<'static, KvEvent>;

/// Versioned key-value store consumed by the lock.
///
/// Implementations must make `put_if_revision` and `delete_if_revision`
/// atomic with respect to every other write on the same key. A conflicting
/// conditional write returns [`distro_common::DistroRwLockError::VersionConflict`]
/// and has no side effect.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Latest locally visible value, or `None` if absent or deleted
    async fn get(&self, key: &str) -> Result<Option<KvEntry>>;

    /// Write regardless of the current revision
    async fn put(&self, key: &str, value: Bytes) -> Result<Revision>;

    /// Write only if the stored revision still equals `expected`.
    /// Use [`Revision::NOT_EXISTS`] to create an absent key.
    async fn put_if_revision(&self, key: &str, value: Bytes, expected: Revision)
    -> Result<Revision>;

    /// Delete regardless of the current revision. Deleting an absent key is a no-op.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete only if the stored revision still equals `expected`
    async fn delete_if_revision(&self, key: &str, expected: Revision) -> Result<()>;

    /// Subscribe to subsequent changes of `key`. Opening a new watch restarts the sequence.
    async fn watch(&self, key: &str) -> Result<WatchStream>;
}
