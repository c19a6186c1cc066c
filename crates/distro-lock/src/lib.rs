//! Distro Lock - Distributed read-write lock over a versioned key-value store
//!
//! This crate provides:
//! - `DistroRwLock`: writer-priority read-write lock built from single-key
//!   conditional puts and watches
//! - `LockGuard`: held lease released explicitly or on drop
//! - `ScopedLock`: runs a unit of work under the lock with guaranteed release
//! - Optional write leases with fencing tokens and automatic renewal

pub mod guard;
pub mod rwlock;
pub mod scoped;
pub mod state;
pub mod stats;

pub use guard::LockGuard;
pub use rwlock::{DistroRwLock, LockMode};
pub use scoped::{ScopedLock, ScopedLockError};
pub use state::{LOCK_KEY_PREFIX, LockState};
pub use stats::LockStats;

pub use distro_common::{DistroRwLockError, LockConfig, Result};
pub use distro_kv::{KeyedValue, KvStore, MemoryKvStore, Revision, Versioned};
