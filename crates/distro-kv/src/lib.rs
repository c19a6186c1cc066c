//! Distro KV - Versioned key-value store interface for the distributed read-write lock
//!
//! This crate provides:
//! - The KV store contract (revisioned get, conditional put/delete, watch)
//! - An in-memory reference store
//! - Typed keyed-value bindings with static or dynamic keys

pub mod keyed;
pub mod memory;
pub mod store;

pub use keyed::{KeyScheme, KeyedValue, KeyedWatchStream, Versioned};
pub use memory::MemoryKvStore;
pub use store::{KvEntry, KvEvent, KvStore, Revision, WatchStream};
