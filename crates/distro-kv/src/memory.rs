// In-memory versioned KV store
// Reference implementation of the KvStore contract used by tests and single-process deployments

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::debug;

use distro_common::{DistroRwLockError, LockConfig, Result};

use crate::store::{KvEntry, KvEvent, KvStore, Revision, WatchStream};

/// Stored entry; a deleted key keeps its tombstone so revisions never go backwards
#[derive(Debug, Clone)]
struct StoredValue {
    value: Option<Bytes>,
    revision: Revision,
}

impl StoredValue {
    /// Revision a conditional write must present, NOT_EXISTS for tombstones
    fn live_revision(&self) -> Revision {
        if self.value.is_some() {
            self.revision
        } else {
            Revision::NOT_EXISTS
        }
    }
}

struct Inner {
    /// Key-value storage: key -> StoredValue
    entries: DashMap<String, StoredValue>,
    /// Per-key change channels, created on first watch and dropped once unsubscribed
    watchers: DashMap<String, broadcast::Sender<KvEvent>>,
    /// Global revision counter
    index: AtomicU64,
    watch_capacity: usize,
}

/// In-memory KV store with global revisions, tombstoned deletes and per-key watches
#[derive(Clone)]
pub struct MemoryKvStore {
    inner: Arc<Inner>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::with_watch_capacity(LockConfig::default().watch_channel_capacity)
    }

    pub fn from_config(config: &LockConfig) -> Self {
        Self::with_watch_capacity(config.watch_channel_capacity)
    }

    pub fn with_watch_capacity(watch_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                watchers: DashMap::new(),
                index: AtomicU64::new(1),
                watch_capacity: watch_capacity.max(1),
            }),
        }
    }

    fn next_revision(&self) -> Revision {
        Revision::new(self.inner.index.fetch_add(1, Ordering::SeqCst))
    }

    /// Latest revision handed out by this store
    pub fn current_revision(&self) -> Revision {
        Revision::new(self.inner.index.load(Ordering::SeqCst) - 1)
    }

    /// Number of live (non-deleted) keys
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .iter()
            .filter(|entry| entry.value.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` has a tombstone left by a delete
    pub fn is_tombstoned(&self, key: &str) -> bool {
        self.inner
            .entries
            .get(key)
            .is_some_and(|entry| entry.value.is_none())
    }

    /// Number of keys with an open change channel
    pub fn watched_keys(&self) -> usize {
        self.inner.watchers.len()
    }

    fn notify(&self, event: KvEvent) {
        let Some(sender) = self.inner.watchers.get(&event.key) else {
            return;
        };
        if sender.receiver_count() > 0 {
            let _ = sender.send(event);
            return;
        }
        drop(sender);
        // Re-checked under the map lock so a concurrent subscribe keeps its channel
        self.inner
            .watchers
            .remove_if(&event.key, |_, sender| sender.receiver_count() == 0);
    }

    fn snapshot_event(&self, key: &str) -> KvEvent {
        match self.inner.entries.get(key) {
            Some(stored) => KvEvent {
                key: key.to_string(),
                value: stored.value.clone(),
                revision: stored.revision,
            },
            None => KvEvent {
                key: key.to_string(),
                value: None,
                revision: Revision::NOT_EXISTS,
            },
        }
    }

    fn apply_put(&self, key: &str, value: Bytes, expected: Option<Revision>) -> Result<Revision> {
        // The shard lock held by the entry makes compare-and-write atomic per key
        match self.inner.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get_mut();
                let current = stored.live_revision();
                if let Some(expected) = expected
                    && expected != current
                {
                    return Err(DistroRwLockError::version_conflict(
                        key,
                        expected.value(),
                        current.value(),
                    ));
                }

                let revision = self.next_revision();
                stored.value = Some(value.clone());
                stored.revision = revision;
                self.notify(KvEvent {
                    key: key.to_string(),
                    value: Some(value),
                    revision,
                });
                Ok(revision)
            }
            Entry::Vacant(vacant) => {
                if let Some(expected) = expected
                    && expected.exists()
                {
                    return Err(DistroRwLockError::version_conflict(
                        key,
                        expected.value(),
                        Revision::NOT_EXISTS.value(),
                    ));
                }

                let revision = self.next_revision();
                let _stored = vacant.insert(StoredValue {
                    value: Some(value.clone()),
                    revision,
                });
                self.notify(KvEvent {
                    key: key.to_string(),
                    value: Some(value),
                    revision,
                });
                Ok(revision)
            }
        }
    }

    fn apply_delete(&self, key: &str, expected: Option<Revision>) -> Result<()> {
        let Some(mut stored) = self.inner.entries.get_mut(key) else {
            return match expected {
                Some(expected) if expected.exists() => Err(DistroRwLockError::version_conflict(
                    key,
                    expected.value(),
                    Revision::NOT_EXISTS.value(),
                )),
                _ => Ok(()),
            };
        };

        let current = stored.live_revision();
        if let Some(expected) = expected
            && expected != current
        {
            return Err(DistroRwLockError::version_conflict(
                key,
                expected.value(),
                current.value(),
            ));
        }
        if !current.exists() {
            return Ok(());
        }

        let revision = self.next_revision();
        stored.value = None;
        stored.revision = revision;
        self.notify(KvEvent {
            key: key.to_string(),
            value: None,
            revision,
        });
        Ok(())
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        Ok(self.inner.entries.get(key).and_then(|stored| {
            stored.value.clone().map(|value| KvEntry {
                key: key.to_string(),
                value,
                revision: stored.revision,
            })
        }))
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<Revision> {
        self.apply_put(key, value, None)
    }

    async fn put_if_revision(
        &self,
        key: &str,
        value: Bytes,
        expected: Revision,
    ) -> Result<Revision> {
        self.apply_put(key, value, Some(expected))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.apply_delete(key, None)
    }

    async fn delete_if_revision(&self, key: &str, expected: Revision) -> Result<()> {
        self.apply_delete(key, Some(expected))
    }

    async fn watch(&self, key: &str) -> Result<WatchStream> {
        let receiver = self
            .inner
            .watchers
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.watch_capacity).0)
            .subscribe();

        let store = self.clone();
        let key = key.to_string();
        let events = BroadcastStream::new(receiver).filter_map(move |item| {
            let event = match item {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    // Missed changes collapse into the current state
                    debug!(key = %key, skipped, "Watch lagged, resyncing from snapshot");
                    store.snapshot_event(&key)
                }
            };
            futures::future::ready(Some(event))
        });

        Ok(events.boxed())
    }
}
