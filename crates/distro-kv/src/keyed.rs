//! Keyed Value Binding
//!
//! Maps a typed, serializable value onto a store key. A binding uses either a
//! static key fixed per type (one logical instance, e.g. configuration) or a
//! dynamic key derived from the value's identity (per-entity records).
//! Reads carry the revision they observed so the caller can follow up with
//! [`KeyedValue::write_atomically`].

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use serde::de::DeserializeOwned;

use distro_common::Result;

use crate::store::{KvStore, Revision};

/// How a [`KeyedValue`] type maps to store keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScheme {
    /// Every value of the type lives at this exact key
    Static(&'static str),
    /// Values live at `{prefix}/{identity}`
    Dynamic(&'static str),
}

impl KeyScheme {
    pub fn key_for(&self, identity: &str) -> String {
        match self {
            KeyScheme::Static(key) => (*key).to_string(),
            KeyScheme::Dynamic(prefix) => format!("{}/{}", prefix, identity),
        }
    }

    pub fn is_static(&self) -> bool {
        matches!(self, KeyScheme::Static(_))
    }
}

/// A value together with the revision it was read or written at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<V> {
    pub value: V,
    pub revision: Revision,
}

impl<V> Versioned<V> {
    pub fn new(value: V, revision: Revision) -> Self {
        Self { value, revision }
    }

    pub fn into_inner(self) -> V {
        self.value
    }
}

/// Change stream of a keyed value; `None` marks a deletion
pub type KeyedWatchStream<V> = BoxStream<'static, Result<Option<Versioned<V>>>>;

/// Typed value bound to a store key. Values are stored as JSON.
#[async_trait]
pub trait KeyedValue: Serialize + DeserializeOwned + Send + Sync + Sized + 'static {
    const SCHEME: KeyScheme;

    /// Identity used by a dynamic scheme. Ignored by static schemes.
    fn identity(&self) -> String {
        String::new()
    }

    /// Store key for a value with the given identity
    fn key_for(identity: &str) -> String {
        Self::SCHEME.key_for(identity)
    }

    /// The constant key of a static scheme
    fn static_key() -> Option<&'static str> {
        match Self::SCHEME {
            KeyScheme::Static(key) => Some(key),
            KeyScheme::Dynamic(_) => None,
        }
    }

    /// Store key this value is written to
    fn store_key(&self) -> String {
        Self::key_for(&self.identity())
    }

    fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    async fn read(store: &dyn KvStore, key: &str) -> Result<Option<Versioned<Self>>> {
        match store.get(key).await? {
            Some(entry) => Ok(Some(Versioned::new(
                Self::decode(&entry.value)?,
                entry.revision,
            ))),
            None => Ok(None),
        }
    }

    async fn write_unconditionally(&self, store: &dyn KvStore) -> Result<Revision> {
        let value = self.encode()?;
        store.put(&self.store_key(), value).await
    }

    /// Write only if the stored revision is still `expected`
    /// ([`Revision::NOT_EXISTS`] to create). Fails with `VersionConflict` otherwise.
    async fn write_atomically(&self, store: &dyn KvStore, expected: Revision) -> Result<Revision> {
        let value = self.encode()?;
        store.put_if_revision(&self.store_key(), value, expected).await
    }

    async fn delete_unconditionally(store: &dyn KvStore, key: &str) -> Result<()> {
        store.delete(key).await
    }

    async fn watch(store: &dyn KvStore, key: &str) -> Result<KeyedWatchStream<Self>> {
        let events = store.watch(key).await?;
        Ok(events
            .map(|event| match event.value {
                Some(bytes) => {
                    Self::decode(&bytes).map(|value| Some(Versioned::new(value, event.revision)))
                }
                None => Ok(None),
            })
            .boxed())
    }
}
