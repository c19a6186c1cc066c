// Integration tests for lock behavior against misbehaving stores
// Covers error propagation, concurrent-write retries and scoped release guarantees

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;

use distro_kv::{KvEntry, WatchStream};
use distro_lock::{
    DistroRwLock, DistroRwLockError, KvStore, LockMode, MemoryKvStore, Result, Revision,
    ScopedLock, ScopedLockError,
};

/// Store whose every call fails
struct UnavailableStore;

#[async_trait]
impl KvStore for UnavailableStore {
    async fn get(&self, _key: &str) -> Result<Option<KvEntry>> {
        Err(DistroRwLockError::store(anyhow!("store unavailable")))
    }

    async fn put(&self, _key: &str, _value: Bytes) -> Result<Revision> {
        Err(DistroRwLockError::store(anyhow!("store unavailable")))
    }

    async fn put_if_revision(
        &self,
        _key: &str,
        _value: Bytes,
        _expected: Revision,
    ) -> Result<Revision> {
        Err(DistroRwLockError::store(anyhow!("store unavailable")))
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(DistroRwLockError::store(anyhow!("store unavailable")))
    }

    async fn delete_if_revision(&self, _key: &str, _expected: Revision) -> Result<()> {
        Err(DistroRwLockError::store(anyhow!("store unavailable")))
    }

    async fn watch(&self, _key: &str) -> Result<WatchStream> {
        Err(DistroRwLockError::store(anyhow!("store unavailable")))
    }
}

/// In-memory store that reports a conflict for the first `conflicts` conditional
/// puts, and can be switched to fail writes
struct FlakyStore {
    inner: MemoryKvStore,
    conflicts: AtomicU32,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    fn new(conflicts: u32) -> Self {
        Self {
            inner: MemoryKvStore::new(),
            conflicts: AtomicU32::new(conflicts),
            fail_writes: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<Revision> {
        self.inner.put(key, value).await
    }

    async fn put_if_revision(&self, key: &str, value: Bytes, expected: Revision) -> Result<Revision> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DistroRwLockError::store(anyhow!("write rejected")));
        }
        let remaining = self.conflicts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.conflicts.store(remaining - 1, Ordering::SeqCst);
            return Err(DistroRwLockError::version_conflict(
                key,
                expected.value(),
                expected.value() + 1,
            ));
        }
        self.inner.put_if_revision(key, value, expected).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn delete_if_revision(&self, key: &str, expected: Revision) -> Result<()> {
        self.inner.delete_if_revision(key, expected).await
    }

    async fn watch(&self, key: &str) -> Result<WatchStream> {
        self.inner.watch(key).await
    }
}

/// In-memory store whose reads stall for `delay` while `slow` is set
struct SlowStore {
    inner: MemoryKvStore,
    slow: AtomicBool,
    delay: Duration,
}

impl SlowStore {
    fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryKvStore::new(),
            slow: AtomicBool::new(false),
            delay,
        }
    }
}

#[async_trait]
impl KvStore for SlowStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        if self.slow.load(Ordering::SeqCst) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<Revision> {
        self.inner.put(key, value).await
    }

    async fn put_if_revision(&self, key: &str, value: Bytes, expected: Revision) -> Result<Revision> {
        self.inner.put_if_revision(key, value, expected).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn delete_if_revision(&self, key: &str, expected: Revision) -> Result<()> {
        self.inner.delete_if_revision(key, expected).await
    }

    async fn watch(&self, key: &str) -> Result<WatchStream> {
        self.inner.watch(key).await
    }
}

#[tokio::test]
async fn test_store_errors_propagate() {
    let lock = DistroRwLock::new(Arc::new(UnavailableStore));

    for mode in [LockMode::Read, LockMode::Write] {
        let err = lock.acquire("r1", mode).await.unwrap_err();
        assert!(matches!(err, DistroRwLockError::StoreError(_)));
        let err = lock.release("r1", mode).await.unwrap_err();
        assert!(matches!(err, DistroRwLockError::StoreError(_)));
    }
    assert!(lock.state("r1").await.is_err());
}

#[tokio::test]
async fn test_version_conflicts_are_retried() {
    let lock = DistroRwLock::new(Arc::new(FlakyStore::new(3)));

    lock.acquire_write("r1").await.unwrap();
    lock.release_write("r1").await.unwrap();

    let stats = lock.stats();
    assert_eq!(stats.version_conflicts, 3);
    assert_eq!(stats.write_acquisitions, 1);
    assert!(lock.state("r1").await.unwrap().value.is_free());
}

#[tokio::test]
async fn test_scoped_acquire_failure_skips_operation() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let scoped = ScopedLock::new(
        move |_: ()| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, String>(()) }
        },
        Arc::new(UnavailableStore),
        "r1",
    );

    let err = scoped.run(()).await.unwrap_err();
    assert!(matches!(err, ScopedLockError::Acquire(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_scoped_operation_error_releases_for_next_actor() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let failing = ScopedLock::new(
        |_: ()| async move { Err::<(), _>("operation exploded".to_string()) },
        store.clone(),
        "jobs",
    );
    let err = failing.run(()).await.unwrap_err();
    assert!(matches!(err, ScopedLockError::Operation(_)));

    // Another actor can take the lock right away
    let next = DistroRwLock::new(store);
    assert!(next.try_acquire_write("jobs").await.unwrap());
}

#[tokio::test]
async fn test_scoped_release_failure_reported_alongside_operation_error() {
    let store = Arc::new(FlakyStore::new(0));
    let breaker = store.clone();
    let scoped = ScopedLock::new(
        move |_: ()| {
            breaker.fail_writes.store(true, Ordering::SeqCst);
            async move { Err::<(), _>("operation failed first".to_string()) }
        },
        store,
        "jobs",
    );

    match scoped.run(()).await.unwrap_err() {
        ScopedLockError::OperationAndRelease { operation, release } => {
            assert_eq!(operation, "operation failed first");
            assert!(matches!(release, DistroRwLockError::StoreError(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_scoped_release_failure_after_success() {
    let store = Arc::new(FlakyStore::new(0));
    let breaker = store.clone();
    let scoped = ScopedLock::new(
        move |value: u32| {
            breaker.fail_writes.store(true, Ordering::SeqCst);
            async move { Ok::<_, String>(value) }
        },
        store,
        "jobs",
    );

    let err = scoped.run(7).await.unwrap_err();
    assert!(err.is_release_failure());
    assert!(err.operation_error().is_none());
    assert!(matches!(err.lock_error(), Some(DistroRwLockError::StoreError(_))));
}

#[tokio::test]
async fn test_scoped_run_cancelled_during_release_still_releases() {
    let store = Arc::new(SlowStore::new(Duration::from_millis(200)));
    let switch = store.clone();
    let scoped = ScopedLock::new(
        move |_: ()| {
            // Stall the release's read so the run is cancelled mid-release
            switch.slow.store(true, Ordering::SeqCst);
            async move { Ok::<_, String>(()) }
        },
        store.clone(),
        "jobs",
    );

    let outcome = tokio::time::timeout(Duration::from_millis(50), scoped.run(())).await;
    assert!(outcome.is_err());
    store.slow.store(false, Ordering::SeqCst);

    let lock = DistroRwLock::new(store);
    for _ in 0..100 {
        if lock.state("jobs").await.unwrap().value.is_free() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("lock still held after the scoped run was cancelled");
}

#[tokio::test]
async fn test_cancelled_guard_release_falls_back_to_drop() {
    let store = Arc::new(SlowStore::new(Duration::from_millis(200)));
    let lock = DistroRwLock::new(store.clone());
    let guard = lock.read_guard("jobs").await.unwrap();

    store.slow.store(true, Ordering::SeqCst);
    let outcome = tokio::time::timeout(Duration::from_millis(50), guard.release()).await;
    assert!(outcome.is_err());
    store.slow.store(false, Ordering::SeqCst);

    for _ in 0..100 {
        if lock.state("jobs").await.unwrap().value.reader_count == 0 {
            assert_eq!(lock.stats().read_releases, 1);
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("read lease still held after release was cancelled");
}
