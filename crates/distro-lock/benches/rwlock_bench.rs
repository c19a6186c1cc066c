// Benchmarks for DistroRwLock over the in-memory store
// Measures uncontended acquire/release cycles and scoped runs

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use distro_lock::{DistroRwLock, LockConfig, LockState, MemoryKvStore, ScopedLock};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_state_transitions(c: &mut Criterion) {
    let state = LockState::new("bench").with_reader_acquired(1);

    c.bench_function("state_writer_cycle", |b| {
        b.iter(|| {
            let next = black_box(&state)
                .with_reader_released(2)
                .unwrap()
                .with_writer_acquired(None, 3);
            black_box(next.with_writer_released(4).unwrap())
        })
    });
}

fn bench_read_cycle(c: &mut Criterion) {
    let rt = runtime();
    let lock = DistroRwLock::new(Arc::new(MemoryKvStore::new()));

    c.bench_function("read_acquire_release", |b| {
        b.to_async(&rt).iter(|| async {
            lock.acquire_read("bench").await.unwrap();
            lock.release_read("bench").await.unwrap();
        })
    });
}

fn bench_write_cycle(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("write_acquire_release");

    for lease_ms in [0u64, 30_000] {
        let lock = DistroRwLock::with_config(
            Arc::new(MemoryKvStore::new()),
            LockConfig::with_lease(lease_ms),
        );
        group.bench_with_input(BenchmarkId::new("lease_ms", lease_ms), &lease_ms, |b, _| {
            b.to_async(&rt).iter(|| async {
                lock.acquire_write("bench").await.unwrap();
                lock.release_write("bench").await.unwrap();
            })
        });
    }
    group.finish();
}

fn bench_scoped_run(c: &mut Criterion) {
    let rt = runtime();
    let scoped = ScopedLock::new(
        |x: u64| async move { Ok::<_, String>(x + 1) },
        Arc::new(MemoryKvStore::new()),
        "bench",
    );

    c.bench_function("scoped_write_run", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(scoped.run(black_box(1)).await.unwrap()) })
    });
}

criterion_group!(
    benches,
    bench_state_transitions,
    bench_read_cycle,
    bench_write_cycle,
    bench_scoped_run,
);
criterion_main!(benches);
