//! Storage backend and segment benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use segdb_bench::random_data;
use segdb_core::{SegmentManager, DATA_START_POSITION};
use segdb_storage::{FileBackend, InMemoryBackend, StorageBackend};
use tempfile::TempDir;

/// Benchmark InMemoryBackend append operations.
fn bench_inmemory_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("inmemory_append");

    for size in [64, 256, 1024, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut backend = InMemoryBackend::new();
            let data = random_data(size);

            b.iter(|| {
                let offset = backend.append(black_box(&data)).unwrap();
                black_box(offset);
            });
        });
    }

    group.finish();
}

/// Benchmark FileBackend append operations.
fn bench_file_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_append");
    group.sample_size(50);

    for size in [256, 1024, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let temp_dir = TempDir::new().unwrap();
            let mut backend = FileBackend::create(&temp_dir.path().join("bench.seg")).unwrap();
            let data = random_data(size);

            b.iter(|| {
                let offset = backend.append(black_box(&data)).unwrap();
                black_box(offset);
            });
        });
    }

    group.finish();
}

/// Benchmark segment to segment record copies, the compactor's inner loop.
fn bench_segment_transfer(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_transfer");

    for size in [256, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let pool = SegmentManager::in_memory(64 << 20, 16);
            let source = pool.next_segment().unwrap();
            source.append_int(size as i32).unwrap();
            source.append(&random_data(size)).unwrap();
            let mut target = pool.next_segment().unwrap();

            b.iter(|| {
                if target.remaining().unwrap() < size as u64 + 4 {
                    pool.free_segment(target.id()).unwrap();
                    target = pool.next_segment().unwrap();
                }
                let position = source
                    .transfer_to(DATA_START_POSITION, size + 4, &target)
                    .unwrap();
                black_box(position);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_inmemory_append,
    bench_file_append,
    bench_segment_transfer
);
criterion_main!(benches);
