//! Address codec benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use segdb_core::AddressFormat;

fn layouts() -> Vec<(&'static str, AddressFormat)> {
    vec![
        ("32-16-16", AddressFormat::default()),
        ("40-12-12", AddressFormat::new(40, 12, 12).unwrap()),
        ("24-8-0", AddressFormat::new(24, 8, 0).unwrap()),
    ]
}

/// Benchmark packing addresses.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("address_encode");

    for (name, format) in layouts() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &format, |b, format| {
            let mut offset = 64u64;
            b.iter(|| {
                offset = (offset + 17) & 0xFFFF;
                black_box(format.encode(black_box(offset), black_box(7), black_box(120)))
            });
        });
    }

    group.finish();
}

/// Benchmark unpacking addresses.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("address_decode");

    for (name, format) in layouts() {
        let addresses: Vec<u64> = (0..1024u64)
            .map(|i| format.encode(64 + i * 16, (i % 200) as u32, (i % 100) as usize))
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(name), &format, |b, format| {
            b.iter(|| {
                for &address in &addresses {
                    black_box(format.decode(black_box(address)));
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
