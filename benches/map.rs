//! Map benchmarks for in-memory and file-backed tables

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use directmap::{DirectMap, DirectMapBuilder, MemorySlotArray};

fn create_memory_map(max_capacity: usize) -> DirectMap<u64, u64, MemorySlotArray> {
    DirectMapBuilder::default()
        .max_capacity(max_capacity)
        .build_in_memory()
        .expect("Failed to create map")
}

/// Benchmark insertion including growth, at various table sizes
fn bench_map_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_insert");

    for num_items in [1_000usize, 10_000, 100_000] {
        group.throughput(Throughput::Elements(num_items as u64));

        group.bench_with_input(BenchmarkId::new("memory", num_items), &num_items, |b, &num_items| {
            b.iter_batched(
                || create_memory_map(num_items * 2),
                |map| {
                    for i in 0..num_items as u64 {
                        map.insert(i, i).expect("insert");
                    }
                    map
                },
                criterion::BatchSize::LargeInput,
            );
        });

        group.bench_with_input(BenchmarkId::new("mmap", num_items), &num_items, |b, &num_items| {
            b.iter_batched(
                || {
                    let dir = tempfile::tempdir().expect("Failed to create temp dir");
                    let map = DirectMapBuilder::new(dir.path().join("bench"))
                        .max_capacity(num_items * 2)
                        .build::<u64, u64>()
                        .expect("Failed to create map");
                    (dir, map)
                },
                |(dir, map)| {
                    for i in 0..num_items as u64 {
                        map.insert(i, i).expect("insert");
                    }
                    (dir, map)
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Benchmark lookups against a populated table
fn bench_map_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_lookup");
    let num_items = 100_000u64;

    let map = create_memory_map(num_items as usize * 2);
    for i in 0..num_items {
        map.insert(i, i * 2).expect("insert");
    }

    group.throughput(Throughput::Elements(num_items));
    group.bench_function("hit", |b| {
        b.iter(|| {
            for i in 0..num_items {
                black_box(map.get(black_box(&i)));
            }
        });
    });
    group.bench_function("miss", |b| {
        b.iter(|| {
            for i in num_items..num_items * 2 {
                black_box(map.get(black_box(&i)));
            }
        });
    });

    group.finish();
}

/// Benchmark remove followed by an insert that reuses the freed slot
fn bench_map_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_churn");
    let num_items = 10_000u64;

    let map = create_memory_map(num_items as usize * 2);
    for i in 0..num_items {
        map.insert(i, i).expect("insert");
    }

    group.throughput(Throughput::Elements(num_items));
    group.bench_function("remove_insert", |b| {
        b.iter(|| {
            for i in 0..num_items {
                map.remove(&i).expect("remove");
                map.insert(i, i).expect("insert");
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_map_insert, bench_map_lookup, bench_map_churn,);

criterion_main!(benches);
