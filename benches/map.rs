//! Read/write throughput of [`ConcurrentHashMap`] under contention, at a
//! handful of reader-thread counts, against a map pre-populated with a
//! fixed key set.

use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use juncture::map::ConcurrentHashMap;

const KEYS: usize = 4096;

fn populated() -> ConcurrentHashMap<usize, usize> {
    let map = ConcurrentHashMap::new();
    for i in 0..KEYS {
        map.insert(i, i * 2);
    }
    map
}

fn bench_single_threaded_get(c: &mut Criterion) {
    let map = populated();
    let mut i = 0usize;
    c.bench_function("map_get_single_threaded", |b| {
        b.iter(|| {
            i = (i + 1) % KEYS;
            black_box(map.get(&i));
        });
    });
}

fn bench_concurrent_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_concurrent_get");

    for &readers in &[1, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(readers), &readers, |b, &readers| {
            let map = Arc::new(populated());
            b.iter(|| {
                let handles: Vec<_> = (0..readers)
                    .map(|t| {
                        let map = map.clone();
                        thread::spawn(move || {
                            for i in 0..1000 {
                                black_box(map.get(&((i + t) % KEYS)));
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_insert_with_rehash(c: &mut Criterion) {
    c.bench_function("map_insert_triggering_rehash", |b| {
        b.iter(|| {
            let map = ConcurrentHashMap::new();
            for i in 0..KEYS {
                map.insert(i, i);
            }
            black_box(map.len());
        });
    });
}

criterion_group!(
    benches,
    bench_single_threaded_get,
    bench_concurrent_reads,
    bench_insert_with_rehash
);
criterion_main!(benches);
