//! Throughput of `ThreadPool::submit` under a fixed-size pool, at a
//! handful of worker counts, against an unbounded work queue so the
//! bench measures scheduling/completion overhead rather than
//! backpressure.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use juncture::pool::ThreadPool;

fn bench_submit_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_submit");

    for &workers in &[1, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            let pool = ThreadPool::fixed(workers).unwrap();
            b.iter(|| {
                let handles: Vec<_> = (0..256)
                    .map(|i| pool.submit(move || black_box(i * 2)).unwrap())
                    .collect();
                for h in handles {
                    black_box(h.get().unwrap());
                }
            });
        });
    }

    group.finish();
}

fn bench_execute_fn_no_result(c: &mut Criterion) {
    let pool = ThreadPool::fixed(4).unwrap();
    c.bench_function("pool_execute_fn", |b| {
        b.iter(|| {
            pool.execute_fn(|| {
                black_box(1 + 1);
            })
            .unwrap();
        });
    });
}

criterion_group!(benches, bench_submit_throughput, bench_execute_fn_no_result);
criterion_main!(benches);
