use std::hint::black_box;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};

use tokenwall::{BucketConfig, Capacity, LocalBucketStore, RefillRate};

fn config(capacity: f64, refill_rate: f64) -> BucketConfig {
    BucketConfig::new(
        Capacity::try_from(capacity).unwrap(),
        RefillRate::try_from(refill_rate).unwrap(),
    )
}

fn bench_hot_key_allowed(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_bucket/hot_key_allowed");
    group.sample_size(200);

    group.bench_function("check_limit", |b| {
        let store = LocalBucketStore::default();
        // Refills far faster than the bench can drain it.
        let config = config(1e9, 1e9);
        store.check_limit("k", &config, 1).unwrap();

        b.iter(|| black_box(store.check_limit(black_box("k"), black_box(&config), black_box(1))));
    });

    group.finish();
}

fn bench_many_keys_allowed(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_bucket/many_keys_allowed");
    group.sample_size(100);

    for key_space in [1_000_usize, 100_000] {
        group.bench_function(format!("check_limit/keys={key_space}"), |b| {
            let store = LocalBucketStore::default();
            let config = config(1e9, 1e9);
            let keys: Vec<String> = (0..key_space).map(|i| format!("user_{i}")).collect();

            b.iter_batched(
                || 0_usize,
                |mut idx| {
                    idx = idx.wrapping_add(1);
                    let k = &keys[idx % keys.len()];
                    black_box(store.check_limit(black_box(k), black_box(&config), black_box(1)))
                        .ok();
                    idx
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_reject_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_bucket/reject_path");
    group.sample_size(200);

    group.bench_function("check_limit/rejected", |b| {
        let store = LocalBucketStore::default();
        let config = config(10.0, 0.001);

        // Drain so every iteration takes the reject path.
        store.check_limit("k", &config, 10).unwrap();

        b.iter(|| black_box(store.check_limit(black_box("k"), black_box(&config), black_box(1))));
    });

    group.finish();
}

fn bench_cleanup(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_bucket/cleanup");
    group.sample_size(50);

    group.bench_function("cleanup/keys=10000/nothing_stale", |b| {
        let store = LocalBucketStore::default();
        let config = config(10.0, 1.0);
        for i in 0..10_000 {
            store.check_limit(&format!("user_{i}"), &config, 1).unwrap();
        }

        b.iter(|| black_box(store.cleanup(black_box(u64::MAX))));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_hot_key_allowed,
    bench_many_keys_allowed,
    bench_reject_path,
    bench_cleanup
);
criterion_main!(benches);
