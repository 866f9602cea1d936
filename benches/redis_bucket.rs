use criterion::{Criterion, criterion_group, criterion_main};

#[cfg(feature = "redis-tokio")]
mod enabled {
    use std::{env, hint::black_box, time::Duration};

    use criterion::Criterion;

    use tokenwall::redis::{FailurePolicy, RedisKey};
    use tokenwall::{BucketConfig, Capacity, RedisBucketStore, RedisBucketStoreOptions, RefillRate};

    fn redis_url() -> String {
        env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string())
    }

    pub fn bench_check_limit(c: &mut Criterion) {
        let mut group = c.benchmark_group("redis_bucket");
        group.sample_size(50);

        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(2)
            .build()
            .unwrap();

        let store = RedisBucketStore::new(RedisBucketStoreOptions {
            prefix: Some(RedisKey::try_from("bench").unwrap()),
            failure_policy: FailurePolicy::Closed,
            ..RedisBucketStoreOptions::new(redis::Client::open(redis_url()).unwrap())
        });

        let allowed = BucketConfig::new(
            Capacity::try_from(1e9).unwrap(),
            RefillRate::try_from(1e9).unwrap(),
        );
        let rejected = BucketConfig::new(
            Capacity::try_from(1.0).unwrap(),
            RefillRate::try_from(0.001).unwrap(),
        );

        // Warm the connection and drain the rejecting bucket.
        rt.block_on(async {
            store.connect().await.unwrap();
            store.check_limit("hot", &allowed, 1).await.unwrap();
            store.check_limit("drained", &rejected, 1).await.unwrap();
        });

        group.bench_function("check_limit/hot_key", |b| {
            b.iter(|| {
                rt.block_on(async {
                    black_box(
                        store
                            .check_limit(black_box("hot"), black_box(&allowed), black_box(1))
                            .await,
                    )
                })
            });
        });

        group.bench_function("check_limit/rejected", |b| {
            b.iter(|| {
                rt.block_on(async {
                    black_box(
                        store
                            .check_limit(black_box("drained"), black_box(&rejected), black_box(1))
                            .await,
                    )
                })
            });
        });

        group.bench_function("get_bucket_state/hot_key", |b| {
            b.iter(|| rt.block_on(async { black_box(store.get_bucket_state(black_box("hot")).await) }));
        });

        rt.block_on(async {
            store.reset_all().await.unwrap();
        });

        // Give outstanding IO a moment before runtime drop.
        std::thread::sleep(Duration::from_millis(50));
        group.finish();
    }
}

#[cfg(feature = "redis-tokio")]
fn bench_check_limit(c: &mut Criterion) {
    enabled::bench_check_limit(c)
}

#[cfg(not(feature = "redis-tokio"))]
fn bench_check_limit(_: &mut Criterion) {}

criterion_group!(benches, bench_check_limit);
criterion_main!(benches);
