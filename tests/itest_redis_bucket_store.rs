#![cfg(feature = "redis-tokio")]

use std::{env, sync::Arc, time::Duration};

use tokenwall::redis::{FailurePolicy, RedisKey};
use tokenwall::{
    BucketConfig, Capacity, RateLimiter, RateLimiterOptions, RedisBucketStoreOptions, RefillRate,
};

fn redis_url() -> String {
    env::var("REDIS_URL").expect(
        "REDIS_URL must be set to run redis integration tests (e.g. REDIS_URL=redis://127.0.0.1:6379/)",
    )
}

fn unique_prefix() -> RedisKey {
    let n: u64 = rand::random();
    RedisKey::try_from(format!("tokenwall_itest_{n}")).unwrap()
}

fn config(capacity: f64, refill_rate: f64) -> BucketConfig {
    BucketConfig::new(
        Capacity::try_from(capacity).unwrap(),
        RefillRate::try_from(refill_rate).unwrap(),
    )
}

fn build_rate_limiter(url: &str, prefix: &RedisKey) -> Arc<RateLimiter> {
    let client = redis::Client::open(url).unwrap();

    Arc::new(RateLimiter::new(RateLimiterOptions {
        redis: Some(RedisBucketStoreOptions {
            prefix: Some(prefix.clone()),
            failure_policy: FailurePolicy::Closed,
            ..RedisBucketStoreOptions::new(client)
        }),
        ..RateLimiterOptions::default()
    }))
}

#[test]
fn redis_store_is_absent_unless_configured() {
    let rl = RateLimiter::new(RateLimiterOptions::default());

    assert!(rl.redis().is_none());
}

#[test]
fn concurrent_tasks_across_limiters_admit_at_most_capacity() {
    let url = redis_url();

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let prefix = unique_prefix();
        let limiters = [
            build_rate_limiter(&url, &prefix),
            build_rate_limiter(&url, &prefix),
            build_rate_limiter(&url, &prefix),
        ];
        let config = config(25.0, 0.001);

        let handles: Vec<_> = (0..200)
            .map(|i| {
                let rl = Arc::clone(&limiters[i % limiters.len()]);
                tokio::spawn(async move {
                    rl.redis()
                        .unwrap()
                        .check_limit("shared", &config, 1)
                        .await
                        .unwrap()
                        .allowed
                })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 25);

        let state = limiters[0]
            .redis()
            .unwrap()
            .get_bucket_state("shared")
            .await
            .unwrap()
            .unwrap();
        assert!(state.tokens < 1.0);

        limiters[0].redis().unwrap().reset_all().await.unwrap();
    });
}

#[test]
fn rejected_request_is_admitted_after_retry_after() {
    let url = redis_url();

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let rl = build_rate_limiter(&url, &unique_prefix());
        let store = rl.redis().unwrap();
        let config = config(2.0, 2.0);

        assert!(store.check_limit("k", &config, 2).await.unwrap().allowed);

        let rejected = store.check_limit("k", &config, 1).await.unwrap();
        assert!(!rejected.allowed);
        assert!(rejected.retry_after_ms > 0 && rejected.retry_after_ms <= 500);
        assert_eq!(rejected.limit, 2);

        tokio::time::sleep(Duration::from_millis(rejected.retry_after_ms + 20)).await;

        assert!(store.check_limit("k", &config, 1).await.unwrap().allowed);

        store.reset_all().await.unwrap();
    });
}

#[test]
fn local_and_redis_stores_are_independent() {
    let url = redis_url();

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let rl = build_rate_limiter(&url, &unique_prefix());
        let config = config(1.0, 0.001);

        assert!(rl.local().check_limit("k", &config, 1).unwrap().allowed);
        assert!(!rl.local().check_limit("k", &config, 1).unwrap().allowed);

        let store = rl.redis().unwrap();
        assert!(store.check_limit("k", &config, 1).await.unwrap().allowed);
        assert_eq!(store.stats().await.unwrap().identifiers, vec!["k"]);

        store.reset_all().await.unwrap();
        assert_eq!(rl.local().stats().total_clients, 1);
    });
}

#[test]
fn cleanup_loop_leaves_redis_buckets_alone() {
    let url = redis_url();

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let rl = build_rate_limiter(&url, &unique_prefix());
        let config = config(3.0, 1.0);

        rl.local().check_limit("k", &config, 1).unwrap();
        rl.redis().unwrap().check_limit("k", &config, 1).await.unwrap();

        rl.run_cleanup_loop_with_config(50, 20);
        tokio::time::sleep(Duration::from_millis(200)).await;
        rl.stop_cleanup_loop();

        // Redis buckets expire through their TTL instead.
        assert_eq!(rl.local().stats().total_clients, 0);
        assert!(rl.redis().unwrap().get_bucket_state("k").await.unwrap().is_some());

        rl.redis().unwrap().reset_all().await.unwrap();
    });
}
