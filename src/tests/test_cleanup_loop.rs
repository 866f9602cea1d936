use std::{sync::Arc, time::Duration};

use crate::{
    BucketConfig, EvictionOptions, LocalBucketStoreOptions, RateLimiter, RateLimiterOptions,
};

fn rate_limiter() -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(RateLimiterOptions::default()))
}

fn config() -> BucketConfig {
    BucketConfig::per_minute(600).unwrap()
}

#[test]
fn test_local_cleanup_loop_runs() {
    let rl = rate_limiter();

    // Add some entries
    let config = config();
    rl.local().check_limit("key1", &config, 1).unwrap();
    rl.local().check_limit("key2", &config, 1).unwrap();
    rl.local().check_limit("key3", &config, 1).unwrap();

    // Verify entries exist
    assert_eq!(rl.local().buckets().len(), 3);

    // Start cleanup loop with aggressive timing (100ms stale, 50ms interval)
    rl.run_cleanup_loop_with_config(100, 50);

    // Wait for entries to become stale and be cleaned up
    std::thread::sleep(Duration::from_millis(300));

    // Entries should be cleaned up now
    assert_eq!(rl.local().buckets().len(), 0);

    rl.stop_cleanup_loop();
}

#[test]
fn test_cleanup_loop_keeps_active_entries() {
    let rl = rate_limiter();

    let config = config();
    rl.local().check_limit("key1", &config, 1).unwrap();

    // Start cleanup with 500ms stale threshold, 100ms interval
    rl.run_cleanup_loop_with_config(500, 100);

    // Keep the key active by updating it periodically
    for _ in 0..5 {
        std::thread::sleep(Duration::from_millis(100));
        rl.local().check_limit("key1", &config, 1).unwrap();
    }

    // Key should still exist since it's been kept active
    assert_eq!(rl.local().buckets().len(), 1);

    rl.stop_cleanup_loop();
}

#[test]
fn test_stop_cleanup_loop_prevents_future_cleanup() {
    let rl = rate_limiter();

    let config = config();
    rl.local().check_limit("key1", &config, 1).unwrap();
    assert_eq!(rl.local().buckets().len(), 1);

    // The cleanup thread runs immediately on start, so stop before the key is stale.
    rl.run_cleanup_loop_with_config(100, 80);
    std::thread::sleep(Duration::from_millis(20));

    // Idempotent stop
    rl.stop_cleanup_loop();
    rl.stop_cleanup_loop();

    // If the loop were still running, a later tick would observe the key as stale and remove it.
    std::thread::sleep(Duration::from_millis(220));
    assert_eq!(rl.local().buckets().len(), 1);
}

#[test]
fn test_run_cleanup_loop_with_config_is_idempotent() {
    let rl = rate_limiter();

    let config = config();
    rl.local().check_limit("key1", &config, 1).unwrap();
    assert_eq!(rl.local().buckets().len(), 1);

    // Start with a long stale threshold.
    rl.run_cleanup_loop_with_config(5_000, 50);

    // Second call should be a no-op (no reconfiguration / no second loop).
    rl.run_cleanup_loop_with_config(10, 50);

    // Wait long enough that the key would be stale under the second configuration.
    std::thread::sleep(Duration::from_millis(120));
    assert_eq!(rl.local().buckets().len(), 1);

    rl.stop_cleanup_loop();
}

#[test]
fn test_stop_then_restart_cleanup_loop_works() {
    let rl = rate_limiter();

    let config = config();
    rl.local().check_limit("key1", &config, 1).unwrap();
    assert_eq!(rl.local().buckets().len(), 1);

    rl.run_cleanup_loop_with_config(100, 80);
    std::thread::sleep(Duration::from_millis(20));
    rl.stop_cleanup_loop();
    std::thread::sleep(Duration::from_millis(220));
    assert_eq!(rl.local().buckets().len(), 1);

    // Restart: now the key is stale and should be removed by the first cleanup.
    rl.run_cleanup_loop_with_config(100, 80);
    std::thread::sleep(Duration::from_millis(120));
    assert_eq!(rl.local().buckets().len(), 0);

    rl.stop_cleanup_loop();
}

#[test]
fn test_run_cleanup_loop_uses_store_eviction_options() {
    let rl = Arc::new(RateLimiter::new(RateLimiterOptions {
        local: LocalBucketStoreOptions {
            eviction: EvictionOptions {
                stale_after_ms: 50,
                interval_ms: 30,
            },
        },
        ..RateLimiterOptions::default()
    }));

    rl.local().check_limit("key1", &config(), 1).unwrap();
    rl.run_cleanup_loop();

    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(rl.local().buckets().len(), 0);

    rl.stop_cleanup_loop();
}

#[test]
fn test_cleanup_thread_exits_when_limiter_is_dropped() {
    let rl = rate_limiter();
    let weak = Arc::downgrade(&rl);

    rl.run_cleanup_loop_with_config(1_000, 10);
    drop(rl);

    // The loop holds only a weak reference between sweeps.
    std::thread::sleep(Duration::from_millis(50));
    assert!(weak.upgrade().is_none());
}

#[test]
fn test_default_eviction_options() {
    let eviction = EvictionOptions::default();

    assert_eq!(eviction.stale_after_ms, 3_600_000);
    assert_eq!(eviction.interval_ms, 600_000);
}
