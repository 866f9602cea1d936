//! Top-level entrypoint that wires store implementations.
//!
//! [`RateLimiter`] always carries a [`LocalBucketStore`]. With a Redis feature
//! enabled it also carries a [`RedisBucketStore`](crate::RedisBucketStore).

use std::{
    sync::{Arc, Mutex, PoisonError, Weak, mpsc},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{LocalBucketStore, LocalBucketStoreOptions};

#[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
use crate::{RedisBucketStore, RedisBucketStoreOptions};

/// Top-level configuration for [`RateLimiter`].
#[derive(Clone, Debug, Default)]
pub struct RateLimiterOptions {
    /// Options for the local store.
    pub local: LocalBucketStoreOptions,
    /// Options for the Redis store.
    #[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
    #[cfg_attr(docsrs, doc(cfg(any(feature = "redis-tokio", feature = "redis-smol"))))]
    pub redis: Option<RedisBucketStoreOptions>,
}

struct CleanupLoop {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Rate limiter entrypoint.
///
/// Owns the configured stores and the background eviction loop of the local store.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tokenwall::{BucketConfig, RateLimiter, RateLimiterOptions};
///
/// let rl = Arc::new(RateLimiter::new(RateLimiterOptions::default()));
/// rl.run_cleanup_loop();
///
/// let config = BucketConfig::per_minute(30).unwrap();
/// assert!(rl.local().check_limit("user_123", &config, 1).unwrap().allowed);
///
/// rl.stop_cleanup_loop();
/// ```
pub struct RateLimiter {
    local: LocalBucketStore,
    #[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
    redis: Option<RedisBucketStore>,
    cleanup_loop: Mutex<Option<CleanupLoop>>,
}

impl RateLimiter {
    /// Create a new [`RateLimiter`].
    pub fn new(options: RateLimiterOptions) -> Self {
        Self {
            local: LocalBucketStore::new(options.local),
            #[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
            redis: options.redis.map(RedisBucketStore::new),
            cleanup_loop: Mutex::new(None),
        }
    }

    /// Access the local store.
    pub fn local(&self) -> &LocalBucketStore {
        &self.local
    }

    /// Access the Redis store, if one was configured.
    #[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
    #[cfg_attr(docsrs, doc(cfg(any(feature = "redis-tokio", feature = "redis-smol"))))]
    pub fn redis(&self) -> Option<&RedisBucketStore> {
        self.redis.as_ref()
    }

    /// Start evicting idle local buckets using the store's [`EvictionOptions`](crate::EvictionOptions).
    ///
    /// See [`run_cleanup_loop_with_config`](Self::run_cleanup_loop_with_config).
    pub fn run_cleanup_loop(self: &Arc<Self>) {
        let eviction = self.local.eviction();
        self.run_cleanup_loop_with_config(eviction.stale_after_ms, eviction.interval_ms);
    }

    /// Start a background thread that removes local buckets idle for longer
    /// than `stale_after_ms`, sweeping immediately and then every `interval_ms`.
    ///
    /// - **Idempotent:** does nothing while a loop is already running
    /// - **Weak ownership:** the thread exits once the limiter is dropped
    ///
    /// Redis buckets need no sweep; they expire through their TTL.
    pub fn run_cleanup_loop_with_config(self: &Arc<Self>, stale_after_ms: u64, interval_ms: u64) {
        let mut cleanup_loop = self
            .cleanup_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(running) = cleanup_loop.as_ref()
            && !running.handle.is_finished()
        {
            return;
        }

        let (stop, stopped) = mpsc::channel::<()>();
        let limiter = Arc::downgrade(self);
        let interval = Duration::from_millis(interval_ms.max(1));

        let spawned = thread::Builder::new()
            .name("tokenwall-cleanup".to_string())
            .spawn(move || Self::cleanup_loop(limiter, stale_after_ms, interval, stopped));

        match spawned {
            Ok(handle) => *cleanup_loop = Some(CleanupLoop { stop, handle }),
            Err(err) => {
                tracing::error!(error = ?err, "local.cleanup.error, failed to spawn cleanup thread");
            }
        }
    } // end method run_cleanup_loop_with_config

    fn cleanup_loop(
        limiter: Weak<Self>,
        stale_after_ms: u64,
        interval: Duration,
        stopped: mpsc::Receiver<()>,
    ) {
        loop {
            let Some(rl) = limiter.upgrade() else {
                break;
            };

            let removed = rl.local.cleanup(stale_after_ms);
            if removed > 0 {
                tracing::debug!(removed, "local.cleanup, evicted idle buckets");
            }

            drop(rl);

            match stopped.recv_timeout(interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                // stop requested, or the limiter (and its sender) is gone
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    } // end fn cleanup_loop

    /// Stop the cleanup loop and wait for its thread to exit. Idempotent.
    pub fn stop_cleanup_loop(&self) {
        let running = self
            .cleanup_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(CleanupLoop { stop, handle }) = running else {
            return;
        };

        // The thread may already have exited; either way it no longer runs.
        let _ = stop.send(());

        if handle.join().is_err() {
            tracing::error!("local.cleanup.error, cleanup thread panicked");
        }
    } // end method stop_cleanup_loop
}
