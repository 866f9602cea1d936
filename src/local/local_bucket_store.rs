use async_trait::async_trait;
use dashmap::DashMap;

use crate::{
    BucketConfig, BucketState, BucketStore, RateLimitDecision, StoreStats, TokenwallError,
    bucket,
    common::{unix_time_ms, validate_request},
};

/// Idle-bucket eviction settings for the local store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvictionOptions {
    /// Buckets not refilled for longer than this are removed.
    pub stale_after_ms: u64,
    /// Delay between two sweeps.
    pub interval_ms: u64,
}

impl Default for EvictionOptions {
    /// One hour of inactivity, swept every ten minutes.
    fn default() -> Self {
        Self {
            stale_after_ms: 60 * 60 * 1000,
            interval_ms: 10 * 60 * 1000,
        }
    }
}

/// Configuration for [`LocalBucketStore`].
#[derive(Clone, Debug, Default)]
pub struct LocalBucketStoreOptions {
    /// Used by [`RateLimiter::run_cleanup_loop`](crate::RateLimiter::run_cleanup_loop).
    pub eviction: EvictionOptions,
}

/// In-process token-bucket store.
///
/// Per-identifier state lives in a [`DashMap`]. Every `check_limit` runs its
/// refill-and-consume step while holding the entry guard of that identifier's
/// shard, so calls for the same identifier are serialized and never
/// over-admit. Identifiers on other shards proceed in parallel.
///
/// # Memory
///
/// Buckets are created on first sight and kept until [`reset`](Self::reset),
/// [`reset_all`](Self::reset_all) or an eviction sweep removes them. Start
/// [`RateLimiter::run_cleanup_loop`](crate::RateLimiter::run_cleanup_loop) when
/// the identifier space is unbounded.
///
/// # Examples
///
/// ```
/// use tokenwall::{BucketConfig, Capacity, LocalBucketStore, RefillRate};
///
/// let store = LocalBucketStore::default();
/// let config = BucketConfig::new(Capacity::try_from(3.0).unwrap(), RefillRate::try_from(1.0).unwrap());
///
/// for _ in 0..3 {
///     assert!(store.check_limit("user_123", &config, 1).unwrap().allowed);
/// }
///
/// let decision = store.check_limit("user_123", &config, 1).unwrap();
/// assert!(!decision.allowed);
/// assert!(decision.retry_after_ms > 0);
/// ```
#[derive(Debug, Default)]
pub struct LocalBucketStore {
    eviction: EvictionOptions,
    buckets: DashMap<String, BucketState>,
}

impl LocalBucketStore {
    /// Create an empty store.
    pub fn new(options: LocalBucketStoreOptions) -> Self {
        Self {
            eviction: options.eviction,
            buckets: DashMap::new(),
        }
    }

    /// Eviction settings this store was built with.
    pub fn eviction(&self) -> EvictionOptions {
        self.eviction
    }

    pub(crate) fn buckets(&self) -> &DashMap<String, BucketState> {
        &self.buckets
    }

    /// Refill `identifier`'s bucket and try to consume `tokens` from it.
    ///
    /// An identifier seen for the first time starts with a full bucket.
    ///
    /// # Errors
    ///
    /// [`TokenwallError::InvalidIdentifier`] for an empty identifier and
    /// [`TokenwallError::InvalidTokenCount`] for `tokens == 0`.
    pub fn check_limit(
        &self,
        identifier: &str,
        config: &BucketConfig,
        tokens: u64,
    ) -> Result<RateLimitDecision, TokenwallError> {
        self.check_limit_at(identifier, config, tokens, unix_time_ms())
    }

    pub(crate) fn check_limit_at(
        &self,
        identifier: &str,
        config: &BucketConfig,
        tokens: u64,
        now_ms: u64,
    ) -> Result<RateLimitDecision, TokenwallError> {
        validate_request(identifier, tokens)?;

        let consume = |state: &mut BucketState| {
            let evaluation = bucket::evaluate(*state, config, tokens, now_ms);
            *state = evaluation.state;

            RateLimitDecision::new(
                config,
                evaluation.allowed,
                evaluation.state.tokens,
                evaluation.retry_after_ms,
                now_ms,
            )
        };

        // Avoid allocating the key on the hot path.
        if let Some(mut state) = self.buckets.get_mut(identifier) {
            return Ok(consume(state.value_mut()));
        }

        let mut state = self
            .buckets
            .entry(identifier.to_string())
            .or_insert_with(|| BucketState::full(&config.capacity, now_ms));

        Ok(consume(state.value_mut()))
    } // end method check_limit_at

    /// Forget `identifier`. Unknown identifiers are a no-op.
    pub fn reset(&self, identifier: &str) {
        self.buckets.remove(identifier);
    }

    /// Forget every identifier.
    pub fn reset_all(&self) {
        self.buckets.clear();
    }

    /// Number and names of tracked identifiers.
    pub fn stats(&self) -> StoreStats {
        let identifiers: Vec<String> = self
            .buckets
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        StoreStats {
            total_clients: identifiers.len(),
            identifiers,
        }
    }

    /// Current state of `identifier`'s bucket, as last written.
    pub fn get_bucket_state(&self, identifier: &str) -> Option<BucketState> {
        self.buckets.get(identifier).map(|state| *state)
    }

    /// Remove buckets idle for longer than `stale_after_ms`. Returns how many were removed.
    ///
    /// One sweep of what [`RateLimiter::run_cleanup_loop`](crate::RateLimiter::run_cleanup_loop)
    /// does periodically, for callers that schedule eviction themselves.
    pub fn cleanup(&self, stale_after_ms: u64) -> usize {
        self.cleanup_at(stale_after_ms, unix_time_ms())
    }

    pub(crate) fn cleanup_at(&self, stale_after_ms: u64, now_ms: u64) -> usize {
        let before = self.buckets.len();
        let cutoff = now_ms.saturating_sub(stale_after_ms);

        // `retain` holds each shard's write lock, so a sweep never interleaves
        // with a consumption on the same identifier.
        self.buckets
            .retain(|_, state| state.last_refill_ms >= cutoff);

        before.saturating_sub(self.buckets.len())
    } // end method cleanup_at
} // end of impl

#[async_trait]
impl BucketStore for LocalBucketStore {
    async fn check_limit(
        &self,
        identifier: &str,
        config: &BucketConfig,
        tokens: u64,
    ) -> Result<RateLimitDecision, TokenwallError> {
        LocalBucketStore::check_limit(self, identifier, config, tokens)
    }

    async fn reset(&self, identifier: &str) -> Result<(), TokenwallError> {
        LocalBucketStore::reset(self, identifier);
        Ok(())
    }

    async fn reset_all(&self) -> Result<(), TokenwallError> {
        LocalBucketStore::reset_all(self);
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, TokenwallError> {
        Ok(LocalBucketStore::stats(self))
    }

    async fn get_bucket_state(
        &self,
        identifier: &str,
    ) -> Result<Option<BucketState>, TokenwallError> {
        Ok(LocalBucketStore::get_bucket_state(self, identifier))
    }
}
