use async_trait::async_trait;

use crate::{BucketConfig, BucketState, RateLimitDecision, StoreStats, TokenwallError};

/// Common contract of the local and Redis-backed bucket stores.
///
/// Lets request-path code hold an `Arc<dyn BucketStore>` without caring where
/// bucket state lives.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tokenwall::{BucketConfig, BucketStore, LocalBucketStore};
///
/// # futures::executor::block_on(async {
/// let store: Arc<dyn BucketStore> = Arc::new(LocalBucketStore::default());
/// let config = BucketConfig::per_minute(60).unwrap();
///
/// let decision = store.check_limit("203.0.113.7", &config, 1).await.unwrap();
/// assert!(decision.allowed);
/// assert_eq!(decision.remaining, 59);
/// # });
/// ```
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Atomically refill and try to consume `tokens` from `identifier`'s bucket.
    async fn check_limit(
        &self,
        identifier: &str,
        config: &BucketConfig,
        tokens: u64,
    ) -> Result<RateLimitDecision, TokenwallError>;

    /// Forget `identifier`. Unknown identifiers are a no-op.
    async fn reset(&self, identifier: &str) -> Result<(), TokenwallError>;

    /// Forget every identifier.
    async fn reset_all(&self) -> Result<(), TokenwallError>;

    /// List tracked identifiers.
    async fn stats(&self) -> Result<StoreStats, TokenwallError>;

    /// Inspect a bucket without refilling or consuming.
    async fn get_bucket_state(&self, identifier: &str)
    -> Result<Option<BucketState>, TokenwallError>;
}
