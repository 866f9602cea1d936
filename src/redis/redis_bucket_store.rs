use async_trait::async_trait;
use redis::Client;

use crate::{
    BucketConfig, BucketState, BucketStore, RateLimitDecision, StoreStats, TokenwallError,
    common::{unix_time_ms, validate_request},
    redis::{
        ConnectionCount, ConnectionLimits, FailurePolicy, IdleTtlSeconds, RedisKey,
        common::RedisConnector,
        redis_bucket_proxy::{RedisBucketProxy, RedisBucketProxyConsumeResult},
    },
};

/// Upper bound on a bucket key's TTL: ten years.
///
/// Redis rejects `EXPIRE` values whose deadline overflows, which a huge
/// capacity over a tiny refill rate would otherwise produce.
pub(crate) const MAX_TTL_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

/// Configuration for [`RedisBucketStore`].
///
/// # Requirements
///
/// - **Redis version:** >= 4.0 (multi-field `HSET`)
/// - **Runtime:** Tokio or Smol (via `redis-tokio` or `redis-smol` features)
///
/// # Examples
///
/// ```no_run
/// use tokenwall::redis::{FailurePolicy, RedisBucketStoreOptions, RedisKey};
///
/// let client = redis::Client::open("redis://127.0.0.1:6379/").unwrap();
///
/// let options = RedisBucketStoreOptions {
///     prefix: Some(RedisKey::try_from("myapp").unwrap()), // keys: myapp:<identifier>
///     failure_policy: FailurePolicy::Open,
///     ..RedisBucketStoreOptions::new(client)
/// };
/// ```
#[derive(Clone, Debug)]
pub struct RedisBucketStoreOptions {
    /// Redis client from the `redis` crate. No connection is opened until first use
    /// or [`RedisBucketStore::connect`].
    pub client: Client,

    /// Optional prefix for all bucket keys.
    ///
    /// Keys are `<prefix>:<identifier>`. If `None`, defaults to `"tokenwall"`.
    /// Use distinct prefixes for rules with different capacities.
    pub prefix: Option<RedisKey>,

    /// Number of multiplexed connections to open.
    pub connection_count: ConnectionCount,

    /// Connect and reply timeouts, and connect retries.
    pub connection_limits: ConnectionLimits,

    /// Inactivity window after which an idle bucket key expires.
    ///
    /// Raised per rule to at least the time a bucket needs to refill
    /// completely, so expiry never returns tokens early.
    pub idle_ttl: IdleTtlSeconds,

    /// Behaviour of `check_limit` when Redis is unreachable or errors.
    pub failure_policy: FailurePolicy,
}

impl RedisBucketStoreOptions {
    /// Defaults for everything but the client: `tokenwall` prefix, one
    /// connection, one second timeouts, one hour TTL, fail open.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            prefix: None,
            connection_count: ConnectionCount::default(),
            connection_limits: ConnectionLimits::default(),
            idle_ttl: IdleTtlSeconds::default(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

/// Token-bucket store shared by every process that points at the same Redis.
///
/// Each `check_limit` is one Lua script execution that reads the bucket,
/// refills it, consumes from it, writes it back and refreshes its TTL. Redis
/// runs scripts atomically, so concurrent callers on any number of hosts can
/// never both spend the same token. The store itself holds no lock and never
/// retries.
///
/// # Failure Handling
///
/// With [`FailurePolicy::Open`] (the default), a connection or script error
/// is logged with `tracing::warn!` and the request is admitted with
/// `remaining = limit`. Configuration errors are always returned.
///
/// A check never waits longer than [`ConnectionLimits`] allow. While one
/// caller is connecting, concurrent checks do not queue behind it; they fail
/// with [`TokenwallError::RedisConnectInProgress`] and the failure policy
/// applies.
///
/// # Clocks
///
/// The calling process supplies the timestamp. Hosts should run NTP; a host
/// whose clock is behind the last writer refills nothing until it catches up.
///
/// # Examples
///
/// ```no_run
/// use tokenwall::{BucketConfig, RedisBucketStore, RedisBucketStoreOptions};
///
/// # async fn run() -> Result<(), tokenwall::TokenwallError> {
/// let client = redis::Client::open("redis://127.0.0.1:6379/")?;
/// let store = RedisBucketStore::new(RedisBucketStoreOptions::new(client));
/// store.connect().await?;
///
/// let config = BucketConfig::per_minute(100)?;
/// let decision = store.check_limit("203.0.113.7", &config, 1).await?;
///
/// if !decision.allowed {
///     // send 429 with Retry-After: decision.retry_after_ms
/// }
///
/// store.disconnect();
/// # Ok(())
/// # }
/// ```
pub struct RedisBucketStore {
    connector: RedisConnector,
    proxy: RedisBucketProxy,
    idle_ttl: IdleTtlSeconds,
    failure_policy: FailurePolicy,
}

impl RedisBucketStore {
    /// Create a store. Does not connect.
    pub fn new(options: RedisBucketStoreOptions) -> Self {
        let prefix = options.prefix.unwrap_or_else(RedisKey::default_prefix);

        Self {
            connector: RedisConnector::new(
                options.client,
                options.connection_count,
                options.connection_limits,
            ),
            proxy: RedisBucketProxy::new(&prefix),
            idle_ttl: options.idle_ttl,
            failure_policy: options.failure_policy,
        }
    }

    /// Open the connection pool now instead of on the first check. Idempotent.
    pub async fn connect(&self) -> Result<(), TokenwallError> {
        self.connector.connection().await.map(|_| ())
    }

    /// Drop the connection pool. Idempotent.
    ///
    /// A later call that needs Redis reconnects transparently.
    pub fn disconnect(&self) {
        self.connector.disconnect();
    }

    /// Whether a connection pool is currently held.
    pub fn is_connected(&self) -> bool {
        self.connector.is_connected()
    }

    /// Atomically refill `identifier`'s bucket and try to consume `tokens` from it.
    ///
    /// # Errors
    ///
    /// - [`TokenwallError::InvalidIdentifier`] / [`TokenwallError::InvalidTokenCount`]
    ///   for a malformed request, regardless of the failure policy
    /// - [`TokenwallError::RedisError`] or [`TokenwallError::RedisConnectInProgress`]
    ///   only with [`FailurePolicy::Closed`]
    pub async fn check_limit(
        &self,
        identifier: &str,
        config: &BucketConfig,
        tokens: u64,
    ) -> Result<RateLimitDecision, TokenwallError> {
        validate_request(identifier, tokens)?;

        let now_ms = unix_time_ms();

        match self.consume(identifier, config, tokens, now_ms).await {
            Ok(result) => {
                if result.clock_skew_ms > 0 {
                    tracing::warn!(
                        identifier,
                        skew_ms = result.clock_skew_ms,
                        "redis.clock.skew, local clock is behind the last refill, treating elapsed time as zero"
                    );
                }

                Ok(RateLimitDecision {
                    remaining: result.remaining,
                    ..RateLimitDecision::new(
                        config,
                        result.allowed,
                        result.tokens,
                        result.retry_after_ms,
                        now_ms,
                    )
                })
            }
            Err(err) => match self.failure_policy {
                FailurePolicy::Open => {
                    tracing::warn!(
                        error = ?err,
                        identifier,
                        "redis.check_limit.error, failing open"
                    );

                    Ok(RateLimitDecision::fail_open(config, now_ms))
                }
                FailurePolicy::Closed => Err(err),
            },
        }
    } // end method check_limit

    async fn consume(
        &self,
        identifier: &str,
        config: &BucketConfig,
        tokens: u64,
        now_ms: u64,
    ) -> Result<RedisBucketProxyConsumeResult, TokenwallError> {
        let mut connection_manager = self.connector.try_connection().await?;

        self.proxy
            .check_and_consume(
                &mut connection_manager,
                identifier,
                config,
                tokens,
                now_ms,
                self.ttl_seconds(config),
            )
            .await
    }

    /// Key TTL for `config`: the idle window, but never shorter than a full
    /// refill, and never longer than [`MAX_TTL_SECONDS`].
    pub(crate) fn ttl_seconds(&self, config: &BucketConfig) -> u64 {
        let full_refill_seconds = config.full_refill_ms().div_ceil(1000);
        (*self.idle_ttl)
            .max(full_refill_seconds)
            .min(MAX_TTL_SECONDS)
    }

    /// Delete `identifier`'s bucket. Unknown identifiers are a no-op.
    pub async fn reset(&self, identifier: &str) -> Result<(), TokenwallError> {
        let mut connection_manager = self.connector.connection().await?;
        self.proxy.delete(&mut connection_manager, identifier).await
    }

    /// Delete every bucket under this store's prefix.
    ///
    /// Uses `SCAN`, so buckets created while the reset is running may survive it.
    pub async fn reset_all(&self) -> Result<(), TokenwallError> {
        let mut connection_manager = self.connector.connection().await?;
        let keys = self.proxy.scan_keys(&mut connection_manager).await?;

        self.proxy.delete_keys(&mut connection_manager, &keys).await
    }

    /// Identifiers with a live bucket under this store's prefix.
    pub async fn stats(&self) -> Result<StoreStats, TokenwallError> {
        let mut connection_manager = self.connector.connection().await?;
        let keys = self.proxy.scan_keys(&mut connection_manager).await?;

        let key_generator = self.proxy.key_generator();
        let identifiers: Vec<String> = keys
            .iter()
            .filter_map(|key| key_generator.get_identifier(key))
            .map(str::to_string)
            .collect();

        Ok(StoreStats {
            total_clients: identifiers.len(),
            identifiers,
        })
    }

    /// Stored state of `identifier`'s bucket, without refilling it.
    pub async fn get_bucket_state(
        &self,
        identifier: &str,
    ) -> Result<Option<BucketState>, TokenwallError> {
        let mut connection_manager = self.connector.connection().await?;
        self.proxy.read_state(&mut connection_manager, identifier).await
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn check_limit(
        &self,
        identifier: &str,
        config: &BucketConfig,
        tokens: u64,
    ) -> Result<RateLimitDecision, TokenwallError> {
        RedisBucketStore::check_limit(self, identifier, config, tokens).await
    }

    async fn reset(&self, identifier: &str) -> Result<(), TokenwallError> {
        RedisBucketStore::reset(self, identifier).await
    }

    async fn reset_all(&self) -> Result<(), TokenwallError> {
        RedisBucketStore::reset_all(self).await
    }

    async fn stats(&self) -> Result<StoreStats, TokenwallError> {
        RedisBucketStore::stats(self).await
    }

    async fn get_bucket_state(
        &self,
        identifier: &str,
    ) -> Result<Option<BucketState>, TokenwallError> {
        RedisBucketStore::get_bucket_state(self, identifier).await
    }
}
