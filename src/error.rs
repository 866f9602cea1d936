/// Error type for this crate.
#[derive(Debug, thiserror::Error)]
pub enum TokenwallError {
    /// Bucket capacity is not a positive, finite number.
    #[error("invalid capacity: {0}")]
    InvalidCapacity(String),

    /// Refill rate is not a positive, finite number.
    #[error("invalid refill rate: {0}")]
    InvalidRefillRate(String),

    /// Requested token count is zero.
    #[error("invalid token count: {0}")]
    InvalidTokenCount(String),

    /// Client identifier is empty.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Idle TTL for shared buckets is zero.
    #[error("invalid idle ttl: {0}")]
    InvalidIdleTtl(String),

    /// Redis key prefix failed validation.
    #[error("invalid redis key: {0}")]
    InvalidRedisKey(String),

    /// Connection pool was configured with zero connections.
    #[error("invalid redis client connection count: {0}")]
    InvalidRedisClientConnectionCount(String),

    /// Redis error.
    #[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
    #[cfg_attr(docsrs, doc(cfg(any(feature = "redis-tokio", feature = "redis-smol"))))]
    #[error("redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Another caller is establishing the Redis connection; this call did not wait for it.
    #[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
    #[cfg_attr(docsrs, doc(cfg(any(feature = "redis-tokio", feature = "redis-smol"))))]
    #[error("redis connection is being established")]
    RedisConnectInProgress,
}
