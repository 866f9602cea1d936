use std::{
    ops::Deref,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use redis::{
    Client,
    aio::{ConnectionManager, ConnectionManagerConfig},
};

use crate::TokenwallError;

/// What a Redis-backed store does when Redis cannot be consulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Admit the request with a full `remaining` and log the failure.
    ///
    /// An outage of the shared store degrades to "unlimited" instead of "unavailable".
    #[default]
    Open,
    /// Return the Redis error to the caller.
    Closed,
}

/// Time-to-live applied to a bucket key on every check.
///
/// Idle identifiers expire from Redis after this many seconds without traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IdleTtlSeconds(u64);

impl Default for IdleTtlSeconds {
    /// One hour.
    fn default() -> Self {
        Self(60 * 60)
    }
}

impl Deref for IdleTtlSeconds {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for IdleTtlSeconds {
    type Error = TokenwallError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value == 0 {
            Err(TokenwallError::InvalidIdleTtl(
                "Idle ttl must be at least 1 second".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Number of multiplexed connections a store opens to Redis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionCount(usize);

impl Default for ConnectionCount {
    fn default() -> Self {
        Self(1)
    }
}

impl Deref for ConnectionCount {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<usize> for ConnectionCount {
    type Error = TokenwallError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        if value == 0 {
            Err(TokenwallError::InvalidRedisClientConnectionCount(
                "connection count must be > 0".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// A validated newtype for the Redis key prefix.
///
/// This is a string with the following constraints:
/// - Must not be empty
/// - Must not be longer than 255 bytes
/// - Must not contain colons or glob metacharacters (`*`, `?`, `[`, `]`, `\`)
#[derive(Debug, Clone, PartialEq, PartialOrd, Hash, Eq)]
pub struct RedisKey(Arc<str>);

impl RedisKey {
    /// The prefix used when none is configured.
    pub fn default_prefix() -> Self {
        Self(Arc::from("tokenwall"))
    }
}

impl Deref for RedisKey {
    type Target = Arc<str>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<String> for RedisKey {
    type Error = TokenwallError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Err(TokenwallError::InvalidRedisKey(
                "Redis key must not be empty".to_string(),
            ))
        } else if value.len() > 255 {
            Err(TokenwallError::InvalidRedisKey(
                "Redis key must not be longer than 255 characters".to_string(),
            ))
        } else if value.contains(':') {
            Err(TokenwallError::InvalidRedisKey(
                "Redis key must not contain colons".to_string(),
            ))
        } else if value.contains(['*', '?', '[', ']', '\\']) {
            Err(TokenwallError::InvalidRedisKey(
                "Redis key must not contain glob characters".to_string(),
            ))
        } else {
            Ok(Self(Arc::from(value)))
        }
    }
}

impl TryFrom<&str> for RedisKey {
    type Error = TokenwallError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

/// Maps identifiers to bucket keys: `<prefix>:<identifier>`.
#[derive(Clone, Debug)]
pub(crate) struct RedisKeyGenerator {
    key_prefix: String,
    scan_pattern: String,
}

impl RedisKeyGenerator {
    pub(crate) fn new(prefix: &RedisKey) -> Self {
        Self {
            key_prefix: format!("{}:", **prefix),
            scan_pattern: format!("{}:*", **prefix),
        }
    }

    pub(crate) fn get_bucket_key(&self, identifier: &str) -> String {
        let mut key = String::with_capacity(self.key_prefix.len() + identifier.len());
        key.push_str(&self.key_prefix);
        key.push_str(identifier);
        key
    }

    pub(crate) fn get_scan_pattern(&self) -> &str {
        &self.scan_pattern
    }

    pub(crate) fn get_identifier<'a>(&self, bucket_key: &'a str) -> Option<&'a str> {
        bucket_key.strip_prefix(self.key_prefix.as_str())
    }
}

/// Bounds on how long a store waits for Redis.
///
/// `check_limit` fails open (or closed) once these are exhausted, so they cap
/// the latency a Redis outage adds to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Timeout for establishing one connection, including its handshake.
    pub connection_timeout: Duration,
    /// Timeout for a single command or script reply.
    pub response_timeout: Duration,
    /// Reconnect attempts after the first failed connect.
    pub connect_retries: usize,
}

impl Default for ConnectionLimits {
    /// One second to connect, one second per reply, one retry.
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_secs(1),
            connect_retries: 1,
        }
    }
}

impl ConnectionLimits {
    fn manager_config(&self) -> ConnectionManagerConfig {
        ConnectionManagerConfig::new()
            .set_connection_timeout(self.connection_timeout)
            .set_response_timeout(self.response_timeout)
            .set_number_of_retries(self.connect_retries)
    }
}

/// Round-robin set of [`redis::aio::ConnectionManager`]s.
pub(crate) struct RedisConnectionPool {
    connection_managers: Arc<Vec<ConnectionManager>>,
    track_index: AtomicUsize,
}

impl RedisConnectionPool {
    pub(crate) async fn from_client(
        client: &Client,
        connection_count: ConnectionCount,
        limits: &ConnectionLimits,
    ) -> Result<Self, TokenwallError> {
        let mut connection_managers = Vec::with_capacity(*connection_count);

        for _ in 0..*connection_count {
            connection_managers.push(
                client
                    .get_connection_manager_with_config(limits.manager_config())
                    .await?,
            );
        }

        Ok(Self {
            connection_managers: Arc::new(connection_managers),
            track_index: AtomicUsize::new(0),
        })
    }

    pub(crate) fn get(&self) -> ConnectionManager {
        let index = self.track_index.fetch_add(1, Ordering::Relaxed);
        self.connection_managers[index % self.connection_managers.len()].clone()
    } // end method get
} // end impl RedisConnectionPool

/// Owns the connection pool of one store and establishes it on demand.
pub(crate) struct RedisConnector {
    client: Client,
    connection_count: ConnectionCount,
    limits: ConnectionLimits,
    pool: RwLock<Option<RedisConnectionPool>>,
    connect_lock: futures::lock::Mutex<()>,
}

impl RedisConnector {
    pub(crate) fn new(
        client: Client,
        connection_count: ConnectionCount,
        limits: ConnectionLimits,
    ) -> Self {
        Self {
            client,
            connection_count,
            limits,
            pool: RwLock::new(None),
            connect_lock: futures::lock::Mutex::new(()),
        }
    }

    fn current(&self) -> Option<ConnectionManager> {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(RedisConnectionPool::get)
    }

    /// A connection from the pool, connecting first if there is no pool yet.
    ///
    /// Waits for a connect already in progress.
    pub(crate) async fn connection(&self) -> Result<ConnectionManager, TokenwallError> {
        if let Some(connection) = self.current() {
            return Ok(connection);
        }

        let _guard = self.connect_lock.lock().await;

        // Another task may have connected while we waited for the lock.
        if let Some(connection) = self.current() {
            return Ok(connection);
        }

        self.establish().await
    } // end method connection

    /// Like [`connection`](Self::connection), but returns
    /// [`TokenwallError::RedisConnectInProgress`] instead of waiting when
    /// another caller is already connecting.
    pub(crate) async fn try_connection(&self) -> Result<ConnectionManager, TokenwallError> {
        if let Some(connection) = self.current() {
            return Ok(connection);
        }

        let Some(_guard) = self.connect_lock.try_lock() else {
            return Err(TokenwallError::RedisConnectInProgress);
        };

        if let Some(connection) = self.current() {
            return Ok(connection);
        }

        self.establish().await
    } // end method try_connection

    /// Build the pool. Callers hold `connect_lock`.
    async fn establish(&self) -> Result<ConnectionManager, TokenwallError> {
        let pool =
            RedisConnectionPool::from_client(&self.client, self.connection_count, &self.limits)
                .await?;
        let connection = pool.get();

        *self.pool.write().unwrap_or_else(PoisonError::into_inner) = Some(pool);
        tracing::debug!(
            connections = *self.connection_count,
            "redis.connect, connection pool established"
        );

        Ok(connection)
    }

    pub(crate) fn disconnect(&self) {
        let pool = self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if pool.is_some() {
            tracing::debug!("redis.disconnect, connection pool dropped");
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}
