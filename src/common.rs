use std::{
    ops::Deref,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::TokenwallError;

/// Maximum number of tokens a bucket can hold (burst size).
///
/// Must be a positive, finite number.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Capacity(f64);

impl Deref for Capacity {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<f64> for Capacity {
    type Error = TokenwallError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || value <= 0f64 {
            Err(TokenwallError::InvalidCapacity(
                "Capacity must be a finite number greater than 0".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

impl TryFrom<u64> for Capacity {
    type Error = TokenwallError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::try_from(value as f64)
    }
}

/// Tokens added to a bucket per second.
///
/// Must be a positive, finite number.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct RefillRate(f64);

impl RefillRate {
    /// Build a refill rate from a per-minute request budget.
    pub fn per_minute(requests_per_minute: f64) -> Result<Self, TokenwallError> {
        Self::try_from(requests_per_minute / 60f64)
    }
}

impl Deref for RefillRate {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<f64> for RefillRate {
    type Error = TokenwallError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || value <= 0f64 {
            Err(TokenwallError::InvalidRefillRate(
                "Refill rate must be a finite number greater than 0".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Immutable parameters of a rate limit rule.
///
/// One config describes a rule, not a client: every identifier checked against
/// the same config gets its own bucket with these parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Maximum burst size.
    pub capacity: Capacity,
    /// Tokens replenished per second.
    pub refill_rate: RefillRate,
}

impl BucketConfig {
    /// Create a config from validated parts.
    pub fn new(capacity: Capacity, refill_rate: RefillRate) -> Self {
        Self {
            capacity,
            refill_rate,
        }
    }

    /// A rule allowing `requests_per_minute` requests per minute, with a burst of the same size.
    ///
    /// ```
    /// use tokenwall::BucketConfig;
    ///
    /// let config = BucketConfig::per_minute(120).unwrap();
    /// assert_eq!(*config.capacity, 120.0);
    /// assert_eq!(*config.refill_rate, 2.0);
    /// ```
    pub fn per_minute(requests_per_minute: u64) -> Result<Self, TokenwallError> {
        let requests_per_minute = requests_per_minute as f64;

        Ok(Self {
            capacity: Capacity::try_from(requests_per_minute)?,
            refill_rate: RefillRate::per_minute(requests_per_minute)?,
        })
    }

    /// Integer limit reported to callers.
    pub fn limit(&self) -> u64 {
        self.capacity.floor() as u64
    }

    /// Milliseconds for an empty bucket to refill completely.
    pub(crate) fn full_refill_ms(&self) -> u64 {
        millis_to_refill(*self.capacity, &self.refill_rate)
    }
}

/// Per-client bucket record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Currently available tokens, `0 <= tokens <= capacity`.
    pub tokens: f64,
    /// Milliseconds since the UNIX epoch at which the bucket was last refilled.
    pub last_refill_ms: u64,
}

impl BucketState {
    /// A bucket never seen before: full, last refilled now.
    pub fn full(capacity: &Capacity, now_ms: u64) -> Self {
        Self {
            tokens: **capacity,
            last_refill_ms: now_ms,
        }
    }
}

/// Outcome of a `check_limit` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request was admitted and its tokens consumed.
    pub allowed: bool,
    /// Whole tokens left in the bucket after this call (floored).
    pub remaining: u64,
    /// Minimum wait before retrying. Always `0` when allowed.
    pub retry_after_ms: u64,
    /// Configured capacity, floored.
    pub limit: u64,
    /// Milliseconds since the UNIX epoch at which the bucket will be full again.
    pub reset_time_ms: u64,
}

impl RateLimitDecision {
    pub(crate) fn new(
        config: &BucketConfig,
        allowed: bool,
        tokens: f64,
        retry_after_ms: u64,
        now_ms: u64,
    ) -> Self {
        let missing = (*config.capacity - tokens).max(0f64);

        Self {
            allowed,
            remaining: tokens.max(0f64).floor() as u64,
            retry_after_ms: if allowed { 0 } else { retry_after_ms },
            limit: config.limit(),
            reset_time_ms: now_ms.saturating_add(millis_to_refill(missing, &config.refill_rate)),
        }
    }

    /// Decision returned when the backing store could not be consulted.
    pub(crate) fn fail_open(config: &BucketConfig, now_ms: u64) -> Self {
        Self {
            allowed: true,
            remaining: config.limit(),
            retry_after_ms: 0,
            limit: config.limit(),
            reset_time_ms: now_ms,
        }
    }

    /// Shorthand for `self.allowed`.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

/// Snapshot of the identifiers a store currently tracks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of tracked identifiers.
    pub total_clients: usize,
    /// The tracked identifiers, in no particular order.
    pub identifiers: Vec<String>,
}

pub(crate) fn millis_to_refill(tokens: f64, refill_rate: &RefillRate) -> u64 {
    ((tokens / **refill_rate) * 1000f64).ceil() as u64
}

pub(crate) fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

pub(crate) fn validate_request(identifier: &str, tokens: u64) -> Result<(), TokenwallError> {
    if identifier.is_empty() {
        return Err(TokenwallError::InvalidIdentifier(
            "Identifier must not be empty".to_string(),
        ));
    }

    if tokens == 0 {
        return Err(TokenwallError::InvalidTokenCount(
            "Requested tokens must be greater than 0".to_string(),
        ));
    }

    Ok(())
}
