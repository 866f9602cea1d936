//! The token-bucket accounting step.
//!
//! [`evaluate`] is a pure function: it takes a bucket's current state and
//! returns the next one. Stores own the state and decide how the
//! read-evaluate-write sequence is made atomic.

use crate::{BucketConfig, BucketState, common::millis_to_refill};

/// Result of evaluating one request against a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketEvaluation {
    /// State to persist. Refilled up to `now_ms` even on rejection; the
    /// timestamp never moves backwards.
    pub state: BucketState,
    /// Whether the requested tokens were consumed.
    pub allowed: bool,
    /// Minimum wait until the deficit is refilled. `0` when allowed.
    pub retry_after_ms: u64,
}

/// Refill `state` up to `now_ms`, then try to consume `tokens`.
///
/// # Algorithm
///
/// 1. **Refill:** `tokens = min(capacity, tokens + elapsed_s × refill_rate)`, and
///    `last_refill_ms = max(last_refill_ms, now_ms)`. A clock that moved
///    backwards counts as zero elapsed time and leaves the timestamp alone, so
///    the same interval is never credited twice.
/// 2. **Admission:** if `tokens >= requested`, subtract and allow; otherwise
///    leave the bucket untouched and reject.
/// 3. **Retry after:** on rejection, `ceil((requested - tokens) / refill_rate × 1000)`.
///
/// A request larger than the capacity can never be admitted, and its retry
/// hint reflects the full deficit rather than `0`.
///
/// # Examples
///
/// ```
/// use tokenwall::{BucketConfig, BucketState, Capacity, RefillRate, bucket};
///
/// let config = BucketConfig::new(Capacity::try_from(3.0).unwrap(), RefillRate::try_from(1.0).unwrap());
/// let mut state = BucketState::full(&config.capacity, 0);
///
/// for _ in 0..3 {
///     let evaluation = bucket::evaluate(state, &config, 1, 0);
///     assert!(evaluation.allowed);
///     state = evaluation.state;
/// }
///
/// let evaluation = bucket::evaluate(state, &config, 1, 0);
/// assert!(!evaluation.allowed);
/// assert_eq!(evaluation.retry_after_ms, 1000);
/// ```
pub fn evaluate(
    state: BucketState,
    config: &BucketConfig,
    tokens: u64,
    now_ms: u64,
) -> BucketEvaluation {
    let elapsed_ms = match now_ms.checked_sub(state.last_refill_ms) {
        Some(elapsed_ms) => elapsed_ms,
        None => {
            tracing::warn!(
                skew_ms = state.last_refill_ms - now_ms,
                "bucket.clock.skew, clock moved backwards, treating elapsed time as zero"
            );
            0
        }
    };

    let last_refill_ms = state.last_refill_ms.max(now_ms);
    let refilled = state.tokens + (elapsed_ms as f64 / 1000f64) * *config.refill_rate;
    let available = refilled.min(*config.capacity).max(0f64);
    let requested = tokens as f64;

    if available >= requested {
        return BucketEvaluation {
            state: BucketState {
                tokens: available - requested,
                last_refill_ms,
            },
            allowed: true,
            retry_after_ms: 0,
        };
    }

    BucketEvaluation {
        state: BucketState {
            tokens: available,
            last_refill_ms,
        },
        allowed: false,
        retry_after_ms: millis_to_refill(requested - available, &config.refill_rate),
    }
} // end fn evaluate
