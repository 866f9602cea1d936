//! Redis-backed bucket store shared across processes.
//!
//! Requires the `redis-tokio` or `redis-smol` feature.
//!
//! # Data Model
//!
//! One hash per identifier at `<prefix>:<identifier>`:
//!
//! | field            | meaning                                        |
//! |------------------|------------------------------------------------|
//! | `tokens`         | available tokens, as a decimal string          |
//! | `last_refill_ms` | caller timestamp of the last refill (epoch ms) |
//!
//! Every check refreshes the key's TTL, so idle identifiers are reclaimed by
//! Redis without a sweep.

mod common;
pub use common::{ConnectionCount, ConnectionLimits, FailurePolicy, IdleTtlSeconds, RedisKey};
pub(crate) use common::RedisKeyGenerator;

mod redis_bucket_proxy;

mod redis_bucket_store;
pub use redis_bucket_store::*;
pub(crate) use redis_bucket_store::MAX_TTL_SECONDS;
