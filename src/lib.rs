#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod rate_limiter;
pub use rate_limiter::*;

pub mod bucket;

mod store;
pub use store::*;

pub mod local;
pub use local::*;

#[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
#[cfg_attr(docsrs, doc(cfg(any(feature = "redis-tokio", feature = "redis-smol"))))]
pub mod redis;
#[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
pub use self::redis::{RedisBucketStore, RedisBucketStoreOptions};

mod error;
pub use error::*;

mod common;
pub use common::{BucketConfig, BucketState, Capacity, RateLimitDecision, RefillRate, StoreStats};

#[cfg(test)]
mod tests;
