//! In-process bucket store.
//!
//! The local store keeps bucket state inside the current process using a
//! [`DashMap`](dashmap::DashMap) keyed by identifier.
//!
//! # Key Characteristics
//!
//! - **Thread-safe:** refill-and-consume for one identifier runs under its shard lock
//! - **Zero external dependencies:** no network or database required
//! - **Low latency:** a hash lookup and a few float operations per check
//! - **Process-scoped:** state is not shared across processes
//!
//! # When to Use
//!
//! ✅ **Use the local store when:**
//! - A single process serves all traffic for a rule
//! - No external store is available or wanted
//!
//! ❌ **Don't use the local store when:**
//! - Several instances must share one limit (use the Redis store)
//! - Limits must survive process restarts
//!
//! # Examples
//!
//! ```
//! use tokenwall::{BucketConfig, LocalBucketStore};
//!
//! let store = LocalBucketStore::default();
//! let config = BucketConfig::per_minute(60).unwrap();
//!
//! let decision = store.check_limit("api_key_42", &config, 5).unwrap();
//! assert!(decision.allowed);
//! assert_eq!(decision.remaining, 55);
//! assert_eq!(decision.limit, 60);
//! ```

mod local_bucket_store;
pub use local_bucket_store::*;
