use redis::{Script, aio::ConnectionManager};

use crate::{
    BucketConfig, BucketState, TokenwallError,
    redis::{RedisKey, RedisKeyGenerator},
};

/// Refill and consume in one server-side step.
///
/// Redis runs scripts atomically, so no other client can observe or act on a
/// bucket between the read and the write below.
const CHECK_AND_CONSUME_SCRIPT: &str = r#"
    local bucket_key = KEYS[1]

    local capacity = tonumber(ARGV[1])
    local refill_rate = tonumber(ARGV[2])
    local requested = tonumber(ARGV[3])
    local now_ms = tonumber(ARGV[4])
    local ttl_seconds = tonumber(ARGV[5])

    local state = redis.call("HMGET", bucket_key, "tokens", "last_refill_ms")
    local tokens = tonumber(state[1])
    local last_refill_ms = tonumber(state[2])

    if tokens == nil or last_refill_ms == nil then
        tokens = capacity
        last_refill_ms = now_ms
    end

    -- a caller clock behind the stored timestamp refills nothing
    local skew_ms = math.max(0, last_refill_ms - now_ms)
    local elapsed_ms = math.max(0, now_ms - last_refill_ms)

    tokens = math.min(capacity, tokens + (elapsed_ms / 1000) * refill_rate)
    tokens = math.max(0, tokens)

    local allowed = 0
    local retry_after_ms = 0

    if tokens >= requested then
        tokens = tokens - requested
        allowed = 1
    else
        retry_after_ms = math.ceil(((requested - tokens) / refill_rate) * 1000)
    end

    -- keep the later timestamp so a lagging clock cannot re-credit an interval
    local refill_stamp = ARGV[4]
    if skew_ms > 0 then
        refill_stamp = state[2]
    end

    redis.call("HSET", bucket_key, "tokens", tostring(tokens), "last_refill_ms", refill_stamp)
    redis.call("EXPIRE", bucket_key, ttl_seconds)

    -- lua numbers are truncated to integers on the way out, keep the exact balance as a string
    return {allowed, math.floor(tokens), retry_after_ms, tostring(tokens), skew_ms}
"#;

const SCAN_COUNT: u64 = 500;

#[derive(Debug)]
pub(crate) struct RedisBucketProxyConsumeResult {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_ms: u64,
    pub tokens: f64,
    pub clock_skew_ms: u64,
}

/// Thin layer over the Redis commands a bucket store needs.
#[derive(Clone, Debug)]
pub(crate) struct RedisBucketProxy {
    key_generator: RedisKeyGenerator,
    check_and_consume_script: Script,
}

impl RedisBucketProxy {
    pub(crate) fn new(prefix: &RedisKey) -> Self {
        Self {
            key_generator: RedisKeyGenerator::new(prefix),
            check_and_consume_script: Script::new(CHECK_AND_CONSUME_SCRIPT),
        }
    }

    pub(crate) fn key_generator(&self) -> &RedisKeyGenerator {
        &self.key_generator
    }

    pub(crate) async fn check_and_consume(
        &self,
        connection_manager: &mut ConnectionManager,
        identifier: &str,
        config: &BucketConfig,
        tokens: u64,
        now_ms: u64,
        ttl_seconds: u64,
    ) -> Result<RedisBucketProxyConsumeResult, TokenwallError> {
        let (allowed, remaining, retry_after_ms, tokens_left, clock_skew_ms): (
            i64,
            u64,
            u64,
            f64,
            u64,
        ) = self
            .check_and_consume_script
            .key(self.key_generator.get_bucket_key(identifier))
            .arg(*config.capacity)
            .arg(*config.refill_rate)
            .arg(tokens)
            .arg(now_ms)
            .arg(ttl_seconds)
            .invoke_async(connection_manager)
            .await?;

        Ok(RedisBucketProxyConsumeResult {
            allowed: allowed == 1,
            remaining,
            retry_after_ms,
            tokens: tokens_left,
            clock_skew_ms,
        })
    } // end method check_and_consume

    pub(crate) async fn read_state(
        &self,
        connection_manager: &mut ConnectionManager,
        identifier: &str,
    ) -> Result<Option<BucketState>, TokenwallError> {
        let (tokens, last_refill_ms): (Option<f64>, Option<u64>) = redis::cmd("HMGET")
            .arg(self.key_generator.get_bucket_key(identifier))
            .arg("tokens")
            .arg("last_refill_ms")
            .query_async(connection_manager)
            .await?;

        Ok(match (tokens, last_refill_ms) {
            (Some(tokens), Some(last_refill_ms)) => Some(BucketState {
                tokens,
                last_refill_ms,
            }),
            _ => None,
        })
    } // end method read_state

    pub(crate) async fn delete(
        &self,
        connection_manager: &mut ConnectionManager,
        identifier: &str,
    ) -> Result<(), TokenwallError> {
        let _: () = redis::cmd("DEL")
            .arg(self.key_generator.get_bucket_key(identifier))
            .query_async(connection_manager)
            .await?;

        Ok(())
    }

    /// All bucket keys under the prefix. `SCAN` may report a key twice; callers dedupe.
    pub(crate) async fn scan_keys(
        &self,
        connection_manager: &mut ConnectionManager,
    ) -> Result<Vec<String>, TokenwallError> {
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(self.key_generator.get_scan_pattern())
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(connection_manager)
                .await?;

            keys.extend(batch);

            if next_cursor == 0 {
                break;
            }

            cursor = next_cursor;
        }

        keys.sort_unstable();
        keys.dedup();

        Ok(keys)
    } // end method scan_keys

    pub(crate) async fn delete_keys(
        &self,
        connection_manager: &mut ConnectionManager,
        keys: &[String],
    ) -> Result<(), TokenwallError> {
        for chunk in keys.chunks(SCAN_COUNT as usize) {
            let _: () = redis::cmd("DEL")
                .arg(chunk)
                .query_async(connection_manager)
                .await?;
        }

        Ok(())
    }
}
