//! Redis-backed quota store for multi-instance deployments.
//!
//! The refill-and-consume step runs as a single Lua script, so buckets stay
//! correct no matter how many gateway instances hit the same key. Idle
//! buckets expire through a TTL refreshed on every touch.

use async_trait::async_trait;
use redis::Script;

use crate::error::{CreditError, Result};
use crate::limiter::{BucketState, QuotaConfig, QuotaStore};

/// KEYS[1] = bucket hash
/// ARGV: capacity, refill_amount, refill_interval, cost, now, ttl
/// Returns { admitted (0/1), remaining }.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local refill_amount = tonumber(ARGV[2])
local interval = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local now = tonumber(ARGV[5])
local ttl = tonumber(ARGV[6])

local tokens = tonumber(redis.call('HGET', KEYS[1], 'tokens')) or capacity
local last_refill = tonumber(redis.call('HGET', KEYS[1], 'last_refill')) or now

if interval > 0 and now > last_refill then
    local steps = math.floor((now - last_refill) / interval)
    if steps > 0 then
        tokens = math.min(capacity, tokens + steps * refill_amount)
        last_refill = last_refill + steps * interval
    end
end

local admitted = 0
if cost >= 1 and tokens >= cost then
    tokens = tokens - cost
    admitted = 1
end

redis.call('HSET', KEYS[1], 'tokens', tokens, 'last_refill', last_refill)
redis.call('EXPIRE', KEYS[1], ttl)
return { admitted, tokens }
"#;

pub struct RedisQuotaStore {
    client: redis::Client,
    key_prefix: String,
    script: Script,
}

impl RedisQuotaStore {
    pub fn new(redis_url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client =
            redis::Client::open(redis_url).map_err(|err| CreditError::BackingStoreUnavailable {
                message: format!("redis client: {err}"),
            })?;
        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
            script: Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }

    fn bucket_key(&self, key: &str) -> String {
        format!("{}:quota:{}", self.key_prefix, key)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| CreditError::BackingStoreUnavailable {
                message: format!("redis connect: {err}"),
            })
    }
}

#[async_trait]
impl QuotaStore for RedisQuotaStore {
    async fn refill_and_consume(
        &self,
        key: &str,
        config: &QuotaConfig,
        cost: i64,
        now_epoch_seconds: u64,
    ) -> Result<BucketState> {
        let mut conn = self.connection().await?;
        let result: Vec<i64> = self
            .script
            .key(self.bucket_key(key))
            .arg(config.capacity)
            .arg(config.refill_amount)
            .arg(config.refill_interval_secs)
            .arg(cost)
            .arg(now_epoch_seconds)
            .arg(config.bucket_ttl_secs.max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|err| CreditError::BackingStoreUnavailable {
                message: format!("redis script: {err}"),
            })?;
        let (admitted, remaining) = match result.as_slice() {
            [admitted, remaining] => (*admitted, *remaining),
            other => {
                return Err(CreditError::BackingStoreUnavailable {
                    message: format!("unexpected script reply of {} values", other.len()),
                });
            }
        };
        Ok(BucketState {
            admitted: admitted == 1,
            remaining,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_redis_url() -> Option<String> {
        std::env::var("TALLY_REDIS_URL")
            .or_else(|_| std::env::var("REDIS_URL"))
            .ok()
    }

    // Exercised only when a Redis instance is available.
    #[tokio::test]
    async fn bucket_drains_and_refills_through_redis() {
        let Some(url) = test_redis_url() else {
            return;
        };
        let prefix = format!("tally-test-{}", std::process::id());
        let store = RedisQuotaStore::new(&url, prefix).expect("client");
        let config = QuotaConfig {
            capacity: 3,
            refill_amount: 3,
            refill_interval_secs: 60,
            bucket_ttl_secs: 30,
        };

        for remaining in (0..3).rev() {
            let state = store
                .refill_and_consume("client-a", &config, 1, 1_000)
                .await
                .expect("consume");
            assert!(state.admitted);
            assert_eq!(state.remaining, remaining);
        }
        let state = store
            .refill_and_consume("client-a", &config, 1, 1_000)
            .await
            .expect("consume");
        assert!(!state.admitted);

        // One interval later the bucket is full again, capped at capacity.
        let state = store
            .refill_and_consume("client-a", &config, 1, 1_060)
            .await
            .expect("consume");
        assert!(state.admitted);
        assert_eq!(state.remaining, 2);
    }
}
