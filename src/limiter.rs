//! Admission control for the chat endpoint: per-client token buckets.
//!
//! The refill-and-consume step is atomic inside the store (a mutex here, a
//! Lua script for the Redis store), so concurrent requests for one key can
//! never admit more than the bucket holds. The limiter itself never fails a
//! request because the store broke; that case goes through the fail policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::clock::Clock;
use crate::error::{CreditError, Result};

#[derive(Clone, Copy, Debug)]
pub struct QuotaConfig {
    /// Burst size; buckets start full.
    pub capacity: i64,
    /// Tokens added per elapsed interval, capped at `capacity`.
    pub refill_amount: i64,
    pub refill_interval_secs: u64,
    /// Idle buckets expire after this long (shared-store backends only).
    pub bucket_ttl_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_amount: 10,
            refill_interval_secs: 60,
            bucket_ttl_secs: 180,
        }
    }
}

/// What happens to requests when the quota store is unreachable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailPolicy {
    /// Admit everything while the store is down.
    Open,
    /// Deny everything while the store is down.
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenyReason {
    QuotaExhausted,
    StoreUnavailable,
    /// The request asked for zero or negative tokens.
    InvalidCost,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::QuotaExhausted => "quota_exhausted",
            DenyReason::StoreUnavailable => "store_unavailable",
            DenyReason::InvalidCost => "invalid_cost",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed { remaining: i64 },
    Denied { reason: DenyReason },
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allowed { .. })
    }
}

/// Result of one atomic refill-and-consume against a bucket.
#[derive(Clone, Copy, Debug)]
pub struct BucketState {
    pub admitted: bool,
    /// Tokens left after the step.
    pub remaining: i64,
}

/// Shared bucket storage. The whole read-refill-consume-write step must be
/// atomic per key.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn refill_and_consume(
        &self,
        key: &str,
        config: &QuotaConfig,
        cost: i64,
        now_epoch_seconds: u64,
    ) -> Result<BucketState>;
}

pub struct QuotaLimiter {
    store: Arc<dyn QuotaStore>,
    config: QuotaConfig,
    policy: FailPolicy,
    clock: Arc<dyn Clock>,
}

impl QuotaLimiter {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        config: QuotaConfig,
        policy: FailPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            policy,
            clock,
        }
    }

    /// Takes `cost` tokens from the client's bucket if available. Store
    /// errors never propagate: the fail policy decides and the denial (if
    /// any) says why. A fail-open admission reports zero remaining, since
    /// the real count is unknown.
    pub async fn try_consume(&self, client_key: &str, cost: i64) -> QuotaDecision {
        // A non-positive cost would inflate the bucket past capacity.
        if cost <= 0 {
            return QuotaDecision::Denied {
                reason: DenyReason::InvalidCost,
            };
        }
        let now = self.clock.now_epoch_seconds();
        match self
            .store
            .refill_and_consume(client_key, &self.config, cost, now)
            .await
        {
            Ok(BucketState {
                admitted: true,
                remaining,
            }) => QuotaDecision::Allowed { remaining },
            Ok(BucketState {
                admitted: false, ..
            }) => QuotaDecision::Denied {
                reason: DenyReason::QuotaExhausted,
            },
            Err(err) => {
                tracing::warn!(client_key, error = %err, "quota store unavailable");
                match self.policy {
                    FailPolicy::Open => QuotaDecision::Allowed { remaining: 0 },
                    FailPolicy::Closed => QuotaDecision::Denied {
                        reason: DenyReason::StoreUnavailable,
                    },
                }
            }
        }
    }

    /// Error-shaped variant of [`try_consume`](Self::try_consume) for call
    /// sites that gate with `?`.
    pub async fn check(&self, client_key: &str, cost: i64) -> Result<i64> {
        match self.try_consume(client_key, cost).await {
            QuotaDecision::Allowed { remaining } => Ok(remaining),
            QuotaDecision::Denied { reason } => Err(CreditError::RateLimited {
                reason: reason.as_str().to_string(),
            }),
        }
    }
}

/// Derives the bucket key for a request: the first entry of the forwarding
/// header when one is present and non-empty, the peer address otherwise.
pub fn client_key(forwarded_for: Option<&str>, peer_addr: &str) -> String {
    if let Some(header) = forwarded_for {
        if let Some(first) = header.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    peer_addr.to_string()
}

/// Lazy refill: whole elapsed intervals each add `refill_amount`, capped at
/// capacity. Returns the new token count and the advanced refill timestamp.
pub(crate) fn refill(
    tokens: i64,
    last_refill: u64,
    config: &QuotaConfig,
    now_epoch_seconds: u64,
) -> (i64, u64) {
    if config.refill_interval_secs == 0 || now_epoch_seconds <= last_refill {
        return (tokens, last_refill);
    }
    let steps = (now_epoch_seconds - last_refill) / config.refill_interval_secs;
    if steps == 0 {
        return (tokens, last_refill);
    }
    let added = (steps as i64).saturating_mul(config.refill_amount);
    let tokens = tokens.saturating_add(added).min(config.capacity);
    (tokens, last_refill + steps * config.refill_interval_secs)
}

#[derive(Clone, Copy, Debug)]
struct Bucket {
    tokens: i64,
    last_refill: u64,
}

/// Single-process bucket store. Suitable for one instance; deployments with
/// several instances share buckets through the Redis store instead.
#[derive(Default)]
pub struct MemoryQuotaStore {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn refill_and_consume(
        &self,
        key: &str,
        config: &QuotaConfig,
        cost: i64,
        now_epoch_seconds: u64,
    ) -> Result<BucketState> {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: config.capacity,
            last_refill: now_epoch_seconds,
        });
        let (tokens, last_refill) =
            refill(bucket.tokens, bucket.last_refill, config, now_epoch_seconds);
        bucket.tokens = tokens;
        bucket.last_refill = last_refill;

        if cost <= 0 {
            return Ok(BucketState {
                admitted: false,
                remaining: bucket.tokens,
            });
        }
        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            Ok(BucketState {
                admitted: true,
                remaining: bucket.tokens,
            })
        } else {
            Ok(BucketState {
                admitted: false,
                remaining: bucket.tokens,
            })
        }
    }
}
