//! Credit accounting and admission control for a metered chat service.
//!
//! The core is an append-only ledger plus a materialized account aggregate,
//! mutated only by the [`engine::AccountingEngine`]. Payment flows run
//! through the [`processor::TransactionProcessor`] state machine, and
//! per-client request quotas are enforced by the [`limiter::QuotaLimiter`]
//! token buckets, backed in-process or by Redis.

pub mod account;
pub mod clock;
pub mod engine;
mod error;
pub mod ledger;
pub mod limiter;
pub mod processor;
#[cfg(feature = "store-redis")]
pub mod redis_store;
pub mod sqlite_store;
pub mod transaction;

pub use account::{Account, AccountStatus, LimitWindow, SpendLimits, VerificationLevel};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{AccountingEngine, EngineConfig, EntryRequest};
pub use error::{CreditError, ErrorPayload, Result};
pub use ledger::{EntryKind, HistoryPage, LedgerEntry, PageParams};
pub use limiter::{
    client_key, FailPolicy, MemoryQuotaStore, QuotaConfig, QuotaDecision, QuotaLimiter, QuotaStore,
};
pub use processor::{ChargeOutcome, PaymentGateway, ProcessorConfig, TransactionProcessor};
#[cfg(feature = "store-redis")]
pub use redis_store::RedisQuotaStore;
pub use sqlite_store::SqliteStore;
pub use transaction::{
    CreditPurchase, NewTransaction, PaymentTransaction, TransactionOutcome, TransactionStatus,
    TransactionType,
};
