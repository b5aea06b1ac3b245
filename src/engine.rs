//! Accounting engine: the only writer of account aggregates.
//!
//! Two layers of serialization per account. An in-process keyed async lock
//! keeps concurrent callers in one process from interleaving, and the
//! store-level revision compare-and-swap catches writers in other processes.
//! A CAS miss reloads the aggregate and retries a bounded number of times.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::account::{Account, AccountStatus, SpendLimits};
use crate::clock::Clock;
use crate::error::{CreditError, Result};
use crate::ledger::{EntryKind, HistoryPage, LedgerEntry, PageParams};
use crate::sqlite_store::SqliteStore;

#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// How long a caller waits for the per-account lock before giving up.
    pub lock_timeout_ms: u64,
    /// Attempts per operation when the revision CAS misses.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2_000,
            max_retries: 3,
            retry_backoff_ms: 25,
        }
    }
}

/// Arguments for [`AccountingEngine::apply_entry`].
#[derive(Clone, Debug)]
pub struct EntryRequest {
    pub account_id: String,
    pub kind: EntryKind,
    /// Signed amount in minor units; the sign must match the kind.
    pub amount: i64,
    pub reason: String,
    pub correlation_id: Option<String>,
}

pub struct AccountingEngine {
    store: SqliteStore,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AccountingEngine {
    pub fn new(store: SqliteStore, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            store,
            clock,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    fn lock_for(&self, account_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| {
            // A poisoned map only means another task panicked mid-insert;
            // the map itself is still usable.
            poisoned.into_inner()
        });
        // Drop locks nobody holds anymore so the map tracks accounts with
        // in-flight work, not every id ever touched.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(
            locks
                .entry(account_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    async fn acquire(&self, account_id: &str) -> Result<tokio::sync::OwnedMutexGuard<()>> {
        let lock = self.lock_for(account_id);
        tokio::time::timeout(
            Duration::from_millis(self.config.lock_timeout_ms),
            lock.lock_owned(),
        )
        .await
        .map_err(|_| CreditError::ConcurrentModification {
            account_id: account_id.to_string(),
        })
    }

    /// Creates the account if the id is free; returns the stored aggregate
    /// either way.
    pub async fn create_account(
        &self,
        account_id: &str,
        currency: &str,
        limits: SpendLimits,
    ) -> Result<Account> {
        let now = self.clock.now_epoch_seconds();
        let account = Account::new(account_id, currency, limits, now);
        let stored = self.store.create_account(&account).await?;
        tracing::debug!(account_id = %stored.id, revision = stored.revision, "account loaded or created");
        Ok(stored)
    }

    pub async fn account(&self, account_id: &str) -> Result<Account> {
        self.store
            .load_account(account_id)
            .await?
            .ok_or_else(|| CreditError::AccountNotFound {
                account_id: account_id.to_string(),
            })
    }

    pub async fn balance(&self, account_id: &str) -> Result<i64> {
        Ok(self.account(account_id).await?.balance)
    }

    /// Validates and commits one ledger entry, updating the aggregate in the
    /// same store transaction. This is the only path that moves a balance.
    pub async fn apply_entry(&self, request: EntryRequest) -> Result<LedgerEntry> {
        request.kind.validate_amount(request.amount)?;

        let _guard = self.acquire(&request.account_id).await?;
        let mut attempt = 0u32;
        loop {
            match self.try_apply(&request).await {
                Err(CreditError::ConcurrentModification { account_id })
                    if attempt < self.config.max_retries =>
                {
                    attempt += 1;
                    tracing::warn!(
                        account_id = %account_id,
                        attempt,
                        "revision conflict applying entry, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(
                        self.config.retry_backoff_ms * u64::from(attempt),
                    ))
                    .await;
                }
                other => return other,
            }
        }
    }

    async fn try_apply(&self, request: &EntryRequest) -> Result<LedgerEntry> {
        let now = self.clock.now_epoch_seconds();
        let mut account = self.account(&request.account_id).await?;

        account.roll_windows(now);
        account.ensure_operational(now)?;
        // `validate_amount` already rejected i64::MIN, so the negation here
        // cannot overflow.
        if request.amount < 0 {
            account.check_debit(-request.amount, request.kind)?;
        }

        let balance_before = account.balance;
        account.apply_entry_amount(request.amount, request.kind)?;
        let expected = account.revision;
        account.revision += 1;

        let entry = LedgerEntry {
            id: 0,
            account_id: account.id.clone(),
            kind: request.kind,
            amount: request.amount,
            balance_before,
            balance_after: account.balance,
            reason: request.reason.clone(),
            correlation_id: request.correlation_id.clone(),
            created_at: now,
        };
        let entry = self.store.commit_entry(&account, expected, entry).await?;
        tracing::debug!(
            account_id = %entry.account_id,
            entry_id = entry.id,
            kind = entry.kind.as_str(),
            amount = entry.amount,
            balance = entry.balance_after,
            "ledger entry committed"
        );
        Ok(entry)
    }

    /// Usage charge: `amount` is the positive cost in minor units.
    pub async fn debit(
        &self,
        account_id: &str,
        amount: i64,
        reason: impl Into<String>,
        correlation_id: Option<String>,
    ) -> Result<LedgerEntry> {
        if amount <= 0 {
            return Err(CreditError::InvalidEntry {
                reason: format!("debit amount must be positive, got {amount}"),
            });
        }
        self.apply_entry(EntryRequest {
            account_id: account_id.to_string(),
            kind: EntryKind::DebitUsage,
            amount: -amount,
            reason: reason.into(),
            correlation_id,
        })
        .await
    }

    /// Credit grant of the given kind: `amount` is the positive value added.
    pub async fn credit(
        &self,
        account_id: &str,
        kind: EntryKind,
        amount: i64,
        reason: impl Into<String>,
        correlation_id: Option<String>,
    ) -> Result<LedgerEntry> {
        if amount <= 0 {
            return Err(CreditError::InvalidEntry {
                reason: format!("credit amount must be positive, got {amount}"),
            });
        }
        self.apply_entry(EntryRequest {
            account_id: account_id.to_string(),
            kind,
            amount,
            reason: reason.into(),
            correlation_id,
        })
        .await
    }

    /// Most-recent-first page of the account's ledger.
    pub async fn history(&self, account_id: &str, page: PageParams) -> Result<HistoryPage> {
        let limit = page.limit.max(1);
        let entries = self
            .store
            .list_entries(account_id, limit, page.before_id)
            .await?;
        let next_before_id = if entries.len() == limit {
            entries.last().map(|entry| entry.id)
        } else {
            None
        };
        Ok(HistoryPage {
            entries,
            next_before_id,
        })
    }

    /// Updates the success/failure counters on the aggregate. Used by the
    /// transaction processor when a payment reaches a terminal state.
    pub async fn record_outcome(&self, account_id: &str, success: bool) -> Result<Account> {
        let _guard = self.acquire(account_id).await?;
        let now = self.clock.now_epoch_seconds();
        let mut account = self.account(account_id).await?;
        account.record_outcome(success, now);
        let expected = account.revision;
        account.revision += 1;
        self.store.update_account(&account, expected).await?;
        Ok(account)
    }

    /// Administrative status change (suspend, close, reactivate).
    pub async fn set_status(&self, account_id: &str, status: AccountStatus) -> Result<Account> {
        let _guard = self.acquire(account_id).await?;
        let mut account = self.account(account_id).await?;
        account.status = status;
        if status != AccountStatus::Frozen {
            account.frozen_reason = None;
            account.frozen_until = None;
        }
        let expected = account.revision;
        account.revision += 1;
        self.store.update_account(&account, expected).await?;
        tracing::info!(account_id = %account.id, status = %status, "account status changed");
        Ok(account)
    }

    /// Freezes the account, optionally until a deadline after which it thaws
    /// lazily on the next operation.
    pub async fn freeze(
        &self,
        account_id: &str,
        reason: impl Into<String>,
        until_epoch_seconds: Option<u64>,
    ) -> Result<Account> {
        let _guard = self.acquire(account_id).await?;
        let mut account = self.account(account_id).await?;
        account.status = AccountStatus::Frozen;
        account.frozen_reason = Some(reason.into());
        account.frozen_until = until_epoch_seconds;
        let expected = account.revision;
        account.revision += 1;
        self.store.update_account(&account, expected).await?;
        tracing::info!(account_id = %account.id, "account frozen");
        Ok(account)
    }

    pub async fn set_limits(&self, account_id: &str, limits: SpendLimits) -> Result<Account> {
        let _guard = self.acquire(account_id).await?;
        let mut account = self.account(account_id).await?;
        account.limits = limits;
        let expected = account.revision;
        account.revision += 1;
        self.store.update_account(&account, expected).await?;
        Ok(account)
    }
}
