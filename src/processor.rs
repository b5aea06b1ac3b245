//! Payment transaction lifecycle: durable intent first, then money movement.
//!
//! Every transaction is written as `Pending` before the payment gateway is
//! touched, claimed into `Processing` with a status compare-and-swap, and
//! finished in exactly one terminal state. Re-processing a finished
//! transaction returns the stored record without side effects.

use std::sync::Arc;

use async_trait::async_trait;

use crate::clock::Clock;
use crate::engine::{AccountingEngine, EntryRequest};
use crate::error::{CreditError, Result};
use crate::ledger::EntryKind;
use crate::transaction::{
    NewTransaction, PaymentTransaction, TransactionOutcome, TransactionStatus, TransactionType,
};

/// External payment rail. Implementations charge (or pay out) real money;
/// the processor owns all bookkeeping around the call.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(
        &self,
        external_id: &str,
        amount: i64,
        currency: &str,
        payment_method: &str,
    ) -> Result<ChargeOutcome>;
}

#[derive(Clone, Debug)]
pub enum ChargeOutcome {
    Approved { reference: String },
    Declined { reason: String },
}

#[derive(Clone, Copy, Debug)]
pub struct ProcessorConfig {
    /// Age after which an unprocessed `Pending` record may be cancelled.
    pub pending_ttl_secs: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            pending_ttl_secs: 900,
        }
    }
}

pub struct TransactionProcessor {
    engine: Arc<AccountingEngine>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    config: ProcessorConfig,
}

impl TransactionProcessor {
    pub fn new(
        engine: Arc<AccountingEngine>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            engine,
            gateway,
            clock,
            config,
        }
    }

    /// Records the durable intent. Idempotent on `external_id`: replaying an
    /// initiate returns the already-stored record, whatever its state.
    pub async fn initiate(&self, new: NewTransaction) -> Result<PaymentTransaction> {
        if new.amount <= 0 {
            return Err(CreditError::TransactionState {
                reason: format!("transaction amount must be positive, got {}", new.amount),
            });
        }
        match new.tx_type {
            TransactionType::CreditPurchase => {
                let valid = new
                    .credit_purchase
                    .as_ref()
                    .is_some_and(|purchase| purchase.credits > 0);
                if !valid {
                    return Err(CreditError::TransactionState {
                        reason: "credit purchase requires package details with positive credits"
                            .to_string(),
                    });
                }
            }
            TransactionType::Refund => {
                return Err(CreditError::TransactionState {
                    reason: "refunds are issued against a completed transaction, not initiated"
                        .to_string(),
                });
            }
            TransactionType::Transfer => {
                return Err(CreditError::TransactionState {
                    reason: "transfers are not supported".to_string(),
                });
            }
            TransactionType::Deposit | TransactionType::Withdrawal => {}
        }

        // The account must exist before we record intent against it.
        let account = self.engine.account(&new.account_id).await?;

        let record = PaymentTransaction {
            id: 0,
            external_id: new.external_id,
            account_id: account.id,
            tx_type: new.tx_type,
            amount: new.amount,
            currency: new.currency,
            status: TransactionStatus::Pending,
            balance_before: None,
            balance_after: None,
            credit_purchase: new.credit_purchase,
            credit_balance_before: None,
            credit_balance_after: None,
            payment_method: new.payment_method,
            reference_number: None,
            failure_reason: None,
            metadata: new.metadata,
            created_at: self.clock.now_epoch_seconds(),
            processed_at: None,
        };
        let stored = self.engine.store().insert_transaction(record).await?;
        tracing::info!(
            transaction_id = stored.id,
            external_id = %stored.external_id,
            tx_type = stored.tx_type.as_str(),
            amount = stored.amount,
            "transaction initiated"
        );
        Ok(stored)
    }

    /// Drives a transaction to a terminal state. Safe to call repeatedly:
    /// only the caller that wins the `Pending -> Processing` claim does any
    /// work, everyone else gets the stored record.
    pub async fn process(&self, transaction_id: i64) -> Result<PaymentTransaction> {
        let stored = self.load(transaction_id).await?;
        if stored.status != TransactionStatus::Pending {
            return Ok(stored);
        }
        // `initiate` never creates these; a record of this shape means the
        // store was written by something else. Rejected before the claim so
        // the record is not left stranded in `Processing`.
        if matches!(
            stored.tx_type,
            TransactionType::Refund | TransactionType::Transfer
        ) {
            return Err(CreditError::TransactionState {
                reason: format!("{} transactions cannot be processed", stored.tx_type.as_str()),
            });
        }

        let claimed = self
            .engine
            .store()
            .transition_transaction(
                transaction_id,
                TransactionStatus::Pending,
                TransactionStatus::Processing,
                TransactionOutcome::default(),
            )
            .await?;
        if !claimed {
            return self.load(transaction_id).await;
        }

        match stored.tx_type {
            TransactionType::Deposit => self.settle_inbound(&stored, stored.amount, None).await,
            TransactionType::CreditPurchase => {
                // `initiate` guarantees the package details are present.
                let credits = stored
                    .credit_purchase
                    .as_ref()
                    .map(|purchase| purchase.credits)
                    .ok_or_else(|| CreditError::TransactionState {
                        reason: "credit purchase record lost its package details".to_string(),
                    })?;
                self.settle_inbound(&stored, credits, Some(credits)).await
            }
            TransactionType::Withdrawal => self.settle_withdrawal(&stored).await,
            TransactionType::Refund | TransactionType::Transfer => {
                Err(CreditError::TransactionState {
                    reason: format!(
                        "{} transactions cannot be processed",
                        stored.tx_type.as_str()
                    ),
                })
            }
        }
    }

    /// Deposit and credit purchase share a shape: charge the rail first,
    /// credit the ledger only on approval. `credited` is the amount the
    /// balance grows by, which differs from the charged amount for credit
    /// purchases.
    async fn settle_inbound(
        &self,
        stored: &PaymentTransaction,
        credited: i64,
        credit_snapshot: Option<i64>,
    ) -> Result<PaymentTransaction> {
        let charge = self
            .gateway
            .charge(
                &stored.external_id,
                stored.amount,
                &stored.currency,
                &stored.payment_method,
            )
            .await;
        let reference = match charge {
            Ok(ChargeOutcome::Approved { reference }) => reference,
            Ok(ChargeOutcome::Declined { reason }) => {
                return self.fail(stored, &reason, None).await;
            }
            Err(err) => return self.fail(stored, &err.to_string(), None).await,
        };

        let entry = self
            .engine
            .apply_entry(EntryRequest {
                account_id: stored.account_id.clone(),
                kind: EntryKind::Deposit,
                amount: credited,
                reason: stored.tx_type.description().to_string(),
                correlation_id: Some(stored.external_id.clone()),
            })
            .await;
        let entry = match entry {
            Ok(entry) => entry,
            // Money was taken but the ledger rejected the credit; surface
            // the failure, the record keeps the gateway reference for
            // reconciliation.
            Err(err) => {
                return self
                    .fail(stored, &err.to_string(), Some(reference))
                    .await;
            }
        };

        self.engine
            .record_outcome(&stored.account_id, true)
            .await?;
        let outcome = TransactionOutcome {
            balance_before: Some(entry.balance_before),
            balance_after: Some(entry.balance_after),
            credit_balance_before: credit_snapshot.map(|_| entry.balance_before),
            credit_balance_after: credit_snapshot.map(|_| entry.balance_after),
            reference_number: Some(reference),
            failure_reason: None,
            processed_at: Some(self.clock.now_epoch_seconds()),
        };
        self.finish(stored.id, TransactionStatus::Completed, outcome)
            .await
    }

    /// Withdrawal debits the ledger first, then pays out. A gateway failure
    /// after the debit is compensated with a refund entry.
    async fn settle_withdrawal(&self, stored: &PaymentTransaction) -> Result<PaymentTransaction> {
        let debit = self
            .engine
            .apply_entry(EntryRequest {
                account_id: stored.account_id.clone(),
                kind: EntryKind::Withdrawal,
                amount: -stored.amount,
                reason: stored.tx_type.description().to_string(),
                correlation_id: Some(stored.external_id.clone()),
            })
            .await;
        let debit = match debit {
            Ok(entry) => entry,
            Err(err) => return self.fail(stored, &err.to_string(), None).await,
        };

        let charge = self
            .gateway
            .charge(
                &stored.external_id,
                stored.amount,
                &stored.currency,
                &stored.payment_method,
            )
            .await;
        match charge {
            Ok(ChargeOutcome::Approved { reference }) => {
                self.engine
                    .record_outcome(&stored.account_id, true)
                    .await?;
                let outcome = TransactionOutcome {
                    balance_before: Some(debit.balance_before),
                    balance_after: Some(debit.balance_after),
                    credit_balance_before: None,
                    credit_balance_after: None,
                    reference_number: Some(reference),
                    failure_reason: None,
                    processed_at: Some(self.clock.now_epoch_seconds()),
                };
                self.finish(stored.id, TransactionStatus::Completed, outcome)
                    .await
            }
            Ok(ChargeOutcome::Declined { reason }) => {
                self.compensate(stored, debit.amount).await?;
                self.fail(stored, &reason, None).await
            }
            Err(err) => {
                self.compensate(stored, debit.amount).await?;
                self.fail(stored, &err.to_string(), None).await
            }
        }
    }

    /// Reverses a withdrawal debit whose payout never happened.
    async fn compensate(&self, stored: &PaymentTransaction, debited: i64) -> Result<()> {
        self.engine
            .apply_entry(EntryRequest {
                account_id: stored.account_id.clone(),
                kind: EntryKind::Refund,
                amount: -debited,
                reason: "payout failed, withdrawal reversed".to_string(),
                correlation_id: Some(stored.external_id.clone()),
            })
            .await?;
        Ok(())
    }

    /// `reference_number` carries an approved charge's reference when the
    /// failure happened after the gateway took the money.
    async fn fail(
        &self,
        stored: &PaymentTransaction,
        reason: &str,
        reference_number: Option<String>,
    ) -> Result<PaymentTransaction> {
        tracing::warn!(
            transaction_id = stored.id,
            external_id = %stored.external_id,
            reason,
            "transaction failed"
        );
        self.engine
            .record_outcome(&stored.account_id, false)
            .await?;
        let outcome = TransactionOutcome {
            failure_reason: Some(reason.to_string()),
            reference_number,
            processed_at: Some(self.clock.now_epoch_seconds()),
            ..TransactionOutcome::default()
        };
        self.finish(stored.id, TransactionStatus::Failed, outcome)
            .await
    }

    async fn finish(
        &self,
        transaction_id: i64,
        status: TransactionStatus,
        outcome: TransactionOutcome,
    ) -> Result<PaymentTransaction> {
        self.engine
            .store()
            .transition_transaction(
                transaction_id,
                TransactionStatus::Processing,
                status,
                outcome,
            )
            .await?;
        self.load(transaction_id).await
    }

    /// Reverses a completed transaction. The applied amount is returned (or
    /// taken back, for withdrawals) as a refund entry that does not consume
    /// spend windows; the record moves `Completed -> Refunded`.
    pub async fn refund(&self, transaction_id: i64) -> Result<PaymentTransaction> {
        let stored = self.load(transaction_id).await?;
        if stored.status != TransactionStatus::Completed {
            return Err(CreditError::TransactionState {
                reason: format!("only completed transactions can be refunded, got {}", stored.status),
            });
        }

        // Signed amount the original applied to the balance.
        let applied = match stored.tx_type {
            TransactionType::Deposit => stored.amount,
            TransactionType::CreditPurchase => stored
                .credit_purchase
                .as_ref()
                .map(|purchase| purchase.credits)
                .ok_or_else(|| CreditError::TransactionState {
                    reason: "credit purchase record lost its package details".to_string(),
                })?,
            TransactionType::Withdrawal => -stored.amount,
            TransactionType::Refund | TransactionType::Transfer => {
                return Err(CreditError::TransactionState {
                    reason: format!("{} transactions cannot be refunded", stored.tx_type.as_str()),
                });
            }
        };

        // Claim the transition before touching the ledger: only the caller
        // that wins the CAS writes the compensating entry, so a racing
        // refund can never double-apply it.
        let claimed = self
            .engine
            .store()
            .transition_transaction(
                transaction_id,
                TransactionStatus::Completed,
                TransactionStatus::Refunded,
                TransactionOutcome::default(),
            )
            .await?;
        if !claimed {
            return self.load(transaction_id).await;
        }

        self.engine
            .apply_entry(EntryRequest {
                account_id: stored.account_id.clone(),
                kind: EntryKind::Refund,
                amount: -applied,
                reason: format!("refund of {}", stored.external_id),
                correlation_id: Some(stored.external_id.clone()),
            })
            .await?;
        self.load(transaction_id).await
    }

    /// Cancels a `Pending` record that outlived the TTL. Meant to be driven
    /// by an external sweep; a terminal record is returned untouched.
    pub async fn mark_stale(&self, transaction_id: i64) -> Result<PaymentTransaction> {
        let stored = self.load(transaction_id).await?;
        if stored.status != TransactionStatus::Pending {
            return Ok(stored);
        }
        let now = self.clock.now_epoch_seconds();
        if now < stored.created_at + self.config.pending_ttl_secs {
            return Ok(stored);
        }
        self.engine
            .store()
            .transition_transaction(
                transaction_id,
                TransactionStatus::Pending,
                TransactionStatus::Cancelled,
                TransactionOutcome {
                    failure_reason: Some("expired before processing".to_string()),
                    processed_at: Some(now),
                    ..TransactionOutcome::default()
                },
            )
            .await?;
        self.load(transaction_id).await
    }

    pub async fn transaction(&self, transaction_id: i64) -> Result<PaymentTransaction> {
        self.load(transaction_id).await
    }

    pub async fn transactions(
        &self,
        account_id: &str,
        status: Option<TransactionStatus>,
    ) -> Result<Vec<PaymentTransaction>> {
        self.engine
            .store()
            .list_transactions(account_id, status)
            .await
    }

    async fn load(&self, transaction_id: i64) -> Result<PaymentTransaction> {
        self.engine
            .store()
            .load_transaction(transaction_id)
            .await?
            .ok_or_else(|| CreditError::TransactionState {
                reason: format!("transaction {transaction_id} not found"),
            })
    }
}
