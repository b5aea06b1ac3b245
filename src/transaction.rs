use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    CreditPurchase,
    Refund,
    Transfer,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::CreditPurchase => "credit_purchase",
            TransactionType::Refund => "refund",
            TransactionType::Transfer => "transfer",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "Deposit to account balance",
            TransactionType::Withdrawal => "Withdrawal from account balance",
            TransactionType::CreditPurchase => "Purchase of a credit package",
            TransactionType::Refund => "Refund of a completed transaction",
            TransactionType::Transfer => "Transfer between accounts",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
            TransactionStatus::Refunded => "refunded",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "Created, awaiting processing",
            TransactionStatus::Processing => "Being processed",
            TransactionStatus::Completed => "Completed successfully",
            TransactionStatus::Failed => "Failed, no balance movement retained",
            TransactionStatus::Cancelled => "Cancelled before processing",
            TransactionStatus::Refunded => "Completed, then reversed",
        }
    }

    /// Terminal records are immutable except for `Completed -> Refunded`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed
                | TransactionStatus::Failed
                | TransactionStatus::Cancelled
                | TransactionStatus::Refunded
        )
    }

    /// Monotonic transition table; everything not listed is illegal.
    pub fn can_transition(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Completed, Refunded)
        )
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credit-package details carried by credit purchase transactions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditPurchase {
    /// Credits added on success (minor units).
    pub credits: i64,
    pub package_tier: String,
}

/// Mutable payment record, single-writer per transaction. Created `Pending`
/// as the durable intent before any money movement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: i64,
    /// Caller-supplied idempotency handle; unique across all transactions.
    pub external_id: String,
    pub account_id: String,
    pub tx_type: TransactionType,
    /// Positive magnitude in minor units; direction comes from `tx_type`.
    pub amount: i64,
    pub currency: String,
    pub status: TransactionStatus,
    /// Populated only once a terminal success state is reached.
    pub balance_before: Option<i64>,
    pub balance_after: Option<i64>,
    pub credit_purchase: Option<CreditPurchase>,
    pub credit_balance_before: Option<i64>,
    pub credit_balance_after: Option<i64>,
    pub payment_method: String,
    pub reference_number: Option<String>,
    pub failure_reason: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: u64,
    pub processed_at: Option<u64>,
}

/// Parameters for `TransactionProcessor::initiate`.
#[derive(Clone, Debug)]
pub struct NewTransaction {
    pub external_id: String,
    pub account_id: String,
    pub tx_type: TransactionType,
    pub amount: i64,
    pub currency: String,
    pub payment_method: String,
    pub credit_purchase: Option<CreditPurchase>,
    pub metadata: serde_json::Value,
}

/// Fields the store stamps onto a record when it leaves `Processing`.
/// `None` leaves the stored value untouched.
#[derive(Clone, Debug, Default)]
pub struct TransactionOutcome {
    pub balance_before: Option<i64>,
    pub balance_after: Option<i64>,
    pub credit_balance_before: Option<i64>,
    pub credit_balance_after: Option<i64>,
    pub reference_number: Option<String>,
    pub failure_reason: Option<String>,
    pub processed_at: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransactionStatus::*;

    #[test]
    fn transition_table_is_monotonic() {
        assert!(Pending.can_transition(Processing));
        assert!(Pending.can_transition(Cancelled));
        assert!(Processing.can_transition(Completed));
        assert!(Processing.can_transition(Failed));
        assert!(Completed.can_transition(Refunded));

        // No resurrection of terminal records.
        assert!(!Completed.can_transition(Pending));
        assert!(!Failed.can_transition(Processing));
        assert!(!Refunded.can_transition(Completed));
        assert!(!Cancelled.can_transition(Processing));
        // Refund is only legal from Completed.
        assert!(!Processing.can_transition(Refunded));
        assert!(!Pending.can_transition(Refunded));
    }

    #[test]
    fn terminal_states() {
        for status in [Completed, Failed, Cancelled, Refunded] {
            assert!(status.is_terminal());
        }
        assert!(!Pending.is_terminal());
        assert!(!Processing.is_terminal());
    }

    #[test]
    fn display_tables_cover_all_variants() {
        for tx_type in [
            TransactionType::Deposit,
            TransactionType::Withdrawal,
            TransactionType::CreditPurchase,
            TransactionType::Refund,
            TransactionType::Transfer,
        ] {
            assert!(!tx_type.description().is_empty());
        }
        for status in [Pending, Processing, Completed, Failed, Cancelled, Refunded] {
            assert!(!status.description().is_empty());
        }
    }
}
