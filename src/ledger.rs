use serde::{Deserialize, Serialize};

use crate::error::CreditError;

/// Balance-affecting event category. Display text lives in a lookup table
/// separate from the accounting logic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    DebitUsage,
    AdminGrant,
    AutoRefill,
    Deposit,
    Withdrawal,
    Refund,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::DebitUsage => "debit_usage",
            EntryKind::AdminGrant => "admin_grant",
            EntryKind::AutoRefill => "auto_refill",
            EntryKind::Deposit => "deposit",
            EntryKind::Withdrawal => "withdrawal",
            EntryKind::Refund => "refund",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "debit_usage" => Some(EntryKind::DebitUsage),
            "admin_grant" => Some(EntryKind::AdminGrant),
            "auto_refill" => Some(EntryKind::AutoRefill),
            "deposit" => Some(EntryKind::Deposit),
            "withdrawal" => Some(EntryKind::Withdrawal),
            "refund" => Some(EntryKind::Refund),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            EntryKind::DebitUsage => "Usage charge",
            EntryKind::AdminGrant => "Administrative credit grant",
            EntryKind::AutoRefill => "Automatic balance refill",
            EntryKind::Deposit => "Deposit",
            EntryKind::Withdrawal => "Withdrawal",
            EntryKind::Refund => "Refund",
        }
    }

    /// Sign contract: usage debits and withdrawals are strictly negative,
    /// grants/refills/deposits strictly positive, refunds reverse the
    /// original and may carry either sign. `i64::MIN` has no negation and
    /// is rejected outright.
    pub fn validate_amount(&self, amount: i64) -> Result<(), CreditError> {
        if amount == i64::MIN {
            return Err(CreditError::InvalidEntry {
                reason: format!("amount {amount} is out of range"),
            });
        }
        let ok = match self {
            EntryKind::DebitUsage | EntryKind::Withdrawal => amount < 0,
            EntryKind::AdminGrant | EntryKind::AutoRefill | EntryKind::Deposit => amount > 0,
            EntryKind::Refund => amount != 0,
        };
        if ok {
            Ok(())
        } else {
            Err(CreditError::InvalidEntry {
                reason: format!("amount {amount} has the wrong sign for {}", self.as_str()),
            })
        }
    }

    /// Whether a negative entry of this kind burns the daily/monthly spend
    /// windows. Refund reversals adjust the balance without consuming quota.
    pub fn counts_against_limits(&self) -> bool {
        matches!(self, EntryKind::DebitUsage | EntryKind::Withdrawal)
    }
}

/// Immutable record of one balance-affecting event. Created exactly once by
/// the accounting engine at commit time; never updated or deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Store-assigned, opaque, unique and monotonic per commit order.
    pub id: i64,
    pub account_id: String,
    pub kind: EntryKind,
    /// Signed amount in minor units; positive = credit, negative = debit.
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub reason: String,
    /// Caller correlation handle, e.g. a conversation or session id.
    pub correlation_id: Option<String>,
    pub created_at: u64,
}

/// Keyset pagination over an account's history, most-recent-first.
#[derive(Clone, Copy, Debug)]
pub struct PageParams {
    pub limit: usize,
    /// Only entries with an id strictly below this cursor are returned.
    pub before_id: Option<i64>,
}

impl Default for PageParams {
    fn default() -> Self {
        Self {
            limit: 50,
            before_id: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HistoryPage {
    pub entries: Vec<LedgerEntry>,
    /// Cursor for the next page, `None` when this page was not full.
    pub next_before_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_contract_per_kind() {
        assert!(EntryKind::DebitUsage.validate_amount(-5).is_ok());
        assert!(EntryKind::DebitUsage.validate_amount(5).is_err());
        assert!(EntryKind::AdminGrant.validate_amount(5).is_ok());
        assert!(EntryKind::AdminGrant.validate_amount(-5).is_err());
        assert!(EntryKind::AutoRefill.validate_amount(0).is_err());
        assert!(EntryKind::Withdrawal.validate_amount(-1).is_ok());
        assert!(EntryKind::Refund.validate_amount(-20).is_ok());
        assert!(EntryKind::Refund.validate_amount(20).is_ok());
        assert!(EntryKind::Refund.validate_amount(0).is_err());
        // No negation exists for i64::MIN; every kind rejects it.
        assert!(EntryKind::DebitUsage.validate_amount(i64::MIN).is_err());
        assert!(EntryKind::Refund.validate_amount(i64::MIN).is_err());
    }

    #[test]
    fn kind_round_trips_through_store_representation() {
        for kind in [
            EntryKind::DebitUsage,
            EntryKind::AdminGrant,
            EntryKind::AutoRefill,
            EntryKind::Deposit,
            EntryKind::Withdrawal,
            EntryKind::Refund,
        ] {
            assert_eq!(EntryKind::parse(kind.as_str()), Some(kind));
            assert!(!kind.description().is_empty());
        }
        assert_eq!(EntryKind::parse("bogus"), None);
    }
}
