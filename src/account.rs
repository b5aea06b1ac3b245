use serde::{Deserialize, Serialize};

use crate::error::CreditError;
use crate::ledger::EntryKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Suspended,
    Closed,
    PendingVerification,
    Frozen,
    Limited,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Suspended => "suspended",
            AccountStatus::Closed => "closed",
            AccountStatus::PendingVerification => "pending_verification",
            AccountStatus::Frozen => "frozen",
            AccountStatus::Limited => "limited",
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationLevel {
    Unverified,
    Basic,
    Full,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitWindow {
    Daily,
    Monthly,
}

impl LimitWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitWindow::Daily => "daily",
            LimitWindow::Monthly => "monthly",
        }
    }
}

impl std::fmt::Display for LimitWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Spend caps in minor units. `None` means unlimited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendLimits {
    pub daily: Option<i64>,
    pub monthly: Option<i64>,
}

/// Materialized per-principal state: current balance, spend windows, status
/// and cumulative statistics. Mutated only by the accounting engine; the
/// ledger is the audit trail, this is the source of truth for "can this
/// spend happen now".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub currency: String,
    pub status: AccountStatus,
    pub verification_level: VerificationLevel,
    /// Balance in minor units (credits or cents).
    pub balance: i64,
    pub limits: SpendLimits,
    pub daily_spent: i64,
    pub monthly_spent: i64,
    /// Start of the window the spent counters belong to (epoch seconds).
    pub daily_reset_at: u64,
    pub monthly_reset_at: u64,
    pub frozen_reason: Option<String>,
    pub frozen_until: Option<u64>,
    pub total_deposits: i64,
    pub total_withdrawals: i64,
    pub transaction_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_failed_at: Option<u64>,
    /// Optimistic version; every persisted mutation bumps it.
    pub revision: u64,
    pub created_at: u64,
}

impl Account {
    pub fn new(
        id: impl Into<String>,
        currency: impl Into<String>,
        limits: SpendLimits,
        now_epoch_seconds: u64,
    ) -> Self {
        Self {
            id: id.into(),
            currency: currency.into(),
            status: AccountStatus::PendingVerification,
            verification_level: VerificationLevel::Unverified,
            balance: 0,
            limits,
            daily_spent: 0,
            monthly_spent: 0,
            daily_reset_at: now_epoch_seconds,
            monthly_reset_at: now_epoch_seconds,
            frozen_reason: None,
            frozen_until: None,
            total_deposits: 0,
            total_withdrawals: 0,
            transaction_count: 0,
            success_count: 0,
            failure_count: 0,
            last_failed_at: None,
            revision: 0,
            created_at: now_epoch_seconds,
        }
    }

    /// Lazy window reset: counters roll when the calendar day/month of `now`
    /// differs from the stored reset timestamp. Calendar comparison, not
    /// elapsed seconds, so the boundary is exact.
    pub fn roll_windows(&mut self, now_epoch_seconds: u64) {
        if !same_utc_day(self.daily_reset_at, now_epoch_seconds) {
            self.daily_spent = 0;
            self.daily_reset_at = now_epoch_seconds;
        }
        if !same_utc_month(self.monthly_reset_at, now_epoch_seconds) {
            self.monthly_spent = 0;
            self.monthly_reset_at = now_epoch_seconds;
        }
    }

    /// Rejects entries on closed/suspended/frozen accounts. A freeze whose
    /// `frozen_until` has passed thaws here, lazily, like the spend windows.
    pub fn ensure_operational(&mut self, now_epoch_seconds: u64) -> Result<(), CreditError> {
        if self.status == AccountStatus::Frozen
            && self
                .frozen_until
                .is_some_and(|until| until <= now_epoch_seconds)
        {
            self.status = AccountStatus::Active;
            self.frozen_reason = None;
            self.frozen_until = None;
        }
        match self.status {
            AccountStatus::Closed | AccountStatus::Suspended | AccountStatus::Frozen => {
                Err(CreditError::AccountNotActive {
                    status: self.status,
                })
            }
            AccountStatus::Active
            | AccountStatus::PendingVerification
            | AccountStatus::Limited => Ok(()),
        }
    }

    /// Invariant check for a debit of `magnitude` (positive). Windows must
    /// have been rolled first. Window sums saturate, so a magnitude near
    /// `i64::MAX` reads as exceeded rather than wrapping.
    pub fn check_debit(&self, magnitude: i64, kind: EntryKind) -> Result<(), CreditError> {
        if self.balance < magnitude {
            return Err(CreditError::InsufficientCredits {
                balance: self.balance,
                requested: magnitude,
            });
        }
        if kind.counts_against_limits() {
            if let Some(limit) = self.limits.daily {
                if self.daily_spent.saturating_add(magnitude) > limit {
                    return Err(CreditError::LimitExceeded {
                        window: LimitWindow::Daily,
                        limit,
                        spent: self.daily_spent,
                        requested: magnitude,
                    });
                }
            }
            if let Some(limit) = self.limits.monthly {
                if self.monthly_spent.saturating_add(magnitude) > limit {
                    return Err(CreditError::LimitExceeded {
                        window: LimitWindow::Monthly,
                        limit,
                        spent: self.monthly_spent,
                        requested: magnitude,
                    });
                }
            }
        }
        Ok(())
    }

    /// Folds a validated signed amount into the aggregate. A credit that
    /// would overflow the balance is rejected before anything is mutated;
    /// the cumulative statistics saturate.
    pub fn apply_entry_amount(&mut self, amount: i64, kind: EntryKind) -> Result<(), CreditError> {
        self.balance = self.balance.checked_add(amount).ok_or_else(|| {
            CreditError::InvalidEntry {
                reason: format!("amount {amount} would overflow the balance"),
            }
        })?;
        if amount < 0 {
            let magnitude = -amount;
            if kind.counts_against_limits() {
                self.daily_spent = self.daily_spent.saturating_add(magnitude);
                self.monthly_spent = self.monthly_spent.saturating_add(magnitude);
            }
            self.total_withdrawals = self.total_withdrawals.saturating_add(magnitude);
        } else {
            self.total_deposits = self.total_deposits.saturating_add(amount);
        }
        Ok(())
    }

    pub fn record_outcome(&mut self, success: bool, now_epoch_seconds: u64) {
        self.transaction_count += 1;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
            self.last_failed_at = Some(now_epoch_seconds);
        }
    }
}

fn utc_date(epoch_seconds: u64) -> time::Date {
    time::OffsetDateTime::from_unix_timestamp(epoch_seconds as i64)
        .map(|dt| dt.date())
        .unwrap_or(time::OffsetDateTime::UNIX_EPOCH.date())
}

fn same_utc_day(a: u64, b: u64) -> bool {
    utc_date(a) == utc_date(b)
}

fn same_utc_month(a: u64, b: u64) -> bool {
    let (da, db) = (utc_date(a), utc_date(b));
    da.year() == db.year() && da.month() == db.month()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: u64 = 86_400;

    fn account(limits: SpendLimits) -> Account {
        let mut account = Account::new("acct-1", "EUR", limits, 0);
        account.status = AccountStatus::Active;
        account
    }

    #[test]
    fn daily_window_rolls_on_calendar_day_not_elapsed_time() {
        let mut account = account(SpendLimits::default());
        account.daily_spent = 40;
        account.daily_reset_at = 10; // 1970-01-01 00:00:10

        // 23:59:59 the same day: no reset even though almost a day elapsed.
        account.roll_windows(DAY - 1);
        assert_eq!(account.daily_spent, 40);

        // One second later it is the next calendar day.
        account.roll_windows(DAY);
        assert_eq!(account.daily_spent, 0);
        assert_eq!(account.daily_reset_at, DAY);
    }

    #[test]
    fn monthly_window_rolls_on_calendar_month() {
        let mut account = account(SpendLimits::default());
        account.monthly_spent = 99;
        account.monthly_reset_at = 0; // 1970-01-01

        account.roll_windows(30 * DAY); // 1970-01-31
        assert_eq!(account.monthly_spent, 99);

        account.roll_windows(31 * DAY); // 1970-02-01
        assert_eq!(account.monthly_spent, 0);
    }

    #[test]
    fn debit_respects_balance_then_windows() {
        let mut account = account(SpendLimits {
            daily: Some(50),
            monthly: Some(400),
        });
        account.balance = 100;
        account.daily_spent = 30;

        let err = account.check_debit(120, EntryKind::DebitUsage).unwrap_err();
        assert!(matches!(err, CreditError::InsufficientCredits { .. }));

        let err = account.check_debit(25, EntryKind::DebitUsage).unwrap_err();
        assert!(matches!(
            err,
            CreditError::LimitExceeded {
                window: LimitWindow::Daily,
                ..
            }
        ));

        account.check_debit(20, EntryKind::DebitUsage).unwrap();
    }

    #[test]
    fn refund_debits_bypass_spend_windows() {
        let mut account = account(SpendLimits {
            daily: Some(10),
            monthly: None,
        });
        account.balance = 100;
        account.daily_spent = 10;

        account.check_debit(20, EntryKind::Refund).unwrap();
        account.apply_entry_amount(-20, EntryKind::Refund).unwrap();
        assert_eq!(account.balance, 80);
        assert_eq!(account.daily_spent, 10);
    }

    #[test]
    fn overflowing_credit_is_rejected_without_mutation() {
        let mut account = account(SpendLimits::default());
        account.balance = i64::MAX - 5;

        let err = account
            .apply_entry_amount(10, EntryKind::AdminGrant)
            .unwrap_err();
        assert!(matches!(err, CreditError::InvalidEntry { .. }));
        assert_eq!(account.balance, i64::MAX - 5);
        assert_eq!(account.total_deposits, 0);
    }

    #[test]
    fn huge_debit_saturates_window_check_instead_of_wrapping() {
        let mut account = account(SpendLimits {
            daily: Some(50),
            monthly: None,
        });
        account.balance = i64::MAX;
        account.daily_spent = 40;

        let err = account
            .check_debit(i64::MAX, EntryKind::DebitUsage)
            .unwrap_err();
        assert!(matches!(
            err,
            CreditError::LimitExceeded {
                window: LimitWindow::Daily,
                ..
            }
        ));
    }

    #[test]
    fn expired_freeze_thaws_lazily() {
        let mut account = account(SpendLimits::default());
        account.status = AccountStatus::Frozen;
        account.frozen_reason = Some("chargeback review".to_string());
        account.frozen_until = Some(100);

        let err = account.ensure_operational(50).unwrap_err();
        assert!(matches!(err, CreditError::AccountNotActive { .. }));

        account.ensure_operational(100).unwrap();
        assert_eq!(account.status, AccountStatus::Active);
        assert!(account.frozen_reason.is_none());
    }

    #[test]
    fn closed_account_rejects_everything() {
        let mut account = account(SpendLimits::default());
        account.status = AccountStatus::Closed;
        let err = account.ensure_operational(0).unwrap_err();
        assert!(matches!(
            err,
            CreditError::AccountNotActive {
                status: AccountStatus::Closed
            }
        ));
    }
}
