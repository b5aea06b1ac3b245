use serde::Serialize;
use thiserror::Error;

use crate::account::{AccountStatus, LimitWindow};

/// Failure taxonomy surfaced to callers of the core.
///
/// Every variant maps to a stable machine-readable kind. Messages are safe to
/// show to end users; anything structured lives in the `details` of
/// [`ErrorPayload`].
#[derive(Debug, Error)]
pub enum CreditError {
    /// A debit would drive the balance negative. Recoverable by topping up.
    #[error("insufficient credits: balance {balance}, requested {requested}")]
    InsufficientCredits { balance: i64, requested: i64 },
    /// A debit would breach the daily or monthly spend cap.
    #[error("{window} spend limit exceeded: limit {limit}, spent {spent}, requested {requested}")]
    LimitExceeded {
        window: LimitWindow,
        limit: i64,
        spent: i64,
        requested: i64,
    },
    /// Account is closed, suspended or frozen.
    #[error("account is {status}")]
    AccountNotActive { status: AccountStatus },
    #[error("account not found")]
    AccountNotFound { account_id: String },
    /// Lock or revision conflict on the aggregate after bounded retries.
    #[error("conflicting update on account, retries exhausted")]
    ConcurrentModification { account_id: String },
    /// Quota denial. Signals "try later"; never auto-retried by the core.
    #[error("rate limited: {reason}")]
    RateLimited { reason: String },
    /// Illegal state transition requested on a payment transaction.
    #[error("invalid transaction state: {reason}")]
    TransactionState { reason: String },
    /// Sign/amount constraint violation detected before any write.
    #[error("invalid ledger entry: {reason}")]
    InvalidEntry { reason: String },
    #[error("backing store unavailable: {message}")]
    BackingStoreUnavailable { message: String },
}

/// Wire shape for surfacing a [`CreditError`] to callers.
#[derive(Clone, Debug, Serialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
    pub details: serde_json::Value,
}

impl CreditError {
    pub fn kind(&self) -> &'static str {
        match self {
            CreditError::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            CreditError::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            CreditError::AccountNotActive { .. } => "ACCOUNT_NOT_ACTIVE",
            CreditError::AccountNotFound { .. } => "ACCOUNT_NOT_FOUND",
            CreditError::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            CreditError::RateLimited { .. } => "RATE_LIMITED",
            CreditError::TransactionState { .. } => "TRANSACTION_STATE",
            CreditError::InvalidEntry { .. } => "INVALID_ENTRY",
            CreditError::BackingStoreUnavailable { .. } => "BACKING_STORE_UNAVAILABLE",
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        let details = match self {
            CreditError::InsufficientCredits { balance, requested } => serde_json::json!({
                "balance": balance,
                "requested": requested,
            }),
            CreditError::LimitExceeded {
                window,
                limit,
                spent,
                requested,
            } => serde_json::json!({
                "window": window.as_str(),
                "limit": limit,
                "spent": spent,
                "requested": requested,
            }),
            CreditError::AccountNotActive { status } => serde_json::json!({
                "status": status.as_str(),
            }),
            CreditError::AccountNotFound { account_id } => serde_json::json!({
                "account_id": account_id,
            }),
            CreditError::ConcurrentModification { account_id } => serde_json::json!({
                "account_id": account_id,
            }),
            CreditError::RateLimited { reason } => serde_json::json!({
                "reason": reason,
            }),
            CreditError::TransactionState { reason } => serde_json::json!({
                "reason": reason,
            }),
            CreditError::InvalidEntry { reason } => serde_json::json!({
                "reason": reason,
            }),
            CreditError::BackingStoreUnavailable { .. } => serde_json::Value::Null,
        };
        ErrorPayload {
            kind: self.kind().to_string(),
            message: self.to_string(),
            details,
        }
    }
}

impl From<rusqlite::Error> for CreditError {
    fn from(err: rusqlite::Error) -> Self {
        CreditError::BackingStoreUnavailable {
            message: format!("sqlite error: {err}"),
        }
    }
}

impl From<tokio::task::JoinError> for CreditError {
    fn from(err: tokio::task::JoinError) -> Self {
        CreditError::BackingStoreUnavailable {
            message: format!("sqlite join error: {err}"),
        }
    }
}

impl From<serde_json::Error> for CreditError {
    fn from(err: serde_json::Error) -> Self {
        CreditError::BackingStoreUnavailable {
            message: format!("json error: {err}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, CreditError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_stable_kind_and_details() {
        let err = CreditError::InsufficientCredits {
            balance: 40,
            requested: 60,
        };
        let payload = err.payload();
        assert_eq!(payload.kind, "INSUFFICIENT_CREDITS");
        assert_eq!(payload.details["balance"], 40);
        assert_eq!(payload.details["requested"], 60);
        assert!(!payload.message.is_empty());
    }

    #[test]
    fn limit_exceeded_names_the_window() {
        let err = CreditError::LimitExceeded {
            window: LimitWindow::Daily,
            limit: 50,
            spent: 30,
            requested: 25,
        };
        assert_eq!(err.payload().details["window"], "daily");
        assert!(err.to_string().contains("daily"));
    }
}
