//! Accounting engine behavior against a real SQLite store.

use std::sync::Arc;

use tally::{
    Account, AccountStatus, AccountingEngine, Clock, CreditError, EngineConfig, EntryKind,
    EntryRequest, LimitWindow, ManualClock, PageParams, SpendLimits, SqliteStore,
};

const DAY: u64 = 86_400;

struct Harness {
    engine: Arc<AccountingEngine>,
    clock: Arc<ManualClock>,
    _dir: tempfile::TempDir,
}

async fn harness(start_epoch: u64) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(dir.path().join("tally.sqlite"));
    store.init().await.expect("init");
    let clock = Arc::new(ManualClock::new(start_epoch));
    let engine = Arc::new(AccountingEngine::new(
        store,
        Arc::clone(&clock) as Arc<dyn Clock>,
        EngineConfig::default(),
    ));
    Harness {
        engine,
        clock,
        _dir: dir,
    }
}

async fn active_account(engine: &AccountingEngine, id: &str, limits: SpendLimits) -> Account {
    engine
        .create_account(id, "EUR", limits)
        .await
        .expect("create");
    engine
        .set_status(id, AccountStatus::Active)
        .await
        .expect("activate")
}

#[tokio::test]
async fn grant_debit_and_limit_flow() {
    let h = harness(1_000).await;
    active_account(
        &h.engine,
        "acct-1",
        SpendLimits {
            daily: Some(50),
            monthly: None,
        },
    )
    .await;

    h.engine
        .credit("acct-1", EntryKind::AdminGrant, 100, "signup grant", None)
        .await
        .expect("grant");
    assert_eq!(h.engine.balance("acct-1").await.expect("balance"), 100);

    let entry = h
        .engine
        .debit("acct-1", 30, "chat completion", Some("conv-1".to_string()))
        .await
        .expect("debit");
    assert_eq!(entry.amount, -30);
    assert_eq!(entry.balance_before, 100);
    assert_eq!(entry.balance_after, 70);

    // 30 of the 50 daily cap is burnt; 25 more does not fit.
    let err = h
        .engine
        .debit("acct-1", 25, "chat completion", None)
        .await
        .unwrap_err();
    match err {
        CreditError::LimitExceeded {
            window: LimitWindow::Daily,
            limit,
            spent,
            requested,
        } => {
            assert_eq!((limit, spent, requested), (50, 30, 25));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // Balance is untouched by the rejected debit.
    assert_eq!(h.engine.balance("acct-1").await.expect("balance"), 70);

    // The remaining 20 fits exactly.
    h.engine
        .debit("acct-1", 20, "chat completion", None)
        .await
        .expect("debit to cap");
}

#[tokio::test]
async fn insufficient_balance_is_checked_before_limits() {
    let h = harness(0).await;
    active_account(
        &h.engine,
        "acct-1",
        SpendLimits {
            daily: Some(5),
            monthly: None,
        },
    )
    .await;
    h.engine
        .credit("acct-1", EntryKind::AdminGrant, 10, "grant", None)
        .await
        .expect("grant");

    // 60 fails on balance even though it also breaches the daily cap.
    let err = h.engine.debit("acct-1", 60, "usage", None).await.unwrap_err();
    assert!(matches!(
        err,
        CreditError::InsufficientCredits {
            balance: 10,
            requested: 60
        }
    ));
}

#[tokio::test]
async fn ledger_fold_matches_aggregate_balance() {
    let h = harness(0).await;
    active_account(&h.engine, "acct-1", SpendLimits::default()).await;

    h.engine
        .credit("acct-1", EntryKind::Deposit, 200, "top-up", None)
        .await
        .expect("deposit");
    h.engine
        .debit("acct-1", 45, "usage", None)
        .await
        .expect("debit");
    h.engine
        .credit("acct-1", EntryKind::AutoRefill, 25, "refill", None)
        .await
        .expect("refill");
    h.engine
        .debit("acct-1", 30, "usage", None)
        .await
        .expect("debit");

    let page = h
        .engine
        .history("acct-1", PageParams::default())
        .await
        .expect("history");
    let folded: i64 = page.entries.iter().map(|entry| entry.amount).sum();
    assert_eq!(folded, h.engine.balance("acct-1").await.expect("balance"));

    // Each entry chains onto the previous balance.
    for entry in &page.entries {
        assert_eq!(entry.balance_before + entry.amount, entry.balance_after);
    }
}

#[tokio::test]
async fn history_pages_most_recent_first() {
    let h = harness(0).await;
    active_account(&h.engine, "acct-1", SpendLimits::default()).await;

    for i in 1..=7 {
        h.engine
            .credit("acct-1", EntryKind::AdminGrant, i, format!("grant {i}"), None)
            .await
            .expect("grant");
    }

    let first = h
        .engine
        .history(
            "acct-1",
            PageParams {
                limit: 3,
                before_id: None,
            },
        )
        .await
        .expect("page 1");
    assert_eq!(first.entries.len(), 3);
    assert!(first.entries[0].id > first.entries[1].id);
    assert_eq!(first.entries[0].amount, 7);
    let cursor = first.next_before_id.expect("cursor");

    let second = h
        .engine
        .history(
            "acct-1",
            PageParams {
                limit: 3,
                before_id: Some(cursor),
            },
        )
        .await
        .expect("page 2");
    assert_eq!(second.entries.len(), 3);
    assert!(second.entries.iter().all(|entry| entry.id < cursor));

    let third = h
        .engine
        .history(
            "acct-1",
            PageParams {
                limit: 3,
                before_id: second.next_before_id,
            },
        )
        .await
        .expect("page 3");
    assert_eq!(third.entries.len(), 1);
    assert!(third.next_before_id.is_none());
}

#[tokio::test]
async fn daily_window_resets_at_calendar_midnight() {
    let h = harness(1_000).await; // 1970-01-01 00:16:40
    active_account(
        &h.engine,
        "acct-1",
        SpendLimits {
            daily: Some(50),
            monthly: None,
        },
    )
    .await;
    h.engine
        .credit("acct-1", EntryKind::AdminGrant, 500, "grant", None)
        .await
        .expect("grant");
    h.engine
        .debit("acct-1", 50, "usage", None)
        .await
        .expect("fill the day");

    // Still the same calendar day.
    h.clock.set(DAY - 1);
    let err = h.engine.debit("acct-1", 1, "usage", None).await.unwrap_err();
    assert!(matches!(err, CreditError::LimitExceeded { .. }));

    // Midnight: the counter rolls and spending resumes.
    h.clock.set(DAY);
    h.engine
        .debit("acct-1", 50, "usage", None)
        .await
        .expect("fresh day");

    let account = h.engine.account("acct-1").await.expect("account");
    assert_eq!(account.daily_spent, 50);
    assert_eq!(account.daily_reset_at, DAY);
}

#[tokio::test]
async fn frozen_account_thaws_after_deadline() {
    let h = harness(0).await;
    active_account(&h.engine, "acct-1", SpendLimits::default()).await;
    h.engine
        .credit("acct-1", EntryKind::AdminGrant, 100, "grant", None)
        .await
        .expect("grant");

    h.engine
        .freeze("acct-1", "chargeback review", Some(500))
        .await
        .expect("freeze");
    let err = h.engine.debit("acct-1", 10, "usage", None).await.unwrap_err();
    assert!(matches!(
        err,
        CreditError::AccountNotActive {
            status: AccountStatus::Frozen
        }
    ));

    h.clock.set(500);
    h.engine
        .debit("acct-1", 10, "usage", None)
        .await
        .expect("thawed");
    let account = h.engine.account("acct-1").await.expect("account");
    assert_eq!(account.status, AccountStatus::Active);
}

#[tokio::test]
async fn wrong_sign_is_rejected_without_a_write() {
    let h = harness(0).await;
    active_account(&h.engine, "acct-1", SpendLimits::default()).await;

    let err = h
        .engine
        .apply_entry(EntryRequest {
            account_id: "acct-1".to_string(),
            kind: EntryKind::AdminGrant,
            amount: -5,
            reason: "bad grant".to_string(),
            correlation_id: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CreditError::InvalidEntry { .. }));

    let page = h
        .engine
        .history("acct-1", PageParams::default())
        .await
        .expect("history");
    assert!(page.entries.is_empty());
}

#[tokio::test]
async fn out_of_range_amounts_are_rejected_without_panicking() {
    let h = harness(0).await;
    active_account(&h.engine, "acct-1", SpendLimits::default()).await;
    h.engine
        .credit("acct-1", EntryKind::AdminGrant, 100, "grant", None)
        .await
        .expect("grant");

    // i64::MIN has no positive magnitude.
    let err = h
        .engine
        .apply_entry(EntryRequest {
            account_id: "acct-1".to_string(),
            kind: EntryKind::DebitUsage,
            amount: i64::MIN,
            reason: "usage".to_string(),
            correlation_id: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CreditError::InvalidEntry { .. }));

    // A credit that would overflow the balance is rejected, not wrapped.
    let err = h
        .engine
        .credit("acct-1", EntryKind::AdminGrant, i64::MAX, "grant", None)
        .await
        .unwrap_err();
    assert!(matches!(err, CreditError::InvalidEntry { .. }));

    // Neither attempt wrote anything.
    assert_eq!(h.engine.balance("acct-1").await.expect("balance"), 100);
    let page = h
        .engine
        .history("acct-1", PageParams::default())
        .await
        .expect("history");
    assert_eq!(page.entries.len(), 1);
}

#[tokio::test]
async fn missing_account_is_reported() {
    let h = harness(0).await;
    let err = h.engine.debit("ghost", 1, "usage", None).await.unwrap_err();
    assert!(matches!(err, CreditError::AccountNotFound { .. }));
    assert_eq!(err.kind(), "ACCOUNT_NOT_FOUND");
}
