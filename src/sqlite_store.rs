//! Durable store for accounts, ledger entries and payment transactions.
//!
//! One SQLite transaction per logical operation; the ledger append and the
//! aggregate update commit in the same transaction (both-or-neither). The
//! aggregate row carries a `revision` column used as a compare-and-swap
//! guard by the accounting engine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{OptionalExtension, TransactionBehavior};

use crate::account::Account;
use crate::error::{CreditError, Result};
use crate::ledger::LedgerEntry;
use crate::transaction::{PaymentTransaction, TransactionOutcome, TransactionStatus};

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    /// Inserts the account if its id is free, otherwise returns the stored
    /// aggregate unchanged.
    pub async fn create_account(&self, account: &Account) -> Result<Account> {
        let path = self.path.clone();
        let account = account.clone();
        tokio::task::spawn_blocking(move || -> Result<Account> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let value_json = serde_json::to_string(&account)?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO accounts (id, revision, value_json) VALUES (?1, ?2, ?3)",
                rusqlite::params![account.id, account.revision as i64, value_json],
            )?;
            let stored = if inserted == 0 {
                load_account_tx(&tx, &account.id)?.ok_or_else(|| {
                    CreditError::BackingStoreUnavailable {
                        message: "account row vanished during create".to_string(),
                    }
                })?
            } else {
                account
            };
            tx.commit()?;
            Ok(stored)
        })
        .await?
    }

    pub async fn load_account(&self, account_id: &str) -> Result<Option<Account>> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<Account>> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            load_account_conn(&conn, &account_id)
        })
        .await?
    }

    /// Compare-and-swap update of the aggregate alone (no ledger append).
    pub async fn update_account(&self, account: &Account, expected_revision: u64) -> Result<()> {
        let path = self.path.clone();
        let account = account.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let value_json = serde_json::to_string(&account)?;
            let changed = conn.execute(
                "UPDATE accounts SET revision = ?3, value_json = ?4
                 WHERE id = ?1 AND revision = ?2",
                rusqlite::params![
                    account.id,
                    expected_revision as i64,
                    account.revision as i64,
                    value_json
                ],
            )?;
            if changed == 0 {
                return Err(CreditError::ConcurrentModification {
                    account_id: account.id.clone(),
                });
            }
            Ok(())
        })
        .await?
    }

    /// Atomic unit of the accounting engine: ledger append and aggregate
    /// update succeed or fail together. The caller passes the aggregate with
    /// its revision already bumped plus the revision it read.
    pub async fn commit_entry(
        &self,
        account: &Account,
        expected_revision: u64,
        entry: LedgerEntry,
    ) -> Result<LedgerEntry> {
        let path = self.path.clone();
        let account = account.clone();
        let mut entry = entry;
        tokio::task::spawn_blocking(move || -> Result<LedgerEntry> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let value_json = serde_json::to_string(&account)?;
            let changed = tx.execute(
                "UPDATE accounts SET revision = ?3, value_json = ?4
                 WHERE id = ?1 AND revision = ?2",
                rusqlite::params![
                    account.id,
                    expected_revision as i64,
                    account.revision as i64,
                    value_json
                ],
            )?;
            if changed == 0 {
                return Err(CreditError::ConcurrentModification {
                    account_id: account.id.clone(),
                });
            }

            tx.execute(
                "INSERT INTO ledger_entries
                   (account_id, kind, amount, balance_before, balance_after,
                    reason, correlation_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    entry.account_id,
                    entry.kind.as_str(),
                    entry.amount,
                    entry.balance_before,
                    entry.balance_after,
                    entry.reason,
                    entry.correlation_id,
                    entry.created_at as i64
                ],
            )?;
            entry.id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(entry)
        })
        .await?
    }

    /// Most-recent-first keyset scan of one account's ledger.
    pub async fn list_entries(
        &self,
        account_id: &str,
        limit: usize,
        before_id: Option<i64>,
    ) -> Result<Vec<LedgerEntry>> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        let cursor = before_id.unwrap_or(i64::MAX);
        tokio::task::spawn_blocking(move || -> Result<Vec<LedgerEntry>> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT id, account_id, kind, amount, balance_before, balance_after,
                        reason, correlation_id, created_at
                 FROM ledger_entries
                 WHERE account_id = ?1 AND id < ?2
                 ORDER BY id DESC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(rusqlite::params![account_id, cursor, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, account_id, kind_raw, amount, before, after, reason, corr, created) =
                    row?;
                let kind = crate::ledger::EntryKind::parse(&kind_raw).ok_or_else(|| {
                    CreditError::BackingStoreUnavailable {
                        message: format!("unknown ledger entry kind: {kind_raw}"),
                    }
                })?;
                out.push(LedgerEntry {
                    id,
                    account_id,
                    kind,
                    amount,
                    balance_before: before,
                    balance_after: after,
                    reason,
                    correlation_id: corr,
                    created_at: created.max(0) as u64,
                });
            }
            Ok(out)
        })
        .await?
    }

    /// Persists a new `Pending` transaction, assigning its id. Re-inserting
    /// an already-used external id returns the stored record instead, which
    /// is what makes `initiate` retry-safe.
    pub async fn insert_transaction(
        &self,
        record: PaymentTransaction,
    ) -> Result<PaymentTransaction> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<PaymentTransaction> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(existing) = load_transaction_by_external_tx(&tx, &record.external_id)? {
                return Ok(existing);
            }

            let mut record = record;
            tx.execute(
                "INSERT INTO payment_transactions
                   (external_id, account_id, status, value_json, created_at)
                 VALUES (?1, ?2, ?3, '{}', ?4)",
                rusqlite::params![
                    record.external_id,
                    record.account_id,
                    record.status.as_str(),
                    record.created_at as i64
                ],
            )?;
            record.id = tx.last_insert_rowid();
            let value_json = serde_json::to_string(&record)?;
            tx.execute(
                "UPDATE payment_transactions SET value_json = ?2 WHERE id = ?1",
                rusqlite::params![record.id, value_json],
            )?;
            tx.commit()?;
            Ok(record)
        })
        .await?
    }

    pub async fn load_transaction(&self, id: i64) -> Result<Option<PaymentTransaction>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<PaymentTransaction>> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value_json FROM payment_transactions WHERE id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|raw| serde_json::from_str(&raw).map_err(CreditError::from))
                .transpose()
        })
        .await?
    }

    pub async fn load_transaction_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<PaymentTransaction>> {
        let path = self.path.clone();
        let external_id = external_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<PaymentTransaction>> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value_json FROM payment_transactions WHERE external_id = ?1",
                    rusqlite::params![external_id],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|raw| serde_json::from_str(&raw).map_err(CreditError::from))
                .transpose()
        })
        .await?
    }

    /// Status compare-and-swap. Returns `false` when the record was not in
    /// `from` anymore (another writer got there first); the caller reloads
    /// and treats the stored state as authoritative.
    pub async fn transition_transaction(
        &self,
        id: i64,
        from: TransactionStatus,
        to: TransactionStatus,
        outcome: TransactionOutcome,
    ) -> Result<bool> {
        if !from.can_transition(to) {
            return Err(CreditError::TransactionState {
                reason: format!("illegal transition {from} -> {to}"),
            });
        }
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let raw: Option<String> = tx
                .query_row(
                    "SELECT value_json FROM payment_transactions
                     WHERE id = ?1 AND status = ?2",
                    rusqlite::params![id, from.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(raw) = raw else {
                return Ok(false);
            };

            let mut record: PaymentTransaction = serde_json::from_str(&raw)?;
            record.status = to;
            if let Some(v) = outcome.balance_before {
                record.balance_before = Some(v);
            }
            if let Some(v) = outcome.balance_after {
                record.balance_after = Some(v);
            }
            if let Some(v) = outcome.credit_balance_before {
                record.credit_balance_before = Some(v);
            }
            if let Some(v) = outcome.credit_balance_after {
                record.credit_balance_after = Some(v);
            }
            if let Some(v) = outcome.reference_number {
                record.reference_number = Some(v);
            }
            if let Some(v) = outcome.failure_reason {
                record.failure_reason = Some(v);
            }
            if let Some(v) = outcome.processed_at {
                record.processed_at = Some(v);
            }

            let value_json = serde_json::to_string(&record)?;
            tx.execute(
                "UPDATE payment_transactions SET status = ?2, value_json = ?3 WHERE id = ?1",
                rusqlite::params![id, record.status.as_str(), value_json],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await?
    }

    pub async fn list_transactions(
        &self,
        account_id: &str,
        status: Option<TransactionStatus>,
    ) -> Result<Vec<PaymentTransaction>> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<PaymentTransaction>> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut out = Vec::new();
            if let Some(status) = status {
                let mut stmt = conn.prepare(
                    "SELECT value_json FROM payment_transactions
                     WHERE account_id = ?1 AND status = ?2
                     ORDER BY id DESC",
                )?;
                let rows = stmt.query_map(rusqlite::params![account_id, status.as_str()], |row| {
                    row.get::<_, String>(0)
                })?;
                for row in rows {
                    out.push(serde_json::from_str(&row?)?);
                }
            } else {
                let mut stmt = conn.prepare(
                    "SELECT value_json FROM payment_transactions
                     WHERE account_id = ?1
                     ORDER BY id DESC",
                )?;
                let rows =
                    stmt.query_map(rusqlite::params![account_id], |row| row.get::<_, String>(0))?;
                for row in rows {
                    out.push(serde_json::from_str(&row?)?);
                }
            }
            Ok(out)
        })
        .await?
    }
}

fn load_account_conn(conn: &rusqlite::Connection, account_id: &str) -> Result<Option<Account>> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT revision, value_json FROM accounts WHERE id = ?1",
            rusqlite::params![account_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((revision, raw)) = row else {
        return Ok(None);
    };
    let mut account: Account = serde_json::from_str(&raw)?;
    // The column is authoritative for the compare-and-swap.
    account.revision = revision.max(0) as u64;
    Ok(Some(account))
}

fn load_account_tx(tx: &rusqlite::Transaction<'_>, account_id: &str) -> Result<Option<Account>> {
    load_account_conn(tx, account_id)
}

fn load_transaction_by_external_tx(
    tx: &rusqlite::Transaction<'_>,
    external_id: &str,
) -> Result<Option<PaymentTransaction>> {
    let raw: Option<String> = tx
        .query_row(
            "SELECT value_json FROM payment_transactions WHERE external_id = ?1",
            rusqlite::params![external_id],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|raw| serde_json::from_str(&raw).map_err(CreditError::from))
        .transpose()
}

fn init_schema(conn: &rusqlite::Connection) -> std::result::Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY NOT NULL,
            revision INTEGER NOT NULL DEFAULT 0,
            value_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ledger_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            amount INTEGER NOT NULL,
            balance_before INTEGER NOT NULL,
            balance_after INTEGER NOT NULL,
            reason TEXT NOT NULL,
            correlation_id TEXT,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ledger_entries_account_id
            ON ledger_entries(account_id, id);
        CREATE INDEX IF NOT EXISTS idx_ledger_entries_account_created
            ON ledger_entries(account_id, created_at);

        CREATE TABLE IF NOT EXISTS payment_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id TEXT NOT NULL UNIQUE,
            account_id TEXT NOT NULL,
            status TEXT NOT NULL,
            value_json TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_payment_transactions_account_status
            ON payment_transactions(account_id, status);",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> std::result::Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}
