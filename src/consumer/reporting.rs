//! Downstream reporting store
//!
//! Every write is keyed by transaction id so replaying an event changes
//! nothing. Analytics counters move in the same atomic step as the report
//! insert, and only when the insert was new.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::ledger::{TransactionId, TransactionStatus};

#[derive(Debug, Clone, Error)]
pub enum ReportingError {
    #[error("Reporting store unavailable: {0}")]
    Unavailable(String),

    #[error("Reporting database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for ReportingError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                ReportingError::Unavailable(e.to_string())
            }
            _ => ReportingError::Database(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionReport {
    pub transaction_id: TransactionId,
    pub event_id: String,
    pub from_account: String,
    pub to_account: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
    /// Above the regulatory reporting threshold
    pub high_value: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReport {
    pub transaction_id: TransactionId,
    pub event_id: String,
    pub from_account: String,
    pub to_account: String,
    pub amount: Decimal,
    pub error_code: String,
    pub error_message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Per-account analytics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccountSummary {
    pub account_number: String,
    pub total_debits: Decimal,
    pub total_credits: Decimal,
    pub debit_count: i64,
    pub credit_count: i64,
}

#[async_trait]
pub trait ReportingStore: Send + Sync {
    /// Returns false if the transaction was already recorded
    async fn record_transaction(&self, report: &TransactionReport) -> Result<bool, ReportingError>;

    /// Returns false if the failure was already recorded
    async fn record_failure(&self, report: &FailureReport) -> Result<bool, ReportingError>;

    async fn is_notified(
        &self,
        transaction_id: TransactionId,
        account_number: &str,
    ) -> Result<bool, ReportingError>;

    async fn mark_notified(
        &self,
        transaction_id: TransactionId,
        account_number: &str,
    ) -> Result<(), ReportingError>;

    async fn account_summary(
        &self,
        account_number: &str,
    ) -> Result<Option<AccountSummary>, ReportingError>;
}

// ============================================================================
// In-memory
// ============================================================================

/// Full reporting state, comparable between runs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportingSnapshot {
    pub transactions: HashMap<TransactionId, TransactionReport>,
    pub failures: HashMap<TransactionId, FailureReport>,
    pub notified: HashSet<(TransactionId, String)>,
    pub summaries: HashMap<String, AccountSummary>,
}

#[derive(Default)]
pub struct InMemoryReportingStore {
    state: Mutex<ReportingSnapshot>,
    /// Number of upcoming record_* calls that fail
    failures_pending: AtomicU32,
}

impl InMemoryReportingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` record calls fail with `Unavailable`
    pub fn fail_next(&self, n: u32) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ReportingSnapshot {
        self.state().clone()
    }

    fn state(&self) -> MutexGuard<'_, ReportingSnapshot> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn injected_failure(&self) -> Result<(), ReportingError> {
        let took = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match took {
            Ok(_) => Err(ReportingError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl ReportingStore for InMemoryReportingStore {
    async fn record_transaction(&self, report: &TransactionReport) -> Result<bool, ReportingError> {
        self.injected_failure()?;
        let mut state = self.state();
        if state.transactions.contains_key(&report.transaction_id) {
            return Ok(false);
        }
        state
            .transactions
            .insert(report.transaction_id, report.clone());

        let from = state
            .summaries
            .entry(report.from_account.clone())
            .or_insert_with(|| AccountSummary {
                account_number: report.from_account.clone(),
                ..Default::default()
            });
        from.total_debits += report.amount;
        from.debit_count += 1;

        let to = state
            .summaries
            .entry(report.to_account.clone())
            .or_insert_with(|| AccountSummary {
                account_number: report.to_account.clone(),
                ..Default::default()
            });
        to.total_credits += report.amount;
        to.credit_count += 1;
        Ok(true)
    }

    async fn record_failure(&self, report: &FailureReport) -> Result<bool, ReportingError> {
        self.injected_failure()?;
        let mut state = self.state();
        if state.failures.contains_key(&report.transaction_id) {
            return Ok(false);
        }
        state.failures.insert(report.transaction_id, report.clone());
        Ok(true)
    }

    async fn is_notified(
        &self,
        transaction_id: TransactionId,
        account_number: &str,
    ) -> Result<bool, ReportingError> {
        Ok(self
            .state()
            .notified
            .contains(&(transaction_id, account_number.to_string())))
    }

    async fn mark_notified(
        &self,
        transaction_id: TransactionId,
        account_number: &str,
    ) -> Result<(), ReportingError> {
        self.state()
            .notified
            .insert((transaction_id, account_number.to_string()));
        Ok(())
    }

    async fn account_summary(
        &self,
        account_number: &str,
    ) -> Result<Option<AccountSummary>, ReportingError> {
        Ok(self.state().summaries.get(account_number).cloned())
    }
}

// ============================================================================
// PostgreSQL
// ============================================================================

const CREATE_TRANSACTION_REPORTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transaction_reports (
    transaction_id BIGINT PRIMARY KEY,
    event_id       VARCHAR(64) NOT NULL,
    from_account   VARCHAR(50) NOT NULL,
    to_account     VARCHAR(50) NOT NULL,
    amount         NUMERIC(15, 2) NOT NULL,
    currency       CHAR(3) NOT NULL,
    status         VARCHAR(20) NOT NULL,
    high_value     BOOLEAN NOT NULL,
    occurred_at    TIMESTAMPTZ NOT NULL,
    recorded_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_FAILURE_REPORTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS failed_transaction_reports (
    transaction_id BIGINT PRIMARY KEY,
    event_id       VARCHAR(64) NOT NULL,
    from_account   VARCHAR(50) NOT NULL,
    to_account     VARCHAR(50) NOT NULL,
    amount         NUMERIC(15, 2) NOT NULL,
    error_code     VARCHAR(50) NOT NULL,
    error_message  TEXT NOT NULL,
    occurred_at    TIMESTAMPTZ NOT NULL,
    recorded_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_ACCOUNT_ANALYTICS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS account_analytics (
    account_number VARCHAR(50) PRIMARY KEY,
    total_debits   NUMERIC(20, 2) NOT NULL DEFAULT 0,
    total_credits  NUMERIC(20, 2) NOT NULL DEFAULT 0,
    debit_count    BIGINT NOT NULL DEFAULT 0,
    credit_count   BIGINT NOT NULL DEFAULT 0
)
"#;

const CREATE_NOTIFICATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS notifications_sent (
    transaction_id BIGINT NOT NULL,
    account_number VARCHAR(50) NOT NULL,
    sent_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (transaction_id, account_number)
)
"#;

/// Reporting DDL
pub const REPORTING_SCHEMA: &[&str] = &[
    CREATE_TRANSACTION_REPORTS_TABLE,
    CREATE_FAILURE_REPORTS_TABLE,
    CREATE_ACCOUNT_ANALYTICS_TABLE,
    CREATE_NOTIFICATIONS_TABLE,
];

const UPSERT_DEBIT: &str = r#"
INSERT INTO account_analytics (account_number, total_debits, debit_count) VALUES ($1, $2, 1)
ON CONFLICT (account_number) DO UPDATE
SET total_debits = account_analytics.total_debits + EXCLUDED.total_debits,
    debit_count = account_analytics.debit_count + 1
"#;

const UPSERT_CREDIT: &str = r#"
INSERT INTO account_analytics (account_number, total_credits, credit_count) VALUES ($1, $2, 1)
ON CONFLICT (account_number) DO UPDATE
SET total_credits = account_analytics.total_credits + EXCLUDED.total_credits,
    credit_count = account_analytics.credit_count + 1
"#;

pub struct PgReportingStore {
    pool: PgPool,
}

impl PgReportingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_summary(row: &PgRow) -> Result<AccountSummary, ReportingError> {
    Ok(AccountSummary {
        account_number: row.try_get("account_number")?,
        total_debits: row.try_get("total_debits")?,
        total_credits: row.try_get("total_credits")?,
        debit_count: row.try_get("debit_count")?,
        credit_count: row.try_get("credit_count")?,
    })
}

#[async_trait]
impl ReportingStore for PgReportingStore {
    async fn record_transaction(&self, report: &TransactionReport) -> Result<bool, ReportingError> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"INSERT INTO transaction_reports
                   (transaction_id, event_id, from_account, to_account, amount, currency,
                    status, high_value, occurred_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               ON CONFLICT (transaction_id) DO NOTHING"#,
        )
        .bind(report.transaction_id)
        .bind(&report.event_id)
        .bind(&report.from_account)
        .bind(&report.to_account)
        .bind(report.amount)
        .bind(&report.currency)
        .bind(report.status.as_str())
        .bind(report.high_value)
        .bind(report.occurred_at)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if inserted {
            sqlx::query(UPSERT_DEBIT)
                .bind(&report.from_account)
                .bind(report.amount)
                .execute(&mut *tx)
                .await?;
            sqlx::query(UPSERT_CREDIT)
                .bind(&report.to_account)
                .bind(report.amount)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn record_failure(&self, report: &FailureReport) -> Result<bool, ReportingError> {
        let result = sqlx::query(
            r#"INSERT INTO failed_transaction_reports
                   (transaction_id, event_id, from_account, to_account, amount, error_code,
                    error_message, occurred_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (transaction_id) DO NOTHING"#,
        )
        .bind(report.transaction_id)
        .bind(&report.event_id)
        .bind(&report.from_account)
        .bind(&report.to_account)
        .bind(report.amount)
        .bind(&report.error_code)
        .bind(&report.error_message)
        .bind(report.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_notified(
        &self,
        transaction_id: TransactionId,
        account_number: &str,
    ) -> Result<bool, ReportingError> {
        let row = sqlx::query(
            "SELECT 1 FROM notifications_sent WHERE transaction_id = $1 AND account_number = $2",
        )
        .bind(transaction_id)
        .bind(account_number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn mark_notified(
        &self,
        transaction_id: TransactionId,
        account_number: &str,
    ) -> Result<(), ReportingError> {
        sqlx::query(
            r#"INSERT INTO notifications_sent (transaction_id, account_number) VALUES ($1, $2)
               ON CONFLICT DO NOTHING"#,
        )
        .bind(transaction_id)
        .bind(account_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn account_summary(
        &self,
        account_number: &str,
    ) -> Result<Option<AccountSummary>, ReportingError> {
        let row = sqlx::query(
            r#"SELECT account_number, total_debits, total_credits, debit_count, credit_count
               FROM account_analytics WHERE account_number = $1"#,
        )
        .bind(account_number)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_summary).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn report(id: TransactionId) -> TransactionReport {
        TransactionReport {
            transaction_id: id,
            event_id: format!("EVT-{}", id),
            from_account: "ACC-1001".into(),
            to_account: "ACC-2002".into(),
            amount: Decimal::from_str("300.00").unwrap(),
            currency: "ILS".into(),
            status: TransactionStatus::Completed,
            high_value: false,
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_record_is_idempotent() {
        let store = InMemoryReportingStore::new();
        assert!(store.record_transaction(&report(1)).await.unwrap());
        let once = store.snapshot();
        assert!(!store.record_transaction(&report(1)).await.unwrap());
        assert_eq!(store.snapshot(), once);

        let from = store.account_summary("ACC-1001").await.unwrap().unwrap();
        assert_eq!(from.debit_count, 1);
        assert_eq!(from.total_debits, Decimal::from_str("300.00").unwrap());
        let to = store.account_summary("ACC-2002").await.unwrap().unwrap();
        assert_eq!(to.credit_count, 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = InMemoryReportingStore::new();
        store.fail_next(2);
        assert!(store.record_transaction(&report(1)).await.is_err());
        assert!(store.record_transaction(&report(1)).await.is_err());
        assert!(store.record_transaction(&report(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_notification_marks() {
        let store = InMemoryReportingStore::new();
        assert!(!store.is_notified(1, "ACC-1001").await.unwrap());
        store.mark_notified(1, "ACC-1001").await.unwrap();
        store.mark_notified(1, "ACC-1001").await.unwrap();
        assert!(store.is_notified(1, "ACC-1001").await.unwrap());
        assert!(!store.is_notified(1, "ACC-2002").await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_pg_record_is_idempotent() {
        let db = crate::db::Database::connect(
            &crate::db::test_database_url(),
            5,
            std::time::Duration::from_secs(2),
        )
        .await
        .unwrap();
        db.init_schema(REPORTING_SCHEMA).await.unwrap();
        let store = PgReportingStore::new(db.pool().clone());

        let mut r = report(Utc::now().timestamp_micros());
        r.from_account = format!("ACC-{}", r.transaction_id);
        assert!(store.record_transaction(&r).await.unwrap());
        assert!(!store.record_transaction(&r).await.unwrap());
        let summary = store.account_summary(&r.from_account).await.unwrap().unwrap();
        assert_eq!(summary.debit_count, 1);
    }
}
