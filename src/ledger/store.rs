//! Ledger Store seam
//!
//! The coordinator and the outbox publisher only talk to storage through
//! these traits. A unit of work is an open storage transaction: row locks
//! taken through it are held until `commit` or `rollback`, and dropping it
//! without committing rolls everything back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use super::models::{
    Account, AccountId, Customer, CustomerId, NewOutboxEvent, OutboxEvent, Transaction,
    TransactionId,
};

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Timed out waiting for lock on account {0}")]
    LockTimeout(AccountId),

    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// Serialization failure or deadlock victim; the whole unit may be retried
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Ledger store unavailable: {0}")]
    Unavailable(String),

    #[error("Unit of work already finished")]
    Finished,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// SQLSTATE serialization_failure
pub(crate) const SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE deadlock_detected
pub(crate) const DEADLOCK_DETECTED: &str = "40P01";

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db)
                if matches!(
                    db.code().as_deref(),
                    Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED)
                ) =>
            {
                StoreError::Conflict(db.message().to_string())
            }
            sqlx::Error::Database(db) if db.constraint().is_some() => {
                StoreError::Constraint(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(e.to_string())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Look up an account without locking it
    async fn find_account(&self, account_number: &str) -> Result<Option<Account>, StoreError>;

    async fn get_customer(&self, customer_id: CustomerId) -> Result<Option<Customer>, StoreError>;

    /// Open a new unit of work
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;

    async fn get_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<Transaction>, StoreError>;

    /// Transactions touching `account_number`, newest first
    async fn transaction_history(
        &self,
        account_number: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Unpublished outbox rows in creation order
    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError>;

    /// Stamp `published_at` in its own unit of work.
    ///
    /// Returns false if the row was already stamped (or archived).
    async fn mark_published(&self, event_id: &str, at: DateTime<Utc>)
    -> Result<bool, StoreError>;

    /// Move rows published before `older_than` out of the live outbox.
    /// Unpublished rows are never touched.
    async fn archive_published(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait UnitOfWork: Send {
    /// Take an exclusive row lock on the account and return its current row
    async fn lock_account(&mut self, account_id: AccountId) -> Result<Option<Account>, StoreError>;

    /// Only valid for accounts locked through this unit of work
    async fn update_balance(
        &mut self,
        account_id: AccountId,
        new_balance: Decimal,
    ) -> Result<(), StoreError>;

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<(), StoreError>;

    async fn insert_outbox(&mut self, event: &NewOutboxEvent) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}
