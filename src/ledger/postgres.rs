//! PostgreSQL Ledger Store
//!
//! Each unit of work is a READ COMMITTED transaction whose account rows
//! are taken with `SELECT ... FOR UPDATE`, bounded by `lock_timeout`. A
//! waiter re-reads the row once the holder commits, so the row lock alone
//! serializes the balance read-modify-write. Serialization failures and
//! deadlocks surface as `StoreError::Conflict`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row};
use std::time::Duration;

use super::models::{
    Account, AccountId, AccountStatus, AccountType, Customer, CustomerId, CustomerIdentity,
    NewOutboxEvent, OutboxEvent, Transaction, TransactionId, TransactionStatus, VipTier,
};
use super::store::{LedgerStore, StoreError, UnitOfWork};
use super::validation::Currency;

/// SQLSTATE lock_not_available
const LOCK_NOT_AVAILABLE: &str = "55P03";

const ACCOUNT_COLUMNS: &str =
    "id, customer_id, account_number, account_type, balance, currency, status, version";

const TRANSACTION_SELECT: &str = r#"
SELECT t.transaction_id, t.from_account_id, t.to_account_id,
       fa.account_number AS from_account_number, ta.account_number AS to_account_number,
       t.from_balance_before, t.from_balance_after, t.to_balance_before, t.to_balance_after,
       t.amount, t.currency, t.description, t.status, t.processed_by, t.source,
       t.error_message, t.tx_timestamp
FROM transactions t
JOIN accounts fa ON fa.id = t.from_account_id
JOIN accounts ta ON ta.id = t.to_account_id
"#;

pub struct PgLedgerStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    /// Register a customer, returning its id
    pub async fn create_customer(
        &self,
        name: &str,
        identity: &CustomerIdentity,
        vip_tier: Option<VipTier>,
    ) -> Result<CustomerId, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO customers (name, customer_type, personal_id, business_number, vip_tier)
               VALUES ($1, $2, $3, $4, $5) RETURNING id"#,
        )
        .bind(name)
        .bind(identity.type_name())
        .bind(identity.personal_id())
        .bind(identity.business_number())
        .bind(vip_tier.map(|t| t.as_str()))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Open an account, returning its id
    pub async fn open_account(
        &self,
        customer_id: CustomerId,
        account_number: &str,
        account_type: AccountType,
        currency: &Currency,
        balance: Decimal,
    ) -> Result<AccountId, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO accounts (customer_id, account_number, account_type, balance, currency)
               VALUES ($1, $2, $3, $4, $5) RETURNING id"#,
        )
        .bind(customer_id)
        .bind(account_number)
        .bind(account_type.as_str())
        .bind(balance)
        .bind(currency.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }
}

fn corrupt(what: &str, value: &str) -> StoreError {
    StoreError::Corrupt(format!("invalid {}: '{}'", what, value))
}

fn currency_from(value: String) -> Result<Currency, StoreError> {
    // CHAR(3) may come back space padded
    Currency::new(value.trim()).map_err(|_| corrupt("currency", &value))
}

fn row_to_account(row: &PgRow) -> Result<Account, StoreError> {
    let account_type: String = row.try_get("account_type")?;
    let status: String = row.try_get("status")?;
    Ok(Account {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        account_number: row.try_get("account_number")?,
        account_type: AccountType::parse(&account_type)
            .ok_or_else(|| corrupt("account_type", &account_type))?,
        balance: row.try_get("balance")?,
        currency: currency_from(row.try_get("currency")?)?,
        status: AccountStatus::parse(&status).ok_or_else(|| corrupt("status", &status))?,
        version: row.try_get("version")?,
    })
}

fn row_to_customer(row: &PgRow) -> Result<Customer, StoreError> {
    let customer_type: String = row.try_get("customer_type")?;
    let identity = CustomerIdentity::from_columns(
        &customer_type,
        row.try_get("personal_id")?,
        row.try_get("business_number")?,
    )
    .ok_or_else(|| corrupt("customer identity", &customer_type))?;
    let vip_tier: Option<String> = row.try_get("vip_tier")?;
    let vip_tier = match vip_tier {
        Some(tier) => Some(VipTier::parse(&tier).ok_or_else(|| corrupt("vip_tier", &tier))?),
        None => None,
    };
    Ok(Customer {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        identity,
        vip_tier,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
    })
}

fn row_to_transaction(row: &PgRow) -> Result<Transaction, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Transaction {
        transaction_id: row.try_get("transaction_id")?,
        from_account_id: row.try_get("from_account_id")?,
        to_account_id: row.try_get("to_account_id")?,
        from_account_number: row.try_get("from_account_number")?,
        to_account_number: row.try_get("to_account_number")?,
        from_balance_before: row.try_get("from_balance_before")?,
        from_balance_after: row.try_get("from_balance_after")?,
        to_balance_before: row.try_get("to_balance_before")?,
        to_balance_after: row.try_get("to_balance_after")?,
        amount: row.try_get("amount")?,
        currency: currency_from(row.try_get("currency")?)?,
        description: row.try_get("description")?,
        status: TransactionStatus::parse(&status).ok_or_else(|| corrupt("status", &status))?,
        processed_by: row.try_get("processed_by")?,
        source: row.try_get("source")?,
        error_message: row.try_get("error_message")?,
        timestamp: row.try_get("tx_timestamp")?,
    })
}

fn row_to_outbox(row: &PgRow) -> Result<OutboxEvent, StoreError> {
    Ok(OutboxEvent {
        seq: row.try_get("seq")?,
        event_id: row.try_get("event_id")?,
        transaction_id: row.try_get("transaction_id")?,
        topic: row.try_get("topic")?,
        key: row.try_get("partition_key")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
        published_at: row.try_get("published_at")?,
    })
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn find_account(&self, account_number: &str) -> Result<Option<Account>, StoreError> {
        let sql = format!(
            "SELECT {} FROM accounts WHERE account_number = $1",
            ACCOUNT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(account_number)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_account).transpose()
    }

    async fn get_customer(&self, customer_id: CustomerId) -> Result<Option<Customer>, StoreError> {
        let row = sqlx::query(
            r#"SELECT id, name, customer_type, personal_id, business_number, vip_tier, email, phone
               FROM customers WHERE id = $1"#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_customer).transpose()
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await?;
        // SET LOCAL does not take bind parameters
        let lock_timeout = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis());
        sqlx::query(&lock_timeout).execute(&mut *tx).await?;
        Ok(Box::new(PgUnitOfWork { tx: Some(tx) }))
    }

    async fn get_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<Transaction>, StoreError> {
        let sql = format!("{} WHERE t.transaction_id = $1", TRANSACTION_SELECT);
        let row = sqlx::query(&sql)
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_transaction).transpose()
    }

    async fn transaction_history(
        &self,
        account_number: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Transaction>, StoreError> {
        let sql = format!(
            "{} WHERE fa.account_number = $1 OR ta.account_number = $1 \
             ORDER BY t.tx_timestamp DESC, t.transaction_id DESC OFFSET $2 LIMIT $3",
            TRANSACTION_SELECT
        );
        let rows = sqlx::query(&sql)
            .bind(account_number)
            .bind(offset.max(0))
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_transaction).collect()
    }

    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT seq, event_id, transaction_id, topic, partition_key, payload::text AS payload,
                      created_at, published_at
               FROM outbox_events
               WHERE published_at IS NULL
               ORDER BY seq
               LIMIT $1"#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_outbox).collect()
    }

    async fn mark_published(
        &self,
        event_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE outbox_events SET published_at = $1 WHERE event_id = $2 AND published_at IS NULL",
        )
        .bind(at)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn archive_published(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"WITH moved AS (
                   DELETE FROM outbox_events
                   WHERE published_at IS NOT NULL AND published_at < $1
                   RETURNING *
               )
               INSERT INTO outbox_archive SELECT * FROM moved"#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

struct PgUnitOfWork {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PgUnitOfWork {
    fn tx(&mut self) -> Result<&mut sqlx::Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::Finished)
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn lock_account(&mut self, account_id: AccountId) -> Result<Option<Account>, StoreError> {
        let sql = format!("SELECT {} FROM accounts WHERE id = $1 FOR UPDATE", ACCOUNT_COLUMNS);
        let tx = self.tx()?;
        let row = sqlx::query(&sql)
            .bind(account_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) => {
                    StoreError::LockTimeout(account_id)
                }
                _ => StoreError::from(e),
            })?;
        row.as_ref().map(row_to_account).transpose()
    }

    async fn update_balance(
        &mut self,
        account_id: AccountId,
        new_balance: Decimal,
    ) -> Result<(), StoreError> {
        let tx = self.tx()?;
        let result =
            sqlx::query("UPDATE accounts SET balance = $1, version = version + 1 WHERE id = $2")
                .bind(new_balance)
                .bind(account_id)
                .execute(&mut **tx)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Constraint(format!(
                "account {} does not exist",
                account_id
            )));
        }
        Ok(())
    }

    async fn insert_transaction(&mut self, t: &Transaction) -> Result<(), StoreError> {
        let tx = self.tx()?;
        sqlx::query(
            r#"INSERT INTO transactions (
                   transaction_id, from_account_id, to_account_id,
                   from_balance_before, from_balance_after, to_balance_before, to_balance_after,
                   amount, currency, description, status, processed_by, source, error_message,
                   tx_timestamp)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"#,
        )
        .bind(t.transaction_id)
        .bind(t.from_account_id)
        .bind(t.to_account_id)
        .bind(t.from_balance_before)
        .bind(t.from_balance_after)
        .bind(t.to_balance_before)
        .bind(t.to_balance_after)
        .bind(t.amount)
        .bind(t.currency.as_str())
        .bind(t.description.as_deref())
        .bind(t.status.as_str())
        .bind(&t.processed_by)
        .bind(&t.source)
        .bind(t.error_message.as_deref())
        .bind(t.timestamp)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_outbox(&mut self, event: &NewOutboxEvent) -> Result<(), StoreError> {
        let tx = self.tx()?;
        sqlx::query(
            r#"INSERT INTO outbox_events (event_id, transaction_id, topic, partition_key, payload, created_at)
               VALUES ($1, $2, $3, $4, $5::jsonb, $6)"#,
        )
        .bind(&event.event_id)
        .bind(event.transaction_id)
        .bind(&event.topic)
        .bind(&event.key)
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::Finished)?;
        tx.commit().await.map_err(|e| match StoreError::from(e) {
            StoreError::Conflict(msg) => StoreError::Conflict(msg),
            other => StoreError::CommitFailed(other.to_string()),
        })
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::Finished)?;
        tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::ledger::schema::LEDGER_SCHEMA;
    use crate::config::{OutboxConfig, TransferConfig};
    use crate::ledger::models::{PROCESSED_BY, TRANSFER_SOURCE};
    use crate::ledger::ValidationError;
    use crate::transfer::{TransferCoordinator, TransferError, TransferRequest};
    use std::sync::Arc;

    async fn store() -> PgLedgerStore {
        store_with(5, Duration::from_millis(500)).await
    }

    async fn store_with(max_connections: u32, lock_timeout: Duration) -> PgLedgerStore {
        let db = Database::connect(
            &crate::db::test_database_url(),
            max_connections,
            Duration::from_secs(10),
        )
        .await
        .expect("connect");
        db.init_schema(LEDGER_SCHEMA).await.expect("schema");
        PgLedgerStore::new(db.pool().clone(), lock_timeout)
    }

    /// Two ILS accounts of one customer, returned as account numbers
    async fn seed_pair(store: &PgLedgerStore, a: Decimal, b: Decimal) -> (String, String) {
        let ils = Currency::new("ILS").unwrap();
        let customer = store
            .create_customer(
                "David Levi",
                &CustomerIdentity::Individual {
                    personal_id: unique("P"),
                },
                None,
            )
            .await
            .unwrap();
        let a_no = unique("ACC");
        let b_no = unique("ACC");
        store
            .open_account(customer, &a_no, AccountType::Checking, &ils, a)
            .await
            .unwrap();
        store
            .open_account(customer, &b_no, AccountType::Checking, &ils, b)
            .await
            .unwrap();
        (a_no, b_no)
    }

    fn coordinator(store: &Arc<PgLedgerStore>) -> TransferCoordinator {
        TransferCoordinator::new(
            store.clone(),
            TransferConfig::default(),
            &OutboxConfig::default(),
        )
    }

    async fn balance(store: &PgLedgerStore, account_number: &str) -> Decimal {
        store
            .find_account(account_number)
            .await
            .unwrap()
            .unwrap()
            .balance
    }

    fn unique(prefix: &str) -> String {
        format!("{}-{}", prefix, ulid::Ulid::new().to_string().to_uppercase())
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_pg_commit_and_read_back() {
        let store = store().await;
        let ils = Currency::new("ILS").unwrap();
        let customer = store
            .create_customer(
                "David Levi",
                &CustomerIdentity::Individual {
                    personal_id: unique("P"),
                },
                None,
            )
            .await
            .unwrap();
        let from_no = unique("ACC");
        let to_no = unique("ACC");
        let from = store
            .open_account(customer, &from_no, AccountType::Checking, &ils, Decimal::new(1500, 0))
            .await
            .unwrap();
        let to = store
            .open_account(customer, &to_no, AccountType::Checking, &ils, Decimal::new(8000, 0))
            .await
            .unwrap();

        let tx_id = chrono::Utc::now().timestamp_micros();
        let mut uow = store.begin().await.unwrap();
        uow.lock_account(from).await.unwrap().unwrap();
        uow.lock_account(to).await.unwrap().unwrap();
        uow.update_balance(from, Decimal::new(1200, 0)).await.unwrap();
        uow.update_balance(to, Decimal::new(8300, 0)).await.unwrap();
        uow.insert_transaction(&Transaction {
            transaction_id: tx_id,
            from_account_id: from,
            to_account_id: to,
            from_account_number: from_no.clone(),
            to_account_number: to_no.clone(),
            from_balance_before: Decimal::new(1500, 0),
            from_balance_after: Decimal::new(1200, 0),
            to_balance_before: Decimal::new(8000, 0),
            to_balance_after: Decimal::new(8300, 0),
            amount: Decimal::new(300, 0),
            currency: ils.clone(),
            description: None,
            status: TransactionStatus::Completed,
            processed_by: PROCESSED_BY.into(),
            source: TRANSFER_SOURCE.into(),
            error_message: None,
            timestamp: Utc::now(),
        })
        .await
        .unwrap();
        uow.insert_outbox(&NewOutboxEvent {
            event_id: unique("EVT"),
            transaction_id: tx_id,
            topic: "completedTransactions".into(),
            key: tx_id.to_string(),
            payload: r#"{"event_type":"transaction"}"#.into(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
        uow.commit().await.unwrap();

        let account = store.find_account(&from_no).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::new(1200, 0));
        assert_eq!(account.version, 1);

        let tx = store.get_transaction(tx_id).await.unwrap().unwrap();
        assert_eq!(tx.to_account_number, to_no);

        let history = store.transaction_history(&to_no, 0, 10).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_pg_balance_check_constraint() {
        let store = store().await;
        let ils = Currency::new("ILS").unwrap();
        let customer = store
            .create_customer(
                "TechnoCorp Ltd.",
                &CustomerIdentity::Business {
                    business_number: unique("B"),
                },
                Some(VipTier::Platinum),
            )
            .await
            .unwrap();
        let id = store
            .open_account(customer, &unique("ACC"), AccountType::Business, &ils, Decimal::ONE)
            .await
            .unwrap();

        let mut uow = store.begin().await.unwrap();
        uow.lock_account(id).await.unwrap();
        let result = uow.update_balance(id, Decimal::new(-1, 0)).await;
        assert!(matches!(result, Err(StoreError::Constraint(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires PostgreSQL database"]
    async fn test_pg_concurrent_double_spend_loses_on_funds() {
        let store = Arc::new(store_with(10, Duration::from_secs(5)).await);
        let (from, to) = seed_pair(&store, Decimal::new(150, 0), Decimal::ZERO).await;
        let coordinator = coordinator(&store);

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let coordinator = coordinator.clone();
                let req = TransferRequest::new(&from, &to, Decimal::new(100, 0), "ILS");
                tokio::spawn(async move { coordinator.transfer(req).await })
            })
            .collect();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let rejected = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(
            matches!(
                rejected,
                TransferError::Validation(ValidationError::InsufficientFunds { .. })
            ),
            "loser must see the committed balance, got {:?}",
            rejected
        );
        assert_eq!(rejected.code(), "INSUFFICIENT_FUNDS");
        assert_eq!(balance(&store, &from).await, Decimal::new(50, 0));
        assert_eq!(balance(&store, &to).await, Decimal::new(100, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires PostgreSQL database"]
    async fn test_pg_same_pair_load_serializes_without_storage_errors() {
        let store = Arc::new(store_with(10, Duration::from_secs(5)).await);
        let (a, b) = seed_pair(&store, Decimal::new(100, 0), Decimal::new(100, 0)).await;
        let coordinator = coordinator(&store);

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let coordinator = coordinator.clone();
                let (from, to) = if i % 2 == 0 { (&a, &b) } else { (&b, &a) };
                let req = TransferRequest::new(from, to, Decimal::ONE, "ILS");
                tokio::spawn(async move { coordinator.transfer(req).await })
            })
            .collect();

        for handle in handles {
            let result = handle.await.unwrap();
            assert!(result.is_ok(), "transfer failed: {:?}", result.err());
        }

        let a_after = balance(&store, &a).await;
        let b_after = balance(&store, &b).await;
        assert_eq!(a_after + b_after, Decimal::new(200, 0));
        assert_eq!(a_after, Decimal::new(100, 0));
        assert_eq!(store.transaction_history(&a, 0, 100).await.unwrap().len(), 20);
    }
}
