//! In-process Ledger Store
//!
//! Row locks are per-account `tokio::sync::Mutex` guards owned by the unit of
//! work; writes are staged in the unit of work and applied under a single
//! data lock at commit, so no partial state is ever visible. Supports fault
//! injection for storage-outage scenarios.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use super::models::{
    Account, AccountId, AccountStatus, AccountType, Customer, CustomerId, CustomerIdentity,
    NewOutboxEvent, OutboxEvent, Transaction, TransactionId, VipTier,
};
use super::store::{LedgerStore, StoreError, UnitOfWork};
use super::validation::Currency;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct LedgerData {
    customers: HashMap<CustomerId, Customer>,
    accounts: HashMap<AccountId, Account>,
    account_numbers: HashMap<String, AccountId>,
    /// Commit order
    transactions: Vec<Transaction>,
    transaction_index: HashMap<TransactionId, usize>,
    outbox: BTreeMap<i64, OutboxEvent>,
    archive: Vec<OutboxEvent>,
    next_customer_id: CustomerId,
    next_account_id: AccountId,
    next_seq: i64,
}

struct Shared {
    data: Mutex<LedgerData>,
    row_locks: DashMap<AccountId, Arc<tokio::sync::Mutex<()>>>,
    lock_timeout: Duration,
    fail_next_commit: AtomicBool,
    available: AtomicBool,
}

impl Shared {
    fn data(&self) -> MutexGuard<'_, LedgerData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("ledger store is down".to_string()))
        }
    }

    fn row_lock(&self, account_id: AccountId) -> Arc<tokio::sync::Mutex<()>> {
        self.row_locks
            .entry(account_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// In-memory Ledger Store
#[derive(Clone)]
pub struct InMemoryLedgerStore {
    shared: Arc<Shared>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                data: Mutex::new(LedgerData {
                    next_customer_id: 1,
                    next_account_id: 1,
                    next_seq: 1,
                    ..Default::default()
                }),
                row_locks: DashMap::new(),
                lock_timeout,
                fail_next_commit: AtomicBool::new(false),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Register a customer. Personal ids and business numbers are unique.
    pub fn create_customer(
        &self,
        name: &str,
        identity: CustomerIdentity,
        vip_tier: Option<VipTier>,
    ) -> Result<Customer, StoreError> {
        let mut data = self.shared.data();
        let duplicate = data.customers.values().any(|c| match (&c.identity, &identity) {
            (
                CustomerIdentity::Individual { personal_id: a },
                CustomerIdentity::Individual { personal_id: b },
            ) => a == b,
            (
                CustomerIdentity::Business { business_number: a },
                CustomerIdentity::Business { business_number: b },
            ) => a == b,
            _ => false,
        });
        if duplicate {
            return Err(StoreError::Constraint(format!(
                "customer identifier already registered ({})",
                identity.type_name()
            )));
        }

        let id = data.next_customer_id;
        data.next_customer_id += 1;
        let customer = Customer {
            id,
            name: name.to_string(),
            identity,
            vip_tier,
            email: None,
            phone: None,
        };
        data.customers.insert(id, customer.clone());
        Ok(customer)
    }

    /// Open an active checking account
    pub fn open_account(
        &self,
        customer_id: CustomerId,
        account_number: &str,
        currency: Currency,
        balance: Decimal,
    ) -> Result<Account, StoreError> {
        let mut data = self.shared.data();
        if !data.customers.contains_key(&customer_id) {
            return Err(StoreError::Constraint(format!(
                "customer {} does not exist",
                customer_id
            )));
        }
        if data.account_numbers.contains_key(account_number) {
            return Err(StoreError::Constraint(format!(
                "account number {} already exists",
                account_number
            )));
        }
        if balance < Decimal::ZERO {
            return Err(StoreError::Constraint("balance must not be negative".into()));
        }

        let id = data.next_account_id;
        data.next_account_id += 1;
        let account = Account {
            id,
            customer_id,
            account_number: account_number.to_string(),
            account_type: AccountType::Checking,
            balance,
            currency,
            status: AccountStatus::Active,
            version: 0,
        };
        data.account_numbers.insert(account_number.to_string(), id);
        data.accounts.insert(id, account.clone());
        Ok(account)
    }

    pub fn set_account_status(&self, account_number: &str, status: AccountStatus) -> bool {
        self.modify_account(account_number, |a| a.status = status)
    }

    pub fn set_account_type(&self, account_number: &str, account_type: AccountType) -> bool {
        self.modify_account(account_number, |a| a.account_type = account_type)
    }

    fn modify_account(&self, account_number: &str, f: impl FnOnce(&mut Account)) -> bool {
        let mut data = self.shared.data();
        let Some(id) = data.account_numbers.get(account_number).copied() else {
            return false;
        };
        match data.accounts.get_mut(&id) {
            Some(account) => {
                f(account);
                true
            }
            None => false,
        }
    }

    /// Committed balance of an account
    pub fn balance_of(&self, account_number: &str) -> Option<Decimal> {
        let data = self.shared.data();
        let id = data.account_numbers.get(account_number)?;
        data.accounts.get(id).map(|a| a.balance)
    }

    /// Make the next commit fail after all writes were staged
    pub fn fail_next_commit(&self) {
        self.shared.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Simulate the store going down (or coming back)
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.shared.data().transactions.clone()
    }

    /// Live outbox rows in creation order
    pub fn outbox(&self) -> Vec<OutboxEvent> {
        self.shared.data().outbox.values().cloned().collect()
    }

    pub fn archived(&self) -> Vec<OutboxEvent> {
        self.shared.data().archive.clone()
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn find_account(&self, account_number: &str) -> Result<Option<Account>, StoreError> {
        self.shared.check_available()?;
        let data = self.shared.data();
        Ok(data
            .account_numbers
            .get(account_number)
            .and_then(|id| data.accounts.get(id))
            .cloned())
    }

    async fn get_customer(&self, customer_id: CustomerId) -> Result<Option<Customer>, StoreError> {
        self.shared.check_available()?;
        Ok(self.shared.data().customers.get(&customer_id).cloned())
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        self.shared.check_available()?;
        Ok(Box::new(InMemoryUnitOfWork {
            shared: self.shared.clone(),
            guards: HashMap::new(),
            balances: HashMap::new(),
            transactions: Vec::new(),
            outbox: Vec::new(),
            finished: false,
        }))
    }

    async fn get_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<Transaction>, StoreError> {
        self.shared.check_available()?;
        let data = self.shared.data();
        Ok(data
            .transaction_index
            .get(&transaction_id)
            .and_then(|&i| data.transactions.get(i))
            .cloned())
    }

    async fn transaction_history(
        &self,
        account_number: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Transaction>, StoreError> {
        self.shared.check_available()?;
        let data = self.shared.data();
        let mut matching: Vec<&Transaction> = data
            .transactions
            .iter()
            .filter(|t| {
                t.from_account_number == account_number || t.to_account_number == account_number
            })
            .collect();
        matching.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then(b.transaction_id.cmp(&a.transaction_id))
        });
        Ok(matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        self.shared.check_available()?;
        Ok(self
            .shared
            .data()
            .outbox
            .values()
            .filter(|e| !e.is_published())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_published(
        &self,
        event_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.shared.check_available()?;
        let mut data = self.shared.data();
        match data
            .outbox
            .values_mut()
            .find(|e| e.event_id == event_id && e.published_at.is_none())
        {
            Some(event) => {
                event.published_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn archive_published(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        self.shared.check_available()?;
        let mut data = self.shared.data();
        let expired: Vec<i64> = data
            .outbox
            .values()
            .filter(|e| e.published_at.is_some_and(|at| at < older_than))
            .map(|e| e.seq)
            .collect();
        for seq in &expired {
            if let Some(event) = data.outbox.remove(seq) {
                data.archive.push(event);
            }
        }
        Ok(expired.len() as u64)
    }
}

/// Unit of work over the in-memory store
struct InMemoryUnitOfWork {
    shared: Arc<Shared>,
    guards: HashMap<AccountId, OwnedMutexGuard<()>>,
    balances: HashMap<AccountId, Decimal>,
    transactions: Vec<Transaction>,
    outbox: Vec<NewOutboxEvent>,
    finished: bool,
}

impl InMemoryUnitOfWork {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            Err(StoreError::Finished)
        } else {
            Ok(())
        }
    }

    fn release(&mut self) {
        self.finished = true;
        self.balances.clear();
        self.transactions.clear();
        self.outbox.clear();
        self.guards.clear();
    }

    /// All checks the store enforces as a last line of defense
    fn check_constraints(&self, data: &LedgerData) -> Result<(), StoreError> {
        for (id, balance) in &self.balances {
            if !data.accounts.contains_key(id) {
                return Err(StoreError::Constraint(format!("account {} does not exist", id)));
            }
            if *balance < Decimal::ZERO {
                return Err(StoreError::Constraint(format!(
                    "balance of account {} would be negative",
                    id
                )));
            }
        }

        let mut new_ids = HashSet::new();
        for tx in &self.transactions {
            if data.transaction_index.contains_key(&tx.transaction_id)
                || !new_ids.insert(tx.transaction_id)
            {
                return Err(StoreError::Constraint(format!(
                    "duplicate transaction_id {}",
                    tx.transaction_id
                )));
            }
            for account in [tx.from_account_id, tx.to_account_id] {
                if !data.accounts.contains_key(&account) {
                    return Err(StoreError::Constraint(format!(
                        "account {} does not exist",
                        account
                    )));
                }
            }
        }

        for event in &self.outbox {
            let known_tx = data.transaction_index.contains_key(&event.transaction_id)
                || new_ids.contains(&event.transaction_id);
            if !known_tx {
                return Err(StoreError::Constraint(format!(
                    "outbox event {} references unknown transaction {}",
                    event.event_id, event.transaction_id
                )));
            }
            let duplicate = data.outbox.values().any(|e| e.event_id == event.event_id)
                || data.archive.iter().any(|e| e.event_id == event.event_id);
            if duplicate {
                return Err(StoreError::Constraint(format!(
                    "duplicate event_id {}",
                    event.event_id
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn lock_account(&mut self, account_id: AccountId) -> Result<Option<Account>, StoreError> {
        self.ensure_open()?;
        self.shared.check_available()?;

        if !self.guards.contains_key(&account_id) {
            let lock = self.shared.row_lock(account_id);
            let guard = tokio::time::timeout(self.shared.lock_timeout, lock.lock_owned())
                .await
                .map_err(|_| StoreError::LockTimeout(account_id))?;
            debug!(account_id = account_id, "Row lock acquired");
            self.guards.insert(account_id, guard);
        }

        let data = self.shared.data();
        Ok(data.accounts.get(&account_id).map(|account| {
            let mut account = account.clone();
            if let Some(staged) = self.balances.get(&account_id) {
                account.balance = *staged;
            }
            account
        }))
    }

    async fn update_balance(
        &mut self,
        account_id: AccountId,
        new_balance: Decimal,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        if !self.guards.contains_key(&account_id) {
            return Err(StoreError::Constraint(format!(
                "account {} updated without holding its lock",
                account_id
            )));
        }
        if new_balance < Decimal::ZERO {
            return Err(StoreError::Constraint(format!(
                "balance of account {} would be negative",
                account_id
            )));
        }
        self.balances.insert(account_id, new_balance);
        Ok(())
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<(), StoreError> {
        self.ensure_open()?;
        transaction
            .check_invariants()
            .map_err(|e| StoreError::Constraint(e.to_string()))?;
        self.transactions.push(transaction.clone());
        Ok(())
    }

    async fn insert_outbox(&mut self, event: &NewOutboxEvent) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.outbox.push(event.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;

        if self.shared.fail_next_commit.swap(false, Ordering::SeqCst) {
            self.release();
            return Err(StoreError::CommitFailed("injected commit failure".to_string()));
        }
        if let Err(e) = self.shared.check_available() {
            self.release();
            return Err(e);
        }

        {
            let mut data = self.shared.data();
            if let Err(e) = self.check_constraints(&data) {
                drop(data);
                self.release();
                return Err(e);
            }

            for (id, balance) in self.balances.drain() {
                if let Some(account) = data.accounts.get_mut(&id) {
                    account.balance = balance;
                    account.version += 1;
                }
            }
            for tx in self.transactions.drain(..) {
                let index = data.transactions.len();
                data.transaction_index.insert(tx.transaction_id, index);
                data.transactions.push(tx);
            }
            for event in self.outbox.drain(..) {
                let seq = data.next_seq;
                data.next_seq += 1;
                data.outbox.insert(
                    seq,
                    OutboxEvent {
                        seq,
                        event_id: event.event_id,
                        transaction_id: event.transaction_id,
                        topic: event.topic,
                        key: event.key,
                        payload: event.payload,
                        created_at: event.created_at,
                        published_at: None,
                    },
                );
            }
        }

        // locks are released only after the data is visible
        self.release();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.release();
        Ok(())
    }
}
