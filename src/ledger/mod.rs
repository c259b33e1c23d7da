//! Ledger: accounts, customers, the transaction audit log and the outbox
//!
//! Storage is reached only through [`LedgerStore`] and [`UnitOfWork`];
//! [`InMemoryLedgerStore`] and [`PgLedgerStore`] implement them.

pub mod memory;
pub mod models;
pub mod postgres;
pub mod schema;
pub mod store;
pub mod validation;

pub use memory::InMemoryLedgerStore;
pub use models::{
    Account, AccountId, AccountStatus, AccountType, Customer, CustomerId, CustomerIdentity,
    NewOutboxEvent, OutboxEvent, PROCESSED_BY, TRANSFER_SOURCE, Transaction, TransactionId,
    TransactionStatus, VipTier,
};
pub use postgres::PgLedgerStore;
pub use store::{LedgerStore, StoreError, UnitOfWork};
pub use validation::{Currency, TransferAmount, ValidationError};
