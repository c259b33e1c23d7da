//! Transfer Engine - atomic money transfers with reliable event publication
//!
//! ```text
//! ┌──────────┐  unit of work   ┌──────────┐  poll/notify  ┌───────────┐
//! │ Transfer │────────────────▶│  Ledger  │──────────────▶│  Outbox   │
//! │Coordinator  lock+debit+    │  Store   │               │ Publisher │
//! └──────────┘  credit+outbox  └──────────┘               └─────┬─────┘
//!                                                               │ at-least-once
//!                              ┌──────────┐   subscribe   ┌─────▼─────┐
//!                              │ Reporting│◀──────────────│  Broker   │
//!                              │ Notifier │  EventConsumer└───────────┘
//!                              └──────────┘
//! ```
//!
//! # Modules
//!
//! - [`ledger`] - Accounts, transactions, outbox rows and the store seam
//! - [`transfer`] - Transfer coordinator and caller-visible errors
//! - [`outbox`] - Event schema and the outbox publisher
//! - [`broker`] - Broker seam and in-memory broker
//! - [`consumer`] - Idempotent consumer, reconnection state machine, dead letters
//! - [`signal`] - Shutdown / cancellation flag

pub mod broker;
pub mod config;
pub mod consumer;
pub mod db;
pub mod ledger;
pub mod logging;
pub mod outbox;
pub mod signal;
pub mod transfer;

// Convenient re-exports at crate root
pub use broker::{BrokerError, Delivery, EventBroker, InMemoryBroker, Subscription};
pub use config::AppConfig;
pub use consumer::{ConnectionState, ConsumerSettings, EventConsumer, TransactionProcessor};
pub use ledger::{
    Account, AccountStatus, AccountType, Currency, Customer, CustomerIdentity, InMemoryLedgerStore,
    LedgerStore, PgLedgerStore, StoreError, Transaction, TransactionStatus, ValidationError,
};
pub use outbox::{EventEnvelope, OutboxPublisher, TransactionEvent};
pub use signal::Signal;
pub use transfer::{TransferCoordinator, TransferError, TransferOutcome, TransferRequest, TransferResult};
