//! Transfer Coordinator
//!
//! Moves money between two accounts of the ledger. A transfer either
//! commits completely (both balances, the transaction row and its outbox
//! event) or leaves no trace apart from an optional Failed audit row.
//!
//! # Safety Invariants
//!
//! 1. **Atomic unit of work**: balances, transaction row and outbox row commit together
//! 2. **Ordered locking**: row locks are taken in ascending account id order
//! 3. **Check under lock**: funds and status are re-read after both locks are held
//! 4. **No partial state**: a started unit of work always ends in commit or rollback

pub mod coordinator;
pub mod error;
pub mod id;
pub mod types;

#[cfg(test)]
mod integration_tests;

// Re-exports for convenience
pub use coordinator::TransferCoordinator;
pub use error::TransferError;
pub use id::TransactionIdGenerator;
pub use types::{TransferOutcome, TransferRequest, TransferResult};
