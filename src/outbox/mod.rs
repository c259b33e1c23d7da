//! Transactional outbox
//!
//! The coordinator stages events in the same unit of work as the transfer;
//! [`OutboxPublisher`] drains them to the broker with at-least-once delivery.

pub mod backoff;
pub mod event;
pub mod publisher;

pub use backoff::Backoff;
pub use event::{
    AccountSnapshot, CustomerSnapshot, EventEnvelope, EventMetadata, FailedTransactionEvent,
    TransactionEvent,
};
pub use publisher::{DrainStats, OutboxPublisher, PublishError};
