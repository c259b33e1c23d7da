//! Idempotent downstream consumer
//!
//! [`EventConsumer`] follows one topic through broker outages using
//! [`ConnectionStateMachine`]; [`TransactionProcessor`] applies each event
//! to the reporting store and notifier at most once per transaction.

pub mod dead_letter;
pub mod notifier;
pub mod processor;
pub mod reporting;
pub mod state;
pub mod worker;

pub use dead_letter::{
    BrokerDeadLetterSink, DeadLetter, DeadLetterError, DeadLetterSink, InMemoryDeadLetterSink,
};
pub use notifier::{InMemoryNotifier, LogNotifier, Notification, NotificationKind, Notifier};
pub use processor::{EventHandler, HandleOutcome, ProcessingError, TransactionProcessor};
pub use reporting::{
    AccountSummary, FailureReport, InMemoryReportingStore, PgReportingStore, REPORTING_SCHEMA,
    ReportingError, ReportingSnapshot, ReportingStore, TransactionReport,
};
pub use state::{ConnectionEvent, ConnectionState, ConnectionStateMachine, TransitionError};
pub use worker::{ConsumerSettings, ConsumerStats, EventConsumer};
