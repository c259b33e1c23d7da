//! Transaction event processing
//!
//! Side effects of a completed transfer: regulatory flagging of high-value
//! transfers, per-account analytics, and a notification to each party.
//! All of them are keyed by transaction id so a replayed event is a no-op.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::notifier::{Notification, NotificationKind, Notifier, NotifyError};
use super::reporting::{FailureReport, ReportingError, ReportingStore, TransactionReport};
use crate::broker::Delivery;
use crate::outbox::{EventEnvelope, FailedTransactionEvent, TransactionEvent};

#[derive(Debug, Clone, Error)]
pub enum ProcessingError {
    /// The payload can never be processed; retrying is pointless
    #[error("Malformed event: {0}")]
    Malformed(String),

    #[error("Reporting failed: {0}")]
    Reporting(#[from] ReportingError),

    #[error(transparent)]
    Notification(#[from] NotifyError),
}

impl ProcessingError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProcessingError::Malformed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Applied,
    /// Seen before; nothing changed
    Duplicate,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<HandleOutcome, ProcessingError>;
}

pub struct TransactionProcessor {
    reporting: Arc<dyn ReportingStore>,
    notifier: Arc<dyn Notifier>,
    high_value_threshold: Decimal,
}

impl TransactionProcessor {
    pub fn new(
        reporting: Arc<dyn ReportingStore>,
        notifier: Arc<dyn Notifier>,
        high_value_threshold: Decimal,
    ) -> Self {
        Self {
            reporting,
            notifier,
            high_value_threshold,
        }
    }

    async fn process_completed(
        &self,
        event: &TransactionEvent,
    ) -> Result<HandleOutcome, ProcessingError> {
        let high_value = event.amount > self.high_value_threshold;
        let report = TransactionReport {
            transaction_id: event.transaction_id,
            event_id: event.event_id.clone(),
            from_account: event.from_account.account_number.clone(),
            to_account: event.to_account.account_number.clone(),
            amount: event.amount,
            currency: event.currency.clone(),
            status: event.status(),
            high_value,
            occurred_at: event.timestamp,
        };

        let recorded = self.reporting.record_transaction(&report).await?;
        if recorded && high_value {
            warn!(
                transaction_id = event.transaction_id,
                amount = %event.amount,
                threshold = %self.high_value_threshold,
                "High-value transaction flagged for regulatory reporting"
            );
        }

        let debit = Notification {
            transaction_id: event.transaction_id,
            account_number: event.from_account.account_number.clone(),
            customer_name: event.from_account.customer.name.clone(),
            kind: NotificationKind::Debit,
            amount: event.amount,
            currency: event.currency.clone(),
        };
        let credit = Notification {
            account_number: event.to_account.account_number.clone(),
            customer_name: event.to_account.customer.name.clone(),
            kind: NotificationKind::Credit,
            ..debit.clone()
        };

        let mut notified = false;
        for notification in [debit, credit] {
            notified |= self.notify_once(&notification).await?;
        }

        if recorded || notified {
            info!(
                transaction_id = event.transaction_id,
                "Transaction event processed"
            );
            Ok(HandleOutcome::Applied)
        } else {
            Ok(HandleOutcome::Duplicate)
        }
    }

    /// Send unless already sent. A crash between send and mark re-sends.
    async fn notify_once(&self, notification: &Notification) -> Result<bool, ProcessingError> {
        if self
            .reporting
            .is_notified(notification.transaction_id, &notification.account_number)
            .await?
        {
            return Ok(false);
        }
        self.notifier.notify(notification).await?;
        self.reporting
            .mark_notified(notification.transaction_id, &notification.account_number)
            .await?;
        Ok(true)
    }

    async fn process_failed(
        &self,
        event: &FailedTransactionEvent,
    ) -> Result<HandleOutcome, ProcessingError> {
        let original = &event.original_event;
        let report = FailureReport {
            transaction_id: event.transaction_id,
            event_id: event.event_id.clone(),
            from_account: original.from_account.account_number.clone(),
            to_account: original.to_account.account_number.clone(),
            amount: original.amount,
            error_code: event.error_code.clone(),
            error_message: event.error_message.clone(),
            occurred_at: event.timestamp,
        };

        if self.reporting.record_failure(&report).await? {
            warn!(
                transaction_id = event.transaction_id,
                code = %event.error_code,
                "Failed transaction recorded for investigation: {}", event.error_message
            );
            Ok(HandleOutcome::Applied)
        } else {
            Ok(HandleOutcome::Duplicate)
        }
    }
}

#[async_trait]
impl EventHandler for TransactionProcessor {
    async fn handle(&self, delivery: &Delivery) -> Result<HandleOutcome, ProcessingError> {
        let envelope = EventEnvelope::from_slice(&delivery.payload)
            .map_err(|e| ProcessingError::Malformed(e.to_string()))?;

        let outcome = match &envelope {
            EventEnvelope::Transaction(event) => self.process_completed(event).await?,
            EventEnvelope::FailedTransaction(event) => self.process_failed(event).await?,
        };
        if outcome == HandleOutcome::Duplicate {
            debug!(
                transaction_id = envelope.transaction_id(),
                offset = delivery.offset,
                "Duplicate event skipped"
            );
        }
        Ok(outcome)
    }
}
