//! Customer notifications (email / SMS / push are out of process; this is
//! the hand-off point)

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::info;

use crate::ledger::TransactionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Debit,
    Credit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub transaction_id: TransactionId,
    pub account_number: String,
    pub customer_name: String,
    pub kind: NotificationKind,
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, Error)]
#[error("Notification delivery failed: {0}")]
pub struct NotifyError(pub String);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
        info!(
            transaction_id = n.transaction_id,
            account = %n.account_number,
            kind = ?n.kind,
            amount = %n.amount,
            currency = %n.currency,
            "Notification sent to {}", n.customer_name
        );
        Ok(())
    }
}

/// Records notifications; can be told to fail
#[derive(Default)]
pub struct InMemoryNotifier {
    sent: Mutex<Vec<Notification>>,
    failures_pending: AtomicU32,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
        if self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1))
            .is_ok()
        {
            return Err(NotifyError("injected failure".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(n.clone());
        Ok(())
    }
}
