//! Transfer Coordinator
//!
//! Executes one transfer as a single unit of work:
//!
//! ```text
//! validate request ─▶ resolve accounts ─▶ lock (ascending id) ─▶ re-validate
//!        │                   │                                     │
//!        ▼                   ▼                          ok ────────┴──────── rejected
//!   Rejected            Rejected          debit + credit + txn row     rollback, then
//!   (no lock)           (no lock)         + outbox row ─▶ COMMIT       Failed row + event
//! ```
//!
//! Locks are always taken in ascending account id order so two transfers
//! over the same pair can never deadlock. Once the locked phase starts it
//! runs on its own task, so a caller that goes away cannot leave the unit
//! of work half-applied.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use super::error::TransferError;
use super::id::TransactionIdGenerator;
use super::types::{TransferRequest, TransferResult};
use crate::config::{OutboxConfig, TransferConfig};
use crate::ledger::validation::{validate_account_number, validate_description};
use crate::ledger::{
    Account, AccountId, Currency, Customer, LedgerStore, NewOutboxEvent, PROCESSED_BY,
    StoreError, TRANSFER_SOURCE, Transaction, TransactionId, TransactionStatus, TransferAmount,
    UnitOfWork, ValidationError,
};
use crate::outbox::event::{EventEnvelope, FailedTransactionEvent, TransactionEvent};
use crate::signal::Signal;

/// Request after every check that needs no storage access
#[derive(Debug, Clone)]
struct CheckedRequest {
    from_account: String,
    to_account: String,
    amount: TransferAmount,
    currency: Currency,
    description: Option<String>,
}

/// An account together with its holder, read without locks
#[derive(Debug, Clone)]
struct Party {
    account: Account,
    customer: Customer,
}

struct Shared {
    store: Arc<dyn LedgerStore>,
    config: TransferConfig,
    completed_topic: String,
    failed_topic: String,
    ids: TransactionIdGenerator,
    outbox_notify: Arc<Notify>,
}

/// Transfer Coordinator - atomic balance movement plus outbox write
#[derive(Clone)]
pub struct TransferCoordinator {
    shared: Arc<Shared>,
}

impl TransferCoordinator {
    pub fn new(store: Arc<dyn LedgerStore>, config: TransferConfig, outbox: &OutboxConfig) -> Self {
        let ids = TransactionIdGenerator::new(config.machine_id);
        Self {
            shared: Arc::new(Shared {
                store,
                completed_topic: outbox.topic.clone(),
                failed_topic: outbox.failed_topic.clone(),
                config,
                ids,
                outbox_notify: Arc::new(Notify::new()),
            }),
        }
    }

    /// Notified after every commit that wrote an outbox row
    pub fn outbox_notify(&self) -> Arc<Notify> {
        self.shared.outbox_notify.clone()
    }

    /// Execute a transfer to a definite outcome
    pub async fn transfer(&self, req: TransferRequest) -> Result<TransferResult, TransferError> {
        self.transfer_cancellable(req, &Signal::never()).await
    }

    /// Execute a transfer that the caller may cancel.
    ///
    /// Cancellation is honored until both row locks are held. After that
    /// the unit of work always runs to commit or rollback.
    pub async fn transfer_cancellable(
        &self,
        req: TransferRequest,
        cancel: &Signal,
    ) -> Result<TransferResult, TransferError> {
        let checked = match self.shared.check_request(&req) {
            Ok(checked) => checked,
            Err(e) => {
                warn!(
                    from = %req.from_account,
                    to = %req.to_account,
                    amount = %req.amount,
                    code = e.code(),
                    "Transfer rejected: {}", e
                );
                return Err(e.into());
            }
        };

        let (from, to) = self.shared.resolve(&checked).await?;
        if cancel.is_triggered() {
            info!(from = %checked.from_account, to = %checked.to_account, "Transfer cancelled before locking");
            return Err(TransferError::Cancelled);
        }

        let shared = self.shared.clone();
        let cancel = cancel.clone();
        let task = tokio::spawn(async move { shared.execute(checked, from, to, cancel).await });

        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!("Transfer task aborted: {}", e);
                Err(StoreError::Database(format!("transfer task aborted: {}", e)).into())
            }
        }
    }

    pub async fn get_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<Transaction>, TransferError> {
        Ok(self.shared.store.get_transaction(transaction_id).await?)
    }

    /// Newest first
    pub async fn transaction_history(
        &self,
        account_number: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Transaction>, TransferError> {
        let account_number = validate_account_number(account_number)?;
        Ok(self
            .shared
            .store
            .transaction_history(account_number, offset, limit)
            .await?)
    }
}

impl Shared {
    fn check_request(&self, req: &TransferRequest) -> Result<CheckedRequest, ValidationError> {
        let from_account = validate_account_number(&req.from_account)?.to_string();
        let to_account = validate_account_number(&req.to_account)?.to_string();
        if from_account == to_account {
            return Err(ValidationError::SameAccount);
        }

        let amount = TransferAmount::new(
            req.amount,
            self.config.amount_scale,
            self.config.max_transfer_amount,
        )?;

        let currency = Currency::new(&req.currency)?;
        if !self
            .config
            .supported_currencies
            .iter()
            .any(|c| c == currency.as_str())
        {
            return Err(ValidationError::UnsupportedCurrency(currency.to_string()));
        }

        validate_description(req.description.as_deref())?;

        Ok(CheckedRequest {
            from_account,
            to_account,
            amount,
            currency,
            description: req.description.clone(),
        })
    }

    async fn resolve(&self, checked: &CheckedRequest) -> Result<(Party, Party), TransferError> {
        let from = self.resolve_party(&checked.from_account).await?;
        let to = self.resolve_party(&checked.to_account).await?;
        if from.account.id == to.account.id {
            return Err(ValidationError::SameAccount.into());
        }
        Ok((from, to))
    }

    async fn resolve_party(&self, account_number: &str) -> Result<Party, TransferError> {
        let account = self
            .store
            .find_account(account_number)
            .await?
            .ok_or_else(|| ValidationError::AccountNotFound(account_number.to_string()))?;
        let customer = self
            .store
            .get_customer(account.customer_id)
            .await?
            .ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "account {} references missing customer {}",
                    account.account_number, account.customer_id
                ))
            })?;
        Ok(Party { account, customer })
    }

    /// Checks that depend on row state, run while both rows are locked
    fn check_locked(
        &self,
        checked: &CheckedRequest,
        from: &Account,
        to: &Account,
    ) -> Result<(), ValidationError> {
        for account in [from, to] {
            if !account.is_active() {
                return Err(ValidationError::AccountNotActive {
                    account: account.account_number.clone(),
                    status: account.status,
                });
            }
        }

        if from.currency != checked.currency || to.currency != checked.currency {
            return Err(ValidationError::CurrencyMismatch);
        }

        let amount = checked.amount.value();
        let limit = self.config.limits.for_account_type(from.account_type);
        if amount > limit {
            return Err(ValidationError::LimitExceeded {
                amount,
                limit,
                account_type: from.account_type.as_str(),
            });
        }

        if from.balance < amount {
            return Err(ValidationError::InsufficientFunds {
                account: from.account_number.clone(),
                balance: from.balance,
                required: amount,
            });
        }
        Ok(())
    }

    async fn execute(
        self: Arc<Self>,
        checked: CheckedRequest,
        from: Party,
        to: Party,
        cancel: Signal,
    ) -> Result<TransferResult, TransferError> {
        let mut uow = self.store.begin().await?;

        let locked = tokio::select! {
            biased;
            _ = cancel.triggered() => None,
            locked = lock_in_order(uow.as_mut(), from.account.id, to.account.id) => Some(locked),
        };
        let Some(locked) = locked else {
            rollback_quietly(uow.as_mut()).await;
            info!(from = %checked.from_account, to = %checked.to_account, "Transfer cancelled while waiting for locks");
            return Err(TransferError::Cancelled);
        };
        let (locked_from, locked_to) = locked?;

        let locked_from = locked_from
            .ok_or_else(|| ValidationError::AccountNotFound(checked.from_account.clone()))?;
        let locked_to =
            locked_to.ok_or_else(|| ValidationError::AccountNotFound(checked.to_account.clone()))?;
        debug!(
            from_id = locked_from.id,
            to_id = locked_to.id,
            "Both account rows locked"
        );

        if let Err(rejection) = self.check_locked(&checked, &locked_from, &locked_to) {
            rollback_quietly(uow.as_mut()).await;
            warn!(
                from = %checked.from_account,
                to = %checked.to_account,
                amount = %checked.amount,
                code = rejection.code(),
                "Transfer rejected: {}", rejection
            );
            let from = Party {
                account: locked_from,
                customer: from.customer,
            };
            let to = Party {
                account: locked_to,
                customer: to.customer,
            };
            self.record_failure(&checked, &from, &to, &rejection).await;
            return Err(rejection.into());
        }

        let amount = checked.amount.value();
        let transaction = Transaction {
            transaction_id: self.ids.next_id(),
            from_account_id: locked_from.id,
            to_account_id: locked_to.id,
            from_account_number: locked_from.account_number.clone(),
            to_account_number: locked_to.account_number.clone(),
            from_balance_before: locked_from.balance,
            from_balance_after: locked_from.balance - amount,
            to_balance_before: locked_to.balance,
            to_balance_after: locked_to.balance + amount,
            amount,
            currency: checked.currency.clone(),
            description: checked.description.clone(),
            status: TransactionStatus::Completed,
            processed_by: PROCESSED_BY.to_string(),
            source: TRANSFER_SOURCE.to_string(),
            error_message: None,
            timestamp: Utc::now(),
        };

        let event = TransactionEvent::from_transaction(
            Ulid::new().to_string(),
            &transaction,
            (&locked_from, &from.customer),
            (&locked_to, &to.customer),
        );
        let outbox_row =
            self.outbox_row(&self.completed_topic, EventEnvelope::Transaction(event))?;

        uow.update_balance(locked_from.id, transaction.from_balance_after)
            .await?;
        uow.update_balance(locked_to.id, transaction.to_balance_after)
            .await?;
        uow.insert_transaction(&transaction).await?;
        uow.insert_outbox(&outbox_row).await?;

        if let Err(e) = uow.commit().await {
            error!(
                transaction_id = transaction.transaction_id,
                "Transfer commit failed: {}", e
            );
            return Err(e.into());
        }
        self.outbox_notify.notify_one();

        info!(
            transaction_id = transaction.transaction_id,
            from = %transaction.from_account_number,
            to = %transaction.to_account_number,
            amount = %amount,
            currency = %transaction.currency,
            "Transfer completed"
        );

        Ok(TransferResult {
            transaction_id: transaction.transaction_id,
            status: transaction.status,
            from_balance_after: transaction.from_balance_after,
            to_balance_after: transaction.to_balance_after,
            timestamp: transaction.timestamp,
        })
    }

    /// Write the Failed audit row and its event in a unit of work of their
    /// own. The caller's outcome stays `ValidationRejected` either way.
    async fn record_failure(
        &self,
        checked: &CheckedRequest,
        from: &Party,
        to: &Party,
        rejection: &ValidationError,
    ) {
        let transaction = Transaction {
            transaction_id: self.ids.next_id(),
            from_account_id: from.account.id,
            to_account_id: to.account.id,
            from_account_number: from.account.account_number.clone(),
            to_account_number: to.account.account_number.clone(),
            from_balance_before: from.account.balance,
            from_balance_after: from.account.balance,
            to_balance_before: to.account.balance,
            to_balance_after: to.account.balance,
            amount: checked.amount.value(),
            currency: checked.currency.clone(),
            description: checked.description.clone(),
            status: TransactionStatus::Failed,
            processed_by: PROCESSED_BY.to_string(),
            source: TRANSFER_SOURCE.to_string(),
            error_message: Some(rejection.to_string()),
            timestamp: Utc::now(),
        };

        let original = TransactionEvent::from_transaction(
            Ulid::new().to_string(),
            &transaction,
            (&from.account, &from.customer),
            (&to.account, &to.customer),
        );
        let envelope = EventEnvelope::FailedTransaction(FailedTransactionEvent {
            event_id: Ulid::new().to_string(),
            timestamp: transaction.timestamp,
            transaction_id: transaction.transaction_id,
            error_code: rejection.code().to_string(),
            error_message: rejection.to_string(),
            retry_count: 0,
            original_event: original,
        });

        let result = async {
            let outbox_row = self.outbox_row(&self.failed_topic, envelope)?;
            let mut uow = self.store.begin().await?;
            uow.insert_transaction(&transaction).await?;
            uow.insert_outbox(&outbox_row).await?;
            uow.commit().await?;
            Ok::<(), TransferError>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.outbox_notify.notify_one();
                debug!(
                    transaction_id = transaction.transaction_id,
                    "Failed transfer recorded"
                );
            }
            Err(e) => {
                error!(
                    transaction_id = transaction.transaction_id,
                    "Failed to record rejected transfer: {}", e
                );
            }
        }
    }

    fn outbox_row(
        &self,
        topic: &str,
        envelope: EventEnvelope,
    ) -> Result<NewOutboxEvent, TransferError> {
        let payload = envelope
            .to_json()
            .map_err(|e| StoreError::Corrupt(format!("event encoding failed: {}", e)))?;
        Ok(NewOutboxEvent {
            event_id: envelope.event_id().to_string(),
            transaction_id: envelope.transaction_id(),
            topic: topic.to_string(),
            key: envelope.transaction_id().to_string(),
            payload,
            created_at: Utc::now(),
        })
    }
}

/// Lock both rows, lower id first. Returned in (from, to) order.
async fn lock_in_order(
    uow: &mut dyn UnitOfWork,
    from: AccountId,
    to: AccountId,
) -> Result<(Option<Account>, Option<Account>), StoreError> {
    if from < to {
        let from_row = uow.lock_account(from).await?;
        let to_row = uow.lock_account(to).await?;
        Ok((from_row, to_row))
    } else {
        let to_row = uow.lock_account(to).await?;
        let from_row = uow.lock_account(from).await?;
        Ok((from_row, to_row))
    }
}

async fn rollback_quietly(uow: &mut dyn UnitOfWork) {
    if let Err(e) = uow.rollback().await {
        warn!("Rollback failed: {}", e);
    }
}
