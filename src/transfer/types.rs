//! Transfer request/response types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::error::TransferError;
use crate::ledger::{TransactionId, TransactionStatus};

/// Transfer request as received from the caller. Nothing here is trusted
/// until the coordinator validated it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_account: String,
    pub to_account: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TransferRequest {
    pub fn new(from_account: &str, to_account: &str, amount: Decimal, currency: &str) -> Self {
        Self {
            from_account: from_account.to_string(),
            to_account: to_account.to_string(),
            amount,
            currency: currency.to_string(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
}

/// Result of a committed transfer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferResult {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    #[serde(with = "rust_decimal::serde::str")]
    pub from_balance_after: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub to_balance_after: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// The three outcomes a caller can observe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferOutcome {
    Completed,
    /// Storage failure or cancellation; nothing was applied, safe to retry
    Failed,
    ValidationRejected,
}

impl TransferOutcome {
    pub fn of(result: &Result<TransferResult, TransferError>) -> Self {
        match result {
            Ok(_) => TransferOutcome::Completed,
            Err(TransferError::Validation(_)) => TransferOutcome::ValidationRejected,
            Err(TransferError::Storage(_)) | Err(TransferError::Cancelled) => {
                TransferOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{StoreError, ValidationError};
    use std::str::FromStr;

    #[test]
    fn test_request_deserialize_keeps_precision() {
        let json = r#"{"from_account":"ACC-1001","to_account":"ACC-2002","amount":"300.10","currency":"ILS"}"#;
        let req: TransferRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.amount, Decimal::from_str("300.10").unwrap());
        assert_eq!(req.description, None);
    }

    #[test]
    fn test_outcome_classes() {
        assert_eq!(
            TransferOutcome::of(&Err(ValidationError::SameAccount.into())),
            TransferOutcome::ValidationRejected
        );
        assert_eq!(
            TransferOutcome::of(&Err(StoreError::CommitFailed("x".into()).into())),
            TransferOutcome::Failed
        );
        assert_eq!(
            TransferOutcome::of(&Err(TransferError::Cancelled)),
            TransferOutcome::Failed
        );
    }
}
