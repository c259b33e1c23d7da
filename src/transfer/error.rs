//! Transfer Error Types
//!
//! Every failed transfer lands in exactly one class: rejected by validation
//! (no balance changed), failed in storage (nothing committed) or cancelled
//! by the caller before any lock was taken.

use thiserror::Error;

use crate::ledger::{StoreError, ValidationError};

#[derive(Error, Debug, Clone)]
pub enum TransferError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Storage failure: {0}")]
    Storage(#[from] StoreError),

    #[error("Transfer cancelled before any lock was taken")]
    Cancelled,
}

impl TransferError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::Validation(e) => e.code(),
            TransferError::Storage(StoreError::LockTimeout(_)) => "LOCK_TIMEOUT",
            TransferError::Storage(StoreError::Unavailable(_)) => "SERVICE_UNAVAILABLE",
            TransferError::Storage(StoreError::Conflict(_)) => "CONCURRENT_UPDATE",
            TransferError::Storage(_) => "STORAGE_ERROR",
            TransferError::Cancelled => "CANCELLED",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            TransferError::Validation(
                ValidationError::AccountNotFound(_),
            ) => 404,
            TransferError::Validation(
                ValidationError::AccountNotActive { .. }
                | ValidationError::CurrencyMismatch
                | ValidationError::LimitExceeded { .. }
                | ValidationError::InsufficientFunds { .. },
            ) => 422,
            TransferError::Validation(_) => 400,
            TransferError::Storage(
                StoreError::LockTimeout(_) | StoreError::Unavailable(_) | StoreError::Conflict(_),
            ) => 503,
            TransferError::Storage(_) => 500,
            TransferError::Cancelled => 499,
        }
    }

    /// Validation failures are final; storage failures may succeed on retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Storage(
                StoreError::LockTimeout(_)
                    | StoreError::Unavailable(_)
                    | StoreError::CommitFailed(_)
                    | StoreError::Conflict(_)
            )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            TransferError::from(ValidationError::SameAccount).code(),
            "SAME_ACCOUNT"
        );
        assert_eq!(
            TransferError::from(StoreError::LockTimeout(7)).code(),
            "LOCK_TIMEOUT"
        );
        assert_eq!(
            TransferError::from(StoreError::CommitFailed("x".into())).code(),
            "STORAGE_ERROR"
        );
        assert_eq!(TransferError::Cancelled.code(), "CANCELLED");
    }

    #[test]
    fn test_http_status() {
        assert_eq!(
            TransferError::from(ValidationError::InvalidAmount).http_status(),
            400
        );
        assert_eq!(
            TransferError::from(ValidationError::AccountNotFound("ACC-1".into())).http_status(),
            404
        );
        assert_eq!(
            TransferError::from(ValidationError::InsufficientFunds {
                account: "ACC-1".into(),
                balance: Decimal::ZERO,
                required: Decimal::ONE,
            })
            .http_status(),
            422
        );
        assert_eq!(
            TransferError::from(StoreError::Unavailable("down".into())).http_status(),
            503
        );
        assert_eq!(
            TransferError::from(StoreError::Database("boom".into())).http_status(),
            500
        );
    }

    #[test]
    fn test_retryable() {
        assert!(TransferError::from(StoreError::CommitFailed("x".into())).is_retryable());
        assert!(!TransferError::from(ValidationError::SameAccount).is_retryable());
        assert!(!TransferError::Cancelled.is_retryable());
        assert!(!TransferError::from(StoreError::Database("boom".into())).is_retryable());
    }

    #[test]
    fn test_concurrent_update_conflict_is_retryable() {
        let err = TransferError::from(StoreError::Conflict(
            "could not serialize access due to concurrent update".into(),
        ));
        assert!(err.is_retryable());
        assert_eq!(err.code(), "CONCURRENT_UPDATE");
        assert_eq!(err.http_status(), 503);
    }

    #[test]
    fn test_display_is_transparent_for_validation() {
        let err = TransferError::from(ValidationError::SameAccount);
        assert_eq!(err.to_string(), "Cannot transfer to the same account");
    }
}
