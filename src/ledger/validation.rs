//! Input validation for transfer requests
//!
//! Validated wrapper types keep their fields private so the only way to get
//! one is through the checking constructor.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::models::AccountStatus;

/// Longest description accepted on a transfer
pub const MAX_DESCRIPTION_LEN: usize = 500;

// ============================================================================
// Validation Errors
// ============================================================================

/// Reasons a transfer is rejected without any state change
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("Cannot transfer to the same account")]
    SameAccount,

    #[error("Transfer amount must be positive")]
    InvalidAmount,

    #[error("Amount precision exceeds {max} decimal places")]
    PrecisionOverflow { max: u32 },

    #[error("Transfer amount {amount} exceeds maximum limit {max}")]
    AmountTooLarge { amount: Decimal, max: Decimal },

    #[error("Invalid currency code: '{0}'")]
    InvalidCurrency(String),

    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),

    #[error("Invalid account number: '{0}'")]
    InvalidAccountNumber(String),

    #[error("Description exceeds {max} characters")]
    DescriptionTooLong { max: usize },

    #[error("Account {0} not found")]
    AccountNotFound(String),

    #[error("Account {account} is not active (status: {status})")]
    AccountNotActive {
        account: String,
        status: AccountStatus,
    },

    #[error("Currency mismatch between accounts and transfer request")]
    CurrencyMismatch,

    #[error("Transfer amount {amount} exceeds limit {limit} for account type {account_type}")]
    LimitExceeded {
        amount: Decimal,
        limit: Decimal,
        account_type: &'static str,
    },

    #[error("Insufficient funds in account {account}. Balance: {balance}, Required: {required}")]
    InsufficientFunds {
        account: String,
        balance: Decimal,
        required: Decimal,
    },
}

impl ValidationError {
    /// Stable error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::SameAccount => "SAME_ACCOUNT",
            ValidationError::InvalidAmount => "INVALID_AMOUNT",
            ValidationError::PrecisionOverflow { .. } => "PRECISION_OVERFLOW",
            ValidationError::AmountTooLarge { .. } => "AMOUNT_TOO_LARGE",
            ValidationError::InvalidCurrency(_) => "INVALID_CURRENCY",
            ValidationError::UnsupportedCurrency(_) => "UNSUPPORTED_CURRENCY",
            ValidationError::InvalidAccountNumber(_) => "INVALID_ACCOUNT_NUMBER",
            ValidationError::DescriptionTooLong { .. } => "DESCRIPTION_TOO_LONG",
            ValidationError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            ValidationError::AccountNotActive { .. } => "ACCOUNT_NOT_ACTIVE",
            ValidationError::CurrencyMismatch => "CURRENCY_MISMATCH",
            ValidationError::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            ValidationError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
        }
    }
}

// ============================================================================
// Currency
// ============================================================================

/// ISO-4217 style currency code (three uppercase ASCII letters)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> Result<Self, ValidationError> {
        let code = code.trim();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(ValidationError::InvalidCurrency(code.to_string()));
        }
        Ok(Self(code.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Currency {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Currency::new(&value)
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.0
    }
}

// ============================================================================
// Account number
// ============================================================================

/// Validate an account number: 1-50 chars of A-Z, 0-9 or '-'
pub fn validate_account_number(number: &str) -> Result<&str, ValidationError> {
    let trimmed = number.trim();
    if trimmed.is_empty()
        || trimmed.len() > 50
        || !trimmed
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(ValidationError::InvalidAccountNumber(number.to_string()));
    }
    Ok(trimmed)
}

// ============================================================================
// Amount
// ============================================================================

/// Positive fixed-point amount with at most `scale` decimal places
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TransferAmount(Decimal);

impl TransferAmount {
    /// Validate without rounding. `1.005` at scale 2 is rejected, not rounded.
    pub fn new(amount: Decimal, scale: u32, max: Decimal) -> Result<Self, ValidationError> {
        if amount <= Decimal::ZERO {
            return Err(ValidationError::InvalidAmount);
        }
        if amount.normalize().scale() > scale {
            return Err(ValidationError::PrecisionOverflow { max: scale });
        }
        if amount > max {
            return Err(ValidationError::AmountTooLarge { amount, max });
        }
        Ok(Self(amount))
    }

    #[inline]
    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for TransferAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn validate_description(description: Option<&str>) -> Result<(), ValidationError> {
    match description {
        Some(d) if d.chars().count() > MAX_DESCRIPTION_LEN => Err(
            ValidationError::DescriptionTooLong {
                max: MAX_DESCRIPTION_LEN,
            },
        ),
        _ => Ok(()),
    }
}
