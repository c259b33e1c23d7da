//! Ledger data model: customers, accounts, transactions and outbox rows.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::validation::Currency;

pub type CustomerId = i64;
pub type AccountId = i64;
pub type TransactionId = i64;

/// Default audit metadata written on every transaction row
pub const PROCESSED_BY: &str = "bank-core-service";
pub const TRANSFER_SOURCE: &str = "api/v1/transfer";

// ============================================================================
// Customer
// ============================================================================

/// Identity document, tied to the customer type. Exactly one identifier
/// exists per customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomerIdentity {
    Individual { personal_id: String },
    Business { business_number: String },
}

impl CustomerIdentity {
    /// Storage/wire name of the customer type
    pub fn type_name(&self) -> &'static str {
        match self {
            CustomerIdentity::Individual { .. } => "individual",
            CustomerIdentity::Business { .. } => "business",
        }
    }

    pub fn personal_id(&self) -> Option<&str> {
        match self {
            CustomerIdentity::Individual { personal_id } => Some(personal_id),
            CustomerIdentity::Business { .. } => None,
        }
    }

    pub fn business_number(&self) -> Option<&str> {
        match self {
            CustomerIdentity::Individual { .. } => None,
            CustomerIdentity::Business { business_number } => Some(business_number),
        }
    }

    /// Rebuild from the nullable storage columns
    pub fn from_columns(
        customer_type: &str,
        personal_id: Option<String>,
        business_number: Option<String>,
    ) -> Option<Self> {
        match (customer_type, personal_id, business_number) {
            ("individual", Some(personal_id), None) => {
                Some(CustomerIdentity::Individual { personal_id })
            }
            ("business", None, Some(business_number)) => {
                Some(CustomerIdentity::Business { business_number })
            }
            _ => None,
        }
    }
}

/// VIP tier, orthogonal to the customer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VipTier {
    Gold,
    Platinum,
    Diamond,
}

impl VipTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            VipTier::Gold => "Gold",
            VipTier::Platinum => "Platinum",
            VipTier::Diamond => "Diamond",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Gold" => Some(VipTier::Gold),
            "Platinum" => Some(VipTier::Platinum),
            "Diamond" => Some(VipTier::Diamond),
            _ => None,
        }
    }
}

impl fmt::Display for VipTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Customer {
    pub id: CustomerId,
    pub name: String,
    pub identity: CustomerIdentity,
    pub vip_tier: Option<VipTier>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl Customer {
    pub fn individual(id: CustomerId, name: &str, personal_id: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            identity: CustomerIdentity::Individual {
                personal_id: personal_id.to_string(),
            },
            vip_tier: None,
            email: None,
            phone: None,
        }
    }

    pub fn business(id: CustomerId, name: &str, business_number: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            identity: CustomerIdentity::Business {
                business_number: business_number.to_string(),
            },
            vip_tier: None,
            email: None,
            phone: None,
        }
    }

    pub fn with_vip_tier(mut self, tier: VipTier) -> Self {
        self.vip_tier = Some(tier);
        self
    }

    pub fn is_vip(&self) -> bool {
        self.vip_tier.is_some()
    }
}

// ============================================================================
// Account
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountStatus {
    Active,
    Inactive,
    Frozen,
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Inactive => "inactive",
            AccountStatus::Frozen => "frozen",
            AccountStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AccountStatus::Active),
            "inactive" => Some(AccountStatus::Inactive),
            "frozen" => Some(AccountStatus::Frozen),
            "closed" => Some(AccountStatus::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Checking,
    Savings,
    Business,
    Vip,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Checking => "checking",
            AccountType::Savings => "savings",
            AccountType::Business => "business",
            AccountType::Vip => "vip",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "checking" => Some(AccountType::Checking),
            "savings" => Some(AccountType::Savings),
            "business" => Some(AccountType::Business),
            "vip" => Some(AccountType::Vip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: AccountId,
    pub customer_id: CustomerId,
    pub account_number: String,
    pub account_type: AccountType,
    pub balance: Decimal,
    pub currency: Currency,
    pub status: AccountStatus,
    /// Bumped on every balance update
    pub version: i64,
}

impl Account {
    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

// ============================================================================
// Transaction
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransactionStatus::Pending),
            "completed" => Some(TransactionStatus::Completed),
            "failed" => Some(TransactionStatus::Failed),
            "cancelled" => Some(TransactionStatus::Cancelled),
            _ => None,
        }
    }

    /// Completed and Failed rows are permanent ledger entries
    #[inline]
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Failed
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable audit record of one transfer attempt
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub transaction_id: TransactionId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub from_account_number: String,
    pub to_account_number: String,
    pub from_balance_before: Decimal,
    pub from_balance_after: Decimal,
    pub to_balance_before: Decimal,
    pub to_balance_after: Decimal,
    pub amount: Decimal,
    pub currency: Currency,
    pub description: Option<String>,
    pub status: TransactionStatus,
    pub processed_by: String,
    pub source: String,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Transaction {
    /// Money moved out of `from` equals money moved into `to`
    pub fn is_balanced(&self) -> bool {
        self.from_balance_before + self.to_balance_before
            == self.from_balance_after + self.to_balance_after
    }

    /// Structural invariants every stored row must satisfy
    pub fn check_invariants(&self) -> Result<(), &'static str> {
        if self.from_account_id == self.to_account_id {
            return Err("from and to account must differ");
        }
        if self.amount <= Decimal::ZERO {
            return Err("amount must be positive");
        }
        if self.from_balance_after < Decimal::ZERO || self.to_balance_after < Decimal::ZERO {
            return Err("balance after must not be negative");
        }
        if self.status == TransactionStatus::Completed
            && (self.from_balance_after != self.from_balance_before - self.amount
                || self.to_balance_after != self.to_balance_before + self.amount)
        {
            return Err("completed transaction balances do not match amount");
        }
        if self.status == TransactionStatus::Failed
            && (self.from_balance_after != self.from_balance_before
                || self.to_balance_after != self.to_balance_before)
        {
            return Err("failed transaction must not move balances");
        }
        Ok(())
    }
}

// ============================================================================
// Outbox
// ============================================================================

/// Outbox row as written by the coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub event_id: String,
    pub transaction_id: TransactionId,
    pub topic: String,
    /// Partition key on the broker
    pub key: String,
    /// Serialized JSON payload
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// Outbox row as read back by the publisher. `seq` is the creation order.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEvent {
    pub seq: i64,
    pub event_id: String,
    pub transaction_id: TransactionId,
    pub topic: String,
    pub key: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    #[inline]
    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }
}
