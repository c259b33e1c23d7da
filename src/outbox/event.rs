//! Published event schema
//!
//! Payloads are JSON with an `event_type` tag. Decimal amounts travel as
//! strings so consumers never see a rounded float.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ledger::{
    Account, AccountId, Customer, CustomerId, Transaction, TransactionId, TransactionStatus,
    VipTier,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerSnapshot {
    pub id: CustomerId,
    pub name: String,
    #[serde(rename = "type")]
    pub customer_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vip_tier: Option<VipTier>,
}

impl From<&Customer> for CustomerSnapshot {
    fn from(c: &Customer) -> Self {
        Self {
            id: c.id,
            name: c.name.clone(),
            customer_type: c.identity.type_name().to_string(),
            personal_id: c.identity.personal_id().map(str::to_string),
            business_number: c.identity.business_number().map(str::to_string),
            vip_tier: c.vip_tier,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub id: AccountId,
    pub account_number: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub balance_before: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub balance_after: Decimal,
    pub customer: CustomerSnapshot,
}

impl AccountSnapshot {
    pub fn new(account: &Account, customer: &Customer, before: Decimal, after: Decimal) -> Self {
        Self {
            id: account.id,
            account_number: account.account_number.clone(),
            balance_before: before,
            balance_after: after,
            customer: customer.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub processed_by: String,
    pub source: String,
    pub status: TransactionStatus,
}

/// One transfer attempt as seen by downstream systems
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub transaction_id: TransactionId,
    pub from_account: AccountSnapshot,
    pub to_account: AccountSnapshot,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub currency: String,
    #[serde(default)]
    pub description: Option<String>,
    pub metadata: EventMetadata,
}

impl TransactionEvent {
    /// Build from a ledger row plus the account holders
    pub fn from_transaction(
        event_id: String,
        tx: &Transaction,
        from: (&Account, &Customer),
        to: (&Account, &Customer),
    ) -> Self {
        Self {
            event_id,
            timestamp: tx.timestamp,
            transaction_id: tx.transaction_id,
            from_account: AccountSnapshot::new(
                from.0,
                from.1,
                tx.from_balance_before,
                tx.from_balance_after,
            ),
            to_account: AccountSnapshot::new(to.0, to.1, tx.to_balance_before, tx.to_balance_after),
            amount: tx.amount,
            currency: tx.currency.to_string(),
            description: tx.description.clone(),
            metadata: EventMetadata {
                processed_by: tx.processed_by.clone(),
                source: tx.source.clone(),
                status: tx.status,
            },
        }
    }

    #[inline]
    pub fn status(&self) -> TransactionStatus {
        self.metadata.status
    }
}

/// A transfer that was rejected after both accounts were resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTransactionEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub transaction_id: TransactionId,
    pub error_code: String,
    pub error_message: String,
    #[serde(default)]
    pub retry_count: u32,
    pub original_event: TransactionEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventEnvelope {
    Transaction(TransactionEvent),
    FailedTransaction(FailedTransactionEvent),
}

impl EventEnvelope {
    pub fn event_id(&self) -> &str {
        match self {
            EventEnvelope::Transaction(e) => &e.event_id,
            EventEnvelope::FailedTransaction(e) => &e.event_id,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        match self {
            EventEnvelope::Transaction(e) => e.transaction_id,
            EventEnvelope::FailedTransaction(e) => e.transaction_id,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ledger::{
        AccountStatus, AccountType, Currency, PROCESSED_BY, TRANSFER_SOURCE,
    };
    use std::str::FromStr;

    pub(crate) fn sample_event() -> TransactionEvent {
        let ils = Currency::new("ILS").unwrap();
        let a = Account {
            id: 1,
            customer_id: 501,
            account_number: "ACC-1001".into(),
            account_type: AccountType::Checking,
            balance: Decimal::new(1500, 0),
            currency: ils.clone(),
            status: AccountStatus::Active,
            version: 0,
        };
        let b = Account {
            id: 2,
            customer_id: 502,
            account_number: "ACC-2002".into(),
            account_type: AccountType::Business,
            balance: Decimal::new(8000, 0),
            currency: ils.clone(),
            status: AccountStatus::Active,
            version: 0,
        };
        let david = Customer::individual(501, "David Levi", "203948293");
        let techno =
            Customer::business(502, "TechnoCorp Ltd.", "514857392").with_vip_tier(VipTier::Platinum);
        let tx = Transaction {
            transaction_id: 77,
            from_account_id: 1,
            to_account_id: 2,
            from_account_number: "ACC-1001".into(),
            to_account_number: "ACC-2002".into(),
            from_balance_before: Decimal::from_str("1500.00").unwrap(),
            from_balance_after: Decimal::from_str("1200.00").unwrap(),
            to_balance_before: Decimal::from_str("8000.00").unwrap(),
            to_balance_after: Decimal::from_str("8300.00").unwrap(),
            amount: Decimal::from_str("300.00").unwrap(),
            currency: ils,
            description: Some("Monthly service payment".into()),
            status: TransactionStatus::Completed,
            processed_by: PROCESSED_BY.into(),
            source: TRANSFER_SOURCE.into(),
            error_message: None,
            timestamp: Utc::now(),
        };
        TransactionEvent::from_transaction("EVT-1".into(), &tx, (&a, &david), (&b, &techno))
    }

    #[test]
    fn test_payload_shape() {
        let envelope = EventEnvelope::Transaction(sample_event());
        let value: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(value["event_type"], "transaction");
        assert_eq!(value["transaction_id"], 77);
        assert_eq!(value["amount"], "300.00");
        assert_eq!(value["currency"], "ILS");
        assert_eq!(value["from_account"]["account_number"], "ACC-1001");
        assert_eq!(value["from_account"]["balance_after"], "1200.00");
        assert_eq!(value["from_account"]["customer"]["type"], "individual");
        assert_eq!(value["from_account"]["customer"]["personal_id"], "203948293");
        assert!(value["from_account"]["customer"].get("business_number").is_none());
        assert!(value["from_account"]["customer"].get("vip_tier").is_none());
        assert_eq!(value["to_account"]["customer"]["business_number"], "514857392");
        assert_eq!(value["to_account"]["customer"]["vip_tier"], "Platinum");
        assert_eq!(value["metadata"]["processed_by"], "bank-core-service");
        assert_eq!(value["metadata"]["source"], "api/v1/transfer");
        assert_eq!(value["metadata"]["status"], "completed");
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_failed_event_decodes() {
        let original = sample_event();
        let failed = EventEnvelope::FailedTransaction(FailedTransactionEvent {
            event_id: "EVT-2".into(),
            timestamp: Utc::now(),
            transaction_id: original.transaction_id,
            error_code: "INSUFFICIENT_FUNDS".into(),
            error_message: "Insufficient funds".into(),
            retry_count: 0,
            original_event: original,
        });
        let json = failed.to_json().unwrap();
        assert!(json.contains(r#""event_type":"failed_transaction""#));

        let decoded = EventEnvelope::from_slice(json.as_bytes()).unwrap();
        assert_eq!(decoded.event_id(), "EVT-2");
        assert_eq!(decoded.transaction_id(), 77);
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        assert!(EventEnvelope::from_slice(br#"{"event_type":"refund"}"#).is_err());
        assert!(EventEnvelope::from_slice(b"not json").is_err());
    }
}
