//! Dead-letter sink for deliveries that could not be processed

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

use crate::broker::{BrokerError, Delivery, EventBroker, Offset};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub topic: String,
    pub offset: Offset,
    pub key: String,
    /// Original payload, lossily decoded when it is not UTF-8
    pub payload: String,
    pub failure_reason: String,
    pub attempt_count: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(delivery: &Delivery, failure_reason: String, attempt_count: u32) -> Self {
        Self {
            topic: delivery.topic.clone(),
            offset: delivery.offset,
            key: delivery.key.clone(),
            payload: String::from_utf8_lossy(&delivery.payload).into_owned(),
            failure_reason,
            attempt_count,
            failed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum DeadLetterError {
    #[error("Dead letter publish failed: {0}")]
    Broker(#[from] BrokerError),

    #[error("Dead letter encoding failed: {0}")]
    Encode(String),
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, letter: DeadLetter) -> Result<(), DeadLetterError>;
}

#[derive(Default)]
pub struct InMemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn send(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(letter);
        Ok(())
    }
}

/// Publishes dead letters as JSON to a broker topic
pub struct BrokerDeadLetterSink {
    broker: Arc<dyn EventBroker>,
    topic: String,
}

impl BrokerDeadLetterSink {
    pub fn new(broker: Arc<dyn EventBroker>, topic: &str) -> Self {
        Self {
            broker,
            topic: topic.to_string(),
        }
    }
}

#[async_trait]
impl DeadLetterSink for BrokerDeadLetterSink {
    async fn send(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        let payload =
            serde_json::to_vec(&letter).map_err(|e| DeadLetterError::Encode(e.to_string()))?;
        self.broker
            .publish(&self.topic, &letter.key, &payload)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;

    #[tokio::test]
    async fn test_broker_sink_publishes_json() {
        let broker = InMemoryBroker::new();
        let sink = BrokerDeadLetterSink::new(Arc::new(broker.clone()), "deadLetterTransactions");
        let delivery = Delivery {
            topic: "completedTransactions".into(),
            offset: 4,
            key: "77".into(),
            payload: vec![0xff, b'x'],
        };
        sink.send(DeadLetter::new(&delivery, "malformed".into(), 1))
            .await
            .unwrap();

        let messages = broker.messages("deadLetterTransactions");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].key, "77");
        let letter: DeadLetter = serde_json::from_slice(&messages[0].payload).unwrap();
        assert_eq!(letter.offset, 4);
        assert_eq!(letter.failure_reason, "malformed");
        assert_eq!(letter.payload, "\u{fffd}x");
    }
}
