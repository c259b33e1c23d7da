//! Message broker seam
//!
//! Topics are append-only logs addressed by offset. Consumer groups commit
//! the offset of the next message they want, so a reconnecting consumer
//! resumes after its last acknowledged delivery.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::InMemoryBroker;

pub type Offset = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Broker request timed out")]
    Timeout,

    #[error("Subscription closed")]
    Closed,
}

/// One message handed to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub offset: Offset,
    pub key: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait EventBroker: Send + Sync {
    /// Append to `topic`, returning the assigned offset
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Offset, BrokerError>;

    /// Start reading `topic` at `from` on behalf of `group`
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        from: Offset,
    ) -> Result<Box<dyn Subscription>, BrokerError>;

    /// Record that `group` wants `next` as its next delivery on `topic`
    async fn commit_offset(&self, topic: &str, group: &str, next: Offset)
    -> Result<(), BrokerError>;

    async fn committed_offset(&self, topic: &str, group: &str)
    -> Result<Option<Offset>, BrokerError>;

    async fn health_check(&self) -> bool;
}

#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery. Fails once the connection is lost.
    async fn next(&mut self) -> Result<Delivery, BrokerError>;
}
