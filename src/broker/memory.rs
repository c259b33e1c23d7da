//! In-process broker
//!
//! Append-only log per topic plus committed offsets per (topic, group).
//! `set_available(false)` simulates an outage: every call fails and open
//! subscriptions are severed, so consumers must reconnect.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

use super::{BrokerError, Delivery, EventBroker, Offset, Subscription};

#[derive(Debug, Clone)]
struct StoredMessage {
    key: String,
    payload: Vec<u8>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<StoredMessage>>,
    offsets: HashMap<(String, String), Offset>,
}

struct Inner {
    state: Mutex<BrokerState>,
    available: AtomicBool,
    /// Bumped on every outage; subscriptions from an older epoch are dead
    epoch: AtomicU64,
    changed: Notify,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("broker is down".to_string()))
        }
    }
}

#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                available: AtomicBool::new(true),
                epoch: AtomicU64::new(0),
                changed: Notify::new(),
            }),
        }
    }

    /// Take the broker down or bring it back
    pub fn set_available(&self, available: bool) {
        let was = self.inner.available.swap(available, Ordering::SeqCst);
        if was && !available {
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        }
        if was != available {
            debug!(available = available, "Broker availability changed");
        }
        self.inner.changed.notify_waiters();
    }

    /// Every message on `topic`, in offset order
    pub fn messages(&self, topic: &str) -> Vec<Delivery> {
        let state = self.inner.state();
        state
            .topics
            .get(topic)
            .map(|log| {
                log.iter()
                    .enumerate()
                    .map(|(offset, m)| Delivery {
                        topic: topic.to_string(),
                        offset: offset as Offset,
                        key: m.key.clone(),
                        payload: m.payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBroker for InMemoryBroker {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Offset, BrokerError> {
        self.inner.check_available()?;
        let offset = {
            let mut state = self.inner.state();
            let log = state.topics.entry(topic.to_string()).or_default();
            log.push(StoredMessage {
                key: key.to_string(),
                payload: payload.to_vec(),
            });
            (log.len() - 1) as Offset
        };
        self.inner.changed.notify_waiters();
        Ok(offset)
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        from: Offset,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        self.inner.check_available()?;
        debug!(topic = topic, group = group, from = from, "Subscribed");
        Ok(Box::new(InMemorySubscription {
            inner: self.inner.clone(),
            topic: topic.to_string(),
            position: from,
            epoch: self.inner.epoch.load(Ordering::SeqCst),
        }))
    }

    async fn commit_offset(
        &self,
        topic: &str,
        group: &str,
        next: Offset,
    ) -> Result<(), BrokerError> {
        self.inner.check_available()?;
        self.inner
            .state()
            .offsets
            .insert((topic.to_string(), group.to_string()), next);
        Ok(())
    }

    async fn committed_offset(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Option<Offset>, BrokerError> {
        self.inner.check_available()?;
        Ok(self
            .inner
            .state()
            .offsets
            .get(&(topic.to_string(), group.to_string()))
            .copied())
    }

    async fn health_check(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }
}

struct InMemorySubscription {
    inner: Arc<Inner>,
    topic: String,
    position: Offset,
    epoch: u64,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self) -> Result<Delivery, BrokerError> {
        let inner = self.inner.clone();
        loop {
            let notified = inner.changed.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent publish is not missed
            notified.as_mut().enable();

            inner.check_available()?;
            if inner.epoch.load(Ordering::SeqCst) != self.epoch {
                return Err(BrokerError::Closed);
            }

            let message = {
                let state = inner.state();
                state
                    .topics
                    .get(&self.topic)
                    .and_then(|log| log.get(self.position as usize))
                    .cloned()
            };
            if let Some(message) = message {
                let delivery = Delivery {
                    topic: self.topic.clone(),
                    offset: self.position,
                    key: message.key,
                    payload: message.payload,
                };
                self.position += 1;
                return Ok(delivery);
            }

            notified.await;
        }
    }
}
