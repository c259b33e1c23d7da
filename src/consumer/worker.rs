//! Event consumer run loop
//!
//! Each delivery is handled with bounded retries, then either acknowledged
//! or handed to the dead-letter sink and acknowledged. The offset is only
//! committed after one of the two succeeded, so a lost connection replays
//! from the first delivery that was not settled.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::dead_letter::{DeadLetter, DeadLetterSink};
use super::processor::{EventHandler, HandleOutcome};
use super::state::{ConnectionEvent, ConnectionState, ConnectionStateMachine};
use crate::broker::{BrokerError, Delivery, EventBroker, Subscription};
use crate::config::{BackoffConfig, ConsumerConfig};
use crate::signal::Signal;

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub group_id: String,
    pub topic: String,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub reconnect: BackoffConfig,
}

impl ConsumerSettings {
    pub fn from_config(config: &ConsumerConfig, topic: &str) -> Self {
        Self {
            group_id: config.group_id.clone(),
            topic: topic.to_string(),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            reconnect: config.reconnect.clone(),
        }
    }
}

/// Counters shared with the caller while the consumer runs
#[derive(Debug, Default)]
pub struct ConsumerStats {
    processed: AtomicU64,
    duplicates: AtomicU64,
    dead_lettered: AtomicU64,
    retries: AtomicU64,
    reconnects: AtomicU64,
}

impl ConsumerStats {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Successful subscriptions after the first one
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

/// Why the connected phase ended
enum Interrupted {
    Shutdown,
    Lost(String),
}

pub struct EventConsumer {
    broker: Arc<dyn EventBroker>,
    handler: Arc<dyn EventHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    settings: ConsumerSettings,
    stats: Arc<ConsumerStats>,
    state_tx: watch::Sender<ConnectionState>,
}

impl EventConsumer {
    pub fn new(
        broker: Arc<dyn EventBroker>,
        handler: Arc<dyn EventHandler>,
        dead_letters: Arc<dyn DeadLetterSink>,
        settings: ConsumerSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            broker,
            handler,
            dead_letters,
            settings,
            stats: Arc::new(ConsumerStats::default()),
            state_tx,
        }
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    /// Observe connection state changes
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Run until `shutdown` fires. Never gives up on the broker.
    pub async fn run(self, shutdown: Signal) {
        info!(
            topic = %self.settings.topic,
            group = %self.settings.group_id,
            max_retries = self.settings.max_retries,
            "Starting event consumer"
        );

        let mut machine = ConnectionStateMachine::new(self.settings.reconnect.clone());
        let mut subscription: Option<Box<dyn Subscription>> = None;
        let mut subscribed_once = false;

        while !shutdown.is_triggered() {
            match machine.state() {
                ConnectionState::Disconnected => {
                    self.transition(&mut machine, ConnectionEvent::ReconnectStarted);
                }
                ConnectionState::Reconnecting => match self.subscribe().await {
                    Ok(sub) => {
                        subscription = Some(sub);
                        if subscribed_once {
                            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                            info!(
                                topic = %self.settings.topic,
                                attempts = machine.reconnect_attempts(),
                                "Consumer reconnected"
                            );
                        }
                        subscribed_once = true;
                        self.transition(&mut machine, ConnectionEvent::Subscribed);
                    }
                    Err(e) => {
                        let delay = match machine.reconnect_failed() {
                            Ok(delay) => delay,
                            Err(e) => {
                                error!(error = %e, "Connection state machine rejected event");
                                Duration::from_millis(self.settings.reconnect.max_ms)
                            }
                        };
                        warn!(
                            topic = %self.settings.topic,
                            attempt = machine.reconnect_attempts(),
                            delay_ms = delay.as_millis() as u64,
                            "Subscribe failed, retrying: {}", e
                        );
                        tokio::select! {
                            _ = shutdown.triggered() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                },
                ConnectionState::Connected => {
                    let reason = match subscription.as_mut() {
                        Some(sub) => match self.consume(sub.as_mut(), &mut machine, &shutdown).await {
                            Interrupted::Shutdown => break,
                            Interrupted::Lost(reason) => reason,
                        },
                        None => "no active subscription".to_string(),
                    };
                    subscription = None;
                    let delay = match machine.connection_lost() {
                        Ok(delay) => delay,
                        Err(e) => {
                            error!(error = %e, "Connection state machine rejected event");
                            Duration::from_millis(self.settings.reconnect.max_ms)
                        }
                    };
                    self.state_tx.send_replace(machine.state());
                    warn!(
                        topic = %self.settings.topic,
                        delay_ms = delay.as_millis() as u64,
                        "Consumer connection lost: {}", reason
                    );
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = shutdown.triggered() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        info!(topic = %self.settings.topic, "Event consumer stopped");
    }

    fn transition(&self, machine: &mut ConnectionStateMachine, event: ConnectionEvent) {
        match machine.apply(event) {
            Ok(state) => {
                debug!(topic = %self.settings.topic, state = %state, "Consumer state changed");
                self.state_tx.send_replace(state);
            }
            Err(e) => error!(error = %e, "Connection state machine rejected event"),
        }
    }

    /// Subscribe at the group's last acknowledged offset
    async fn subscribe(&self) -> Result<Box<dyn Subscription>, BrokerError> {
        let from = self
            .broker
            .committed_offset(&self.settings.topic, &self.settings.group_id)
            .await?
            .unwrap_or(0);
        let sub = self
            .broker
            .subscribe(&self.settings.topic, &self.settings.group_id, from)
            .await?;
        info!(topic = %self.settings.topic, from = from, "Consumer subscribed");
        Ok(sub)
    }

    async fn consume(
        &self,
        sub: &mut dyn Subscription,
        machine: &mut ConnectionStateMachine,
        shutdown: &Signal,
    ) -> Interrupted {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.triggered() => return Interrupted::Shutdown,
                next = sub.next() => match next {
                    Ok(delivery) => delivery,
                    Err(e) => return Interrupted::Lost(e.to_string()),
                },
            };

            let Some(settled) = self.settle(&delivery, shutdown).await else {
                return Interrupted::Shutdown;
            };
            if let Err(reason) = settled {
                return Interrupted::Lost(reason);
            }

            if let Err(e) = self
                .broker
                .commit_offset(
                    &self.settings.topic,
                    &self.settings.group_id,
                    delivery.offset + 1,
                )
                .await
            {
                return Interrupted::Lost(format!("offset commit failed: {e}"));
            }
            machine.delivery_settled();
        }
    }

    /// Handle with retries, dead-lettering what cannot be applied.
    /// `None` means shutdown interrupted a retry wait; `Err` means the
    /// dead-letter sink is unreachable and the delivery must be replayed.
    async fn settle(&self, delivery: &Delivery, shutdown: &Signal) -> Option<Result<(), String>> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match self.handler.handle(delivery).await {
                Ok(HandleOutcome::Applied) => {
                    self.stats.processed.fetch_add(1, Ordering::Relaxed);
                    return Some(Ok(()));
                }
                Ok(HandleOutcome::Duplicate) => {
                    self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                    return Some(Ok(()));
                }
                Err(e) => e,
            };

            if err.is_permanent() || attempt > self.settings.max_retries {
                return Some(self.dead_letter(delivery, err.to_string(), attempt).await);
            }

            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            let delay = self.settings.retry_backoff * attempt;
            warn!(
                offset = delivery.offset,
                key = %delivery.key,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "Event processing failed, retrying: {}", err
            );
            tokio::select! {
                _ = shutdown.triggered() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: String,
        attempts: u32,
    ) -> Result<(), String> {
        error!(
            topic = %delivery.topic,
            offset = delivery.offset,
            key = %delivery.key,
            attempts = attempts,
            "Event dead-lettered: {}", reason
        );
        self.dead_letters
            .send(DeadLetter::new(delivery, reason, attempts))
            .await
            .map_err(|e| e.to_string())?;
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::consumer::dead_letter::InMemoryDeadLetterSink;
    use crate::consumer::notifier::InMemoryNotifier;
    use crate::consumer::processor::TransactionProcessor;
    use crate::consumer::reporting::InMemoryReportingStore;
    use crate::outbox::EventEnvelope;
    use crate::outbox::event::tests::sample_event;
    use rust_decimal::Decimal;

    const TOPIC: &str = "completedTransactions";

    /// Accepts every subscription, then drops it on the first read
    struct DroppingBroker {
        inner: InMemoryBroker,
        subscribes: Arc<AtomicU64>,
    }

    struct DroppedSubscription;

    #[async_trait::async_trait]
    impl Subscription for DroppedSubscription {
        async fn next(&mut self) -> Result<Delivery, BrokerError> {
            Err(BrokerError::Unavailable("connection reset".into()))
        }
    }

    #[async_trait::async_trait]
    impl EventBroker for DroppingBroker {
        async fn publish(
            &self,
            topic: &str,
            key: &str,
            payload: &[u8],
        ) -> Result<u64, BrokerError> {
            self.inner.publish(topic, key, payload).await
        }

        async fn subscribe(
            &self,
            _topic: &str,
            _group: &str,
            _from: u64,
        ) -> Result<Box<dyn Subscription>, BrokerError> {
            self.subscribes.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(DroppedSubscription))
        }

        async fn commit_offset(
            &self,
            topic: &str,
            group: &str,
            next: u64,
        ) -> Result<(), BrokerError> {
            self.inner.commit_offset(topic, group, next).await
        }

        async fn committed_offset(
            &self,
            topic: &str,
            group: &str,
        ) -> Result<Option<u64>, BrokerError> {
            self.inner.committed_offset(topic, group).await
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    struct Fixture {
        broker: InMemoryBroker,
        reporting: Arc<InMemoryReportingStore>,
        notifier: Arc<InMemoryNotifier>,
        dead_letters: Arc<InMemoryDeadLetterSink>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                broker: InMemoryBroker::new(),
                reporting: Arc::new(InMemoryReportingStore::new()),
                notifier: Arc::new(InMemoryNotifier::new()),
                dead_letters: Arc::new(InMemoryDeadLetterSink::new()),
            }
        }

        fn consumer(&self, max_retries: u32) -> EventConsumer {
            let handler = TransactionProcessor::new(
                self.reporting.clone(),
                self.notifier.clone(),
                Decimal::new(10_000, 0),
            );
            EventConsumer::new(
                Arc::new(self.broker.clone()),
                Arc::new(handler),
                self.dead_letters.clone(),
                ConsumerSettings {
                    group_id: "test-group".into(),
                    topic: TOPIC.into(),
                    max_retries,
                    retry_backoff: Duration::from_millis(5),
                    reconnect: BackoffConfig {
                        initial_ms: 10,
                        max_ms: 50,
                        multiplier: 2.0,
                        jitter: 0.0,
                    },
                },
            )
        }

        async fn publish_event(&self, transaction_id: i64) {
            let mut event = sample_event();
            event.transaction_id = transaction_id;
            event.event_id = format!("EVT-{transaction_id}");
            let json = EventEnvelope::Transaction(event).to_json().unwrap();
            self.broker
                .publish(TOPIC, &transaction_id.to_string(), json.as_bytes())
                .await
                .unwrap();
        }

        async fn committed(&self) -> Option<u64> {
            self.broker
                .committed_offset(TOPIC, "test-group")
                .await
                .unwrap()
        }
    }

    async fn wait_until<F: Fn() -> bool>(f: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !f() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_processes_and_commits_offsets() {
        let fx = Fixture::new();
        fx.publish_event(1).await;
        fx.publish_event(2).await;

        let consumer = fx.consumer(3);
        let stats = consumer.stats();
        let shutdown = Signal::new();
        let handle = tokio::spawn(consumer.run(shutdown.clone()));

        wait_until(|| stats.processed() == 2).await;
        shutdown.trigger();
        handle.await.unwrap();

        assert_eq!(fx.committed().await, Some(2));
        assert_eq!(fx.reporting.snapshot().transactions.len(), 2);
        assert_eq!(fx.notifier.sent().len(), 4);
    }

    #[tokio::test]
    async fn test_replayed_delivery_is_duplicate() {
        let fx = Fixture::new();
        fx.publish_event(1).await;
        fx.publish_event(1).await;

        let consumer = fx.consumer(3);
        let stats = consumer.stats();
        let shutdown = Signal::new();
        let handle = tokio::spawn(consumer.run(shutdown.clone()));

        wait_until(|| stats.processed() + stats.duplicates() == 2).await;
        shutdown.trigger();
        handle.await.unwrap();

        assert_eq!(stats.processed(), 1);
        assert_eq!(stats.duplicates(), 1);
        assert_eq!(fx.notifier.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_event_is_dead_lettered_and_stream_continues() {
        let fx = Fixture::new();
        fx.broker.publish(TOPIC, "bad", b"garbage").await.unwrap();
        fx.publish_event(7).await;

        let consumer = fx.consumer(3);
        let stats = consumer.stats();
        let shutdown = Signal::new();
        let handle = tokio::spawn(consumer.run(shutdown.clone()));

        wait_until(|| stats.processed() == 1).await;
        shutdown.trigger();
        handle.await.unwrap();

        let letters = fx.dead_letters.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].offset, 0);
        assert_eq!(letters[0].attempt_count, 1);
        assert_eq!(letters[0].payload, "garbage");
        assert_eq!(stats.retries(), 0);
        assert_eq!(fx.committed().await, Some(2));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let fx = Fixture::new();
        fx.reporting.fail_next(2);
        fx.publish_event(1).await;

        let consumer = fx.consumer(3);
        let stats = consumer.stats();
        let shutdown = Signal::new();
        let handle = tokio::spawn(consumer.run(shutdown.clone()));

        wait_until(|| stats.processed() == 1).await;
        shutdown.trigger();
        handle.await.unwrap();

        assert_eq!(stats.retries(), 2);
        assert!(fx.dead_letters.letters().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_go_to_dead_letter() {
        let fx = Fixture::new();
        fx.reporting.fail_next(3);
        fx.publish_event(1).await;
        fx.publish_event(2).await;

        let consumer = fx.consumer(2);
        let stats = consumer.stats();
        let shutdown = Signal::new();
        let handle = tokio::spawn(consumer.run(shutdown.clone()));

        wait_until(|| stats.processed() == 1 && stats.dead_lettered() == 1).await;
        shutdown.trigger();
        handle.await.unwrap();

        let letters = fx.dead_letters.letters();
        assert_eq!(letters[0].key, "1");
        assert_eq!(letters[0].attempt_count, 3);
        assert!(fx.reporting.snapshot().transactions.contains_key(&2));
        assert_eq!(fx.committed().await, Some(2));
    }

    #[tokio::test]
    async fn test_reconnects_after_outage_and_resumes_from_committed_offset() {
        let fx = Fixture::new();
        fx.publish_event(1).await;

        let consumer = fx.consumer(3);
        let stats = consumer.stats();
        let mut state = consumer.state();
        let shutdown = Signal::new();
        let handle = tokio::spawn(consumer.run(shutdown.clone()));

        wait_until(|| stats.processed() == 1).await;
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        fx.broker.set_available(false);
        state
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await
            .unwrap();
        // let a few subscribe attempts fail
        tokio::time::sleep(Duration::from_millis(40)).await;

        fx.broker.set_available(true);
        fx.publish_event(2).await;
        fx.publish_event(3).await;

        wait_until(|| stats.processed() == 3).await;
        assert_eq!(stats.reconnects(), 1);
        assert_eq!(stats.duplicates(), 0);
        assert_eq!(*state.borrow(), ConnectionState::Connected);

        shutdown.trigger();
        handle.await.unwrap();
        assert_eq!(fx.committed().await, Some(3));
    }

    #[tokio::test]
    async fn test_starts_while_broker_down() {
        let fx = Fixture::new();
        fx.broker.set_available(false);

        let consumer = fx.consumer(3);
        let stats = consumer.stats();
        let shutdown = Signal::new();
        let handle = tokio::spawn(consumer.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        fx.broker.set_available(true);
        fx.publish_event(5).await;

        wait_until(|| stats.processed() == 1).await;
        assert_eq!(stats.reconnects(), 0);
        shutdown.trigger();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_subscription_dropped_before_delivery_is_retried_with_backoff() {
        let fx = Fixture::new();
        let subscribes = Arc::new(AtomicU64::new(0));
        let broker = DroppingBroker {
            inner: fx.broker.clone(),
            subscribes: subscribes.clone(),
        };
        let consumer = EventConsumer::new(
            Arc::new(broker),
            Arc::new(TransactionProcessor::new(
                fx.reporting.clone(),
                fx.notifier.clone(),
                Decimal::new(10_000, 0),
            )),
            fx.dead_letters.clone(),
            ConsumerSettings {
                group_id: "test-group".into(),
                topic: TOPIC.into(),
                max_retries: 3,
                retry_backoff: Duration::from_millis(5),
                reconnect: BackoffConfig {
                    initial_ms: 20,
                    max_ms: 40,
                    multiplier: 2.0,
                    jitter: 0.0,
                },
            },
        );
        let shutdown = Signal::new();
        let handle = tokio::spawn(consumer.run(shutdown.clone()));

        // delays 20, 40, 40, ... allow about 6 subscriptions in 200ms
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.trigger();
        handle.await.unwrap();

        let attempts = subscribes.load(Ordering::Relaxed);
        assert!(attempts >= 2, "consumer stopped reconnecting: {attempts}");
        assert!(attempts <= 8, "reconnect loop did not back off: {attempts}");
    }
}
