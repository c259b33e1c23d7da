//! Outbox Publisher
//!
//! Single reader of the outbox. Each row moves through
//!
//! ```text
//! STAGED (published_at NULL) ─▶ SENT (broker acked) ─▶ STAMPED (published_at set)
//! ```
//!
//! A crash between SENT and STAMPED re-sends the row on restart, which
//! downstream deduplication absorbs. Broker failures are retried forever
//! with backoff; they never reach the transfer path.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use crate::broker::{BrokerError, EventBroker};
use crate::config::OutboxConfig;
use crate::ledger::{LedgerStore, StoreError};
use crate::signal::Signal;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Broker publish failed: {0}")]
    Broker(#[from] BrokerError),

    #[error("Outbox access failed: {0}")]
    Store(#[from] StoreError),
}

/// Result of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub fetched: usize,
    pub published: usize,
}

pub struct OutboxPublisher {
    store: Arc<dyn LedgerStore>,
    broker: Arc<dyn EventBroker>,
    config: OutboxConfig,
    notify: Arc<Notify>,
}

impl OutboxPublisher {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        broker: Arc<dyn EventBroker>,
        config: OutboxConfig,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            broker,
            config,
            notify,
        }
    }

    /// Publish one batch in creation order. Stops at the first broker
    /// failure so later rows never overtake an earlier one.
    pub async fn drain_once(&self) -> Result<DrainStats, PublishError> {
        let batch = self.store.fetch_unpublished(self.config.batch_size).await?;
        let mut stats = DrainStats {
            fetched: batch.len(),
            published: 0,
        };

        for event in &batch {
            if let Err(e) = self
                .broker
                .publish(&event.topic, &event.key, event.payload.as_bytes())
                .await
            {
                if stats.published > 0 {
                    info!(
                        published = stats.published,
                        remaining = stats.fetched - stats.published,
                        "Partial outbox batch published"
                    );
                }
                return Err(e.into());
            }

            if !self.store.mark_published(&event.event_id, Utc::now()).await? {
                debug!(event_id = %event.event_id, "Outbox row was already stamped");
            }
            stats.published += 1;
            debug!(
                event_id = %event.event_id,
                transaction_id = event.transaction_id,
                topic = %event.topic,
                seq = event.seq,
                "Outbox event published"
            );
        }

        Ok(stats)
    }

    /// Move stamped rows past the retention window to the archive
    pub async fn archive_once(&self) -> Result<u64, StoreError> {
        let Some(retention) = self.config.archive_retention_secs else {
            return Ok(0);
        };
        let older_than = Utc::now() - chrono::Duration::seconds(retention as i64);
        let archived = self.store.archive_published(older_than).await?;
        if archived > 0 {
            info!(archived = archived, "Archived published outbox rows");
        }
        Ok(archived)
    }

    /// Run until `shutdown` fires
    pub async fn run(self, shutdown: Signal) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval_ms,
            "Starting outbox publisher"
        );

        let mut backoff = Backoff::new(self.config.backoff.clone());
        let archive_interval = Duration::from_secs(self.config.archive_interval_secs);
        let mut last_archive = Instant::now();

        while !shutdown.is_triggered() {
            match self.drain_once().await {
                Ok(stats) => {
                    if backoff.attempt() > 0 {
                        info!(
                            failed_attempts = backoff.attempt(),
                            "Outbox publishing recovered"
                        );
                        backoff.reset();
                    }

                    // A full batch means more rows are probably waiting
                    if stats.fetched >= self.config.batch_size {
                        continue;
                    }

                    if last_archive.elapsed() >= archive_interval {
                        if let Err(e) = self.archive_once().await {
                            error!(error = %e, "Outbox archival failed");
                        }
                        last_archive = Instant::now();
                    }

                    tokio::select! {
                        _ = shutdown.triggered() => break,
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    }
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "Outbox publish failed, backing off: {}", e
                    );
                    tokio::select! {
                        _ = shutdown.triggered() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!("Outbox publisher stopped");
    }
}
