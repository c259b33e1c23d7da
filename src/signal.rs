//! One-shot broadcast flag used for shutdown of background workers and for
//! caller-side cancellation of transfers.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable trigger. Once triggered it stays triggered.
#[derive(Debug, Clone)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
}

impl Signal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// A signal that is never triggered by anyone else
    pub fn never() -> Self {
        Self::new()
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `trigger` has been called (immediately if it already was)
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        // Sender lives as long as self, so wait_for cannot observe a closed channel
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}
