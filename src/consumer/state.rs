//! Consumer connection state machine
//!
//! ```text
//!                 ┌──────── ReconnectFailed (backoff) ───────┐
//!                 ▼                                          │
//! Disconnected ─▶ Reconnecting ──────────────────────────────┘
//!      ▲               │
//!      │           Subscribed
//!      │               ▼
//!      └─ ConnectionLost ─ Connected
//! ```
//!
//! There is no terminal state: a consumer reconnects forever. The machine
//! starts in `Disconnected` so the first connection goes through the same
//! path as every reconnection.
//!
//! The reconnect backoff only resets once a delivery settles. A connection
//! that is lost before settling anything counts as a failed attempt, so a
//! broker that accepts subscriptions and drops them at once is retried at
//! the backoff rate.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::config::BackoffConfig;
use crate::outbox::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Network error or broker unavailable while connected
    ConnectionLost,
    ReconnectStarted,
    ReconnectFailed,
    /// Subscription re-established at the last acknowledged offset
    Subscribed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid connection transition: {event:?} in state {from}")]
pub struct TransitionError {
    pub from: ConnectionState,
    pub event: ConnectionEvent,
}

#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    backoff: Backoff,
    /// A delivery settled since the last `Subscribed`
    productive: bool,
}

impl ConnectionStateMachine {
    pub fn new(reconnect: BackoffConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff: Backoff::new(reconnect),
            productive: false,
        }
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Failed or unproductive connection attempts since a delivery last settled
    pub fn reconnect_attempts(&self) -> u32 {
        self.backoff.attempt()
    }

    /// Apply `event`. Returns the new state, or an error (state unchanged)
    /// if the event is not valid in the current state.
    pub fn apply(&mut self, event: ConnectionEvent) -> Result<ConnectionState, TransitionError> {
        use ConnectionEvent::*;
        use ConnectionState::*;

        let next = match (self.state, event) {
            (Connected, ConnectionLost) => Disconnected,
            (Disconnected, ReconnectStarted) => Reconnecting,
            (Reconnecting, ReconnectFailed) => Reconnecting,
            (Reconnecting, Subscribed) => {
                self.productive = false;
                Connected
            }
            (from, event) => return Err(TransitionError { from, event }),
        };
        self.state = next;
        Ok(next)
    }

    /// Record a failed reconnect and return how long to wait before the next
    pub fn reconnect_failed(&mut self) -> Result<Duration, TransitionError> {
        self.apply(ConnectionEvent::ReconnectFailed)?;
        Ok(self.backoff.next_delay())
    }

    /// A delivery on the current connection was acknowledged
    pub fn delivery_settled(&mut self) {
        if self.state == ConnectionState::Connected {
            self.productive = true;
            self.backoff.reset();
        }
    }

    /// Record a lost connection and return how long to wait before
    /// reconnecting. Zero if the connection settled at least one delivery.
    pub fn connection_lost(&mut self) -> Result<Duration, TransitionError> {
        self.apply(ConnectionEvent::ConnectionLost)?;
        if self.productive {
            Ok(Duration::ZERO)
        } else {
            Ok(self.backoff.next_delay())
        }
    }
}
