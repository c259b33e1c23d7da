//! Snowflake transaction ids
//!
//! Layout: millis since 2024-01-01 (40 bits) | machine_id (8 bits) | sequence (15 bits).
//! Ids are strictly increasing per generator, even if the wall clock steps back.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::ledger::TransactionId;

/// 2024-01-01T00:00:00Z in unix millis
const EPOCH_MS: u64 = 1_704_067_200_000;
const SEQUENCE_BITS: u32 = 15;
const MACHINE_BITS: u32 = 8;
const SEQUENCE_MASK: u32 = (1 << SEQUENCE_BITS) - 1;

struct SnowflakeState {
    sequence: u32,
    last_timestamp: u64,
}

pub struct TransactionIdGenerator {
    machine_id: u8,
    state: Mutex<SnowflakeState>,
}

impl TransactionIdGenerator {
    pub fn new(machine_id: u8) -> Self {
        Self {
            machine_id,
            state: Mutex::new(SnowflakeState {
                sequence: 0,
                last_timestamp: 0,
            }),
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    pub fn next_id(&self) -> TransactionId {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let now = Self::now_ms().saturating_sub(EPOCH_MS);
        // Never go backwards: reuse the last timestamp while the clock lags
        let timestamp = now.max(state.last_timestamp);

        if timestamp == state.last_timestamp {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted for this millisecond, borrow the next one
                state.last_timestamp += 1;
            }
        } else {
            state.sequence = 0;
            state.last_timestamp = timestamp;
        }

        let id = (state.last_timestamp << (MACHINE_BITS + SEQUENCE_BITS))
            | ((self.machine_id as u64) << SEQUENCE_BITS)
            | state.sequence as u64;
        id as TransactionId
    }
}
