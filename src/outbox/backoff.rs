//! Exponential backoff with jitter

use rand::Rng;
use std::time::Duration;

use crate::config::BackoffConfig;

/// Delay sequence: `initial * multiplier^attempt`, capped at `max`, then
/// spread by +/- `jitter` of itself. Never gives up.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Consecutive failures since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, without jitter
    pub fn base_delay(&self) -> Duration {
        let initial = self.config.initial_ms as f64;
        let max = self.config.max_ms as f64;
        let exponent = self.attempt.min(64) as i32;
        let delay = (initial * self.config.multiplier.max(1.0).powi(exponent)).min(max);
        Duration::from_millis(delay as u64)
    }

    /// Delay before the next attempt; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: f64) -> BackoffConfig {
        BackoffConfig {
            initial_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_exponential_growth_and_cap() {
        let mut backoff = Backoff::new(config(0.0));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(config(0.0));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_bounds() {
        let mut backoff = Backoff::new(config(0.2));
        for _ in 0..1_000 {
            backoff.reset();
            let delay = backoff.next_delay().as_millis();
            assert!((80..=120).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_never_overflows() {
        let mut backoff = Backoff::new(config(0.0));
        for _ in 0..10_000 {
            assert!(backoff.next_delay() <= Duration::from_millis(1_000));
        }
    }
}
