//! Capped exponential backoff, used for relay redials and admission polling.

use rand::Rng;
use std::time::Duration;

/// Jitter strategy to apply to backoff delays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Jitter {
    /// Always return the capped exponential delay.
    None,
    /// Return a random delay in `[0, capped_delay]`.
    Full,
}

/// Exponential backoff calculator.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
    jitter: Jitter,
    attempt: u32,
}

impl ExponentialBackoff {
    /// `max_attempts` of 0 means unlimited attempts.
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts: (max_attempts > 0).then_some(max_attempts),
            jitter: Jitter::None,
            attempt: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    /// Next delay in the sequence, `None` once exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        // min(base * 2^attempt, max)
        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis();
        let multiplier = 1u128.checked_shl(self.attempt.min(63)).unwrap_or(u128::MAX);
        let capped_ms = base_ms.saturating_mul(multiplier).min(max_ms);
        let capped_ms = u64::try_from(capped_ms).unwrap_or(u64::MAX);

        let delay_ms = match self.jitter {
            Jitter::None => capped_ms,
            Jitter::Full => rand::rng().random_range(0..=capped_ms),
        };

        self.attempt = self.attempt.saturating_add(1);
        Some(Duration::from_millis(delay_ms))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempt >= max)
    }
}
