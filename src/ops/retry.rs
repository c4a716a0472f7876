//! Retry backoff for transient portal failures
//!
//! Exponential backoff with jitter: `base * 2^(attempt-1)`, capped, with
//! ±20% jitter so queued retries do not land in lockstep.

use std::time::Duration;

use rand::Rng;

/// Retry configuration
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum retries after the first attempt (0 = no retries)
    pub max_retries: u32,
    /// Base delay in milliseconds
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
        }
    }
}

impl RetryPolicy {
    /// Total attempts an item may consume.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        calculate_backoff_with_jitter(attempt, self.base_delay_ms, self.max_delay_ms)
    }
}

/// Calculate delay with exponential backoff and jitter
pub fn calculate_backoff_with_jitter(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let base_delay = base_ms.saturating_mul(2u64.pow(attempt.saturating_sub(1).min(5)));
    let capped_delay = base_delay.min(max_ms);

    // ±20% jitter
    let jitter_range = capped_delay / 5;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range * 2) as i64 - jitter_range as i64
    } else {
        0
    };

    Duration::from_millis((capped_delay as i64 + jitter).max(0) as u64)
}
