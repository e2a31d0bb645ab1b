//! Retry policy: exponential backoff, full jitter, server-suggested delays.

use crate::error::RequestError;
use crate::time::{Sleeper, TokioSleeper};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(250);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Decides whether and how long to wait before re-attempting a failed
/// request. Only errors classified retryable by [`RequestError::is_retryable`]
/// are retried; everything else surfaces immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicy {
    /// Policy allowing `max_retries` retries after the first attempt.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Override the first backoff interval.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Override the backoff cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Inject a sleeper, for deterministic tests.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Retries allowed after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether attempt number `attempt` (zero-based) may be followed by
    /// another after failing with `error`.
    pub fn should_retry(&self, error: &RequestError, attempt: u32) -> bool {
        attempt < self.max_retries && error.is_retryable()
    }

    /// Delay before the retry following failed attempt `attempt`.
    ///
    /// An explicit server-suggested delay (429 Retry-After) wins, capped at
    /// the maximum. Otherwise the base delay doubles per attempt with full
    /// jitter, so concurrent retries against a struggling target spread out
    /// instead of stampeding.
    pub fn delay_for(&self, attempt: u32, error: &RequestError) -> Duration {
        if let Some(suggested) = error.suggested_delay() {
            return suggested.min(self.max_delay);
        }
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let millis = u64::try_from(exp.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::rng().random_range(0..=millis))
    }

    /// Sleep out the backoff for the retry following `attempt`.
    pub async fn backoff(&self, attempt: u32, error: &RequestError) {
        let delay = self.delay_for(attempt, error);
        if !delay.is_zero() {
            self.sleeper.sleep(delay).await;
        }
    }
}
