//! Engine configuration.
//!
//! [`EngineConfig`] is the declarative input to [`Engine::builder`]; every
//! field has a working default and [`EngineConfig::validate`] rejects values
//! the runtime cannot honor before any task is spawned.
//!
//! [`Engine::builder`]: crate::scheduler::Engine::builder

use crate::optimizer::Tuning;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Static configuration for an engine instance.
///
/// The concurrency, timeout, rate, and breaker-threshold fields seed the live
/// [`Tuning`] snapshot; the optimizer moves the live values but never above
/// the configured ceilings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Default target for requests that do not name one.
    pub base_url: String,
    /// Initial worker-slot count, also the additive-increase ceiling's seed.
    pub concurrency: usize,
    /// Initial per-attempt timeout.
    pub timeout: Duration,
    /// Initial per-target steady-state rate.
    pub requests_per_second: f64,
    /// Token-bucket capacity; defaults to `requests_per_second`.
    pub burst: Option<f64>,
    /// Retries after the first attempt; 3 means up to 4 attempts total.
    pub max_retries: u32,
    /// Consecutive failures before a target's circuit opens.
    pub failure_threshold: usize,
    /// How long an open circuit waits before admitting a trial request.
    pub reset_timeout: Duration,
    /// Optional credential injection applied before user middleware.
    pub auth: Option<AuthConfig>,
    /// Headers applied to every request unless the request sets its own.
    pub headers: BTreeMap<String, String>,
    /// Emit per-request completion events through the metrics sink.
    pub show_progress: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost".to_owned(),
            concurrency: 4,
            timeout: Duration::from_secs(30),
            requests_per_second: 10.0,
            burst: None,
            max_retries: 3,
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            auth: None,
            headers: BTreeMap::new(),
            show_progress: false,
        }
    }
}

impl EngineConfig {
    /// Reject values the runtime cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if !self.requests_per_second.is_finite() || self.requests_per_second <= 0.0 {
            return Err(ConfigError::InvalidRate(self.requests_per_second));
        }
        if let Some(burst) = self.burst {
            if !burst.is_finite() || burst < 1.0 {
                return Err(ConfigError::InvalidBurst(burst));
            }
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        if self.reset_timeout.is_zero() {
            return Err(ConfigError::ZeroResetTimeout);
        }
        Ok(())
    }

    /// Token-bucket capacity: the configured burst, else one second of rate.
    pub fn burst_capacity(&self) -> f64 {
        self.burst.unwrap_or_else(|| self.requests_per_second.max(1.0))
    }

    /// The live tuning snapshot this configuration seeds.
    pub fn initial_tuning(&self) -> Tuning {
        Tuning {
            concurrency: self.concurrency,
            timeout: self.timeout,
            requests_per_second: self.requests_per_second,
            failure_threshold: self.failure_threshold,
        }
    }
}

/// Credential injection scheme.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum AuthConfig {
    /// `Authorization: Bearer <token>`.
    Bearer {
        /// The bearer token.
        token: String,
    },
    /// Arbitrary header credential.
    Header {
        /// Header name.
        name: String,
        /// Header value.
        value: String,
    },
}

/// Rejected configuration values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Concurrency must admit at least one worker.
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,
    /// A zero timeout would fail every attempt immediately.
    #[error("timeout must be non-zero")]
    ZeroTimeout,
    /// The refill rate must be positive and finite.
    #[error("requests_per_second must be positive and finite, got {0}")]
    InvalidRate(f64),
    /// The bucket must hold at least one whole token.
    #[error("burst must be at least 1.0, got {0}")]
    InvalidBurst(f64),
    /// A zero threshold would open every circuit on the first attempt.
    #[error("failure_threshold must be at least 1")]
    ZeroFailureThreshold,
    /// A zero reset timeout would make OPEN indistinguishable from HALF_OPEN.
    #[error("reset_timeout must be non-zero")]
    ZeroResetTimeout,
}
