//! Clock and sleep abstractions.
//!
//! Every suspension in the engine (retry backoff, token-bucket waits) goes
//! through an injected [`Sleeper`], and every timestamp comparison in the
//! circuit breaker goes through a [`Clock`], so tests run deterministically
//! without real delays.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Clock abstraction so time-based policies can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds elapsed since some fixed origin.
    fn now_millis(&self) -> u64;
}

/// Monotonic clock backed by `Instant`; the origin resets on process restart.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Start at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Abstraction over sleeping so backoff and bucket waits can be observed or
/// skipped entirely under test.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    /// Suspend for `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test sleeper that returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

/// Test sleeper that records every requested delay without sleeping.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All delays requested so far, in order.
    pub fn recorded(&self) -> Vec<Duration> {
        self.calls.lock().expect("tracking sleeper poisoned").clone()
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls.lock().expect("tracking sleeper poisoned").push(duration);
        Box::pin(async {})
    }
}
