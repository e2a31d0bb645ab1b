//! Metrics: the rolling window the optimizer reads and the event sink
//! callers observe.
//!
//! Sinks receive [`EngineEvent`]s synchronously on the execution path, so
//! implementations must not block. The [`MetricsWindow`] accumulates counts
//! and a latency histogram between optimizer cycles; `snapshot_and_reset`
//! starts a fresh window.

use crate::context::{RequestId, Target};
use crate::error::{RequestError, TransportError};
use hdrhistogram::Histogram;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Coarse failure classification used in counters and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Attempt or transport deadline exceeded.
    Timeout,
    /// Connection-level failure.
    Connection,
    /// Non-success HTTP status.
    HttpStatus,
    /// Upstream 429.
    RateLimited,
    /// Declared schema violated.
    Validation,
    /// Circuit breaker rejection.
    CircuitOpen,
    /// Request deadline passed before an attempt could start.
    DeadlineExceeded,
    /// Response parser rejection.
    Parse,
    /// Cancelled or queue closed.
    Cancelled,
}

impl FailureKind {
    /// Classify an engine error.
    pub fn of(error: &RequestError) -> Self {
        match error {
            RequestError::Transport(TransportError::Timeout { .. }) => FailureKind::Timeout,
            RequestError::Transport(TransportError::Connection(_)) => FailureKind::Connection,
            RequestError::Transport(TransportError::HttpStatus(_)) => FailureKind::HttpStatus,
            RequestError::Transport(TransportError::RateLimited { .. }) => FailureKind::RateLimited,
            RequestError::Validation { .. } => FailureKind::Validation,
            RequestError::CircuitOpen { .. } => FailureKind::CircuitOpen,
            RequestError::DeadlineExceeded { .. } => FailureKind::DeadlineExceeded,
            RequestError::Parse(_) => FailureKind::Parse,
            RequestError::Cancelled | RequestError::QueueClosed => FailureKind::Cancelled,
        }
    }
}

/// Observable engine activity.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// An attempt is about to reach the transport.
    AttemptStarted {
        /// Target of the attempt.
        target: Target,
        /// Zero-based attempt number.
        attempt: u32,
    },
    /// An attempt succeeded.
    AttemptSucceeded {
        /// Target of the attempt.
        target: Target,
        /// Attempt wall time.
        duration: Duration,
    },
    /// An attempt failed.
    AttemptFailed {
        /// Target of the attempt.
        target: Target,
        /// Failure classification.
        kind: FailureKind,
        /// Attempt wall time.
        duration: Duration,
    },
    /// The rate limiter held an attempt past the hit threshold.
    RateLimitWait {
        /// Target whose bucket was short.
        target: Target,
        /// How long the attempt waited.
        waited: Duration,
    },
    /// A request reached a successful terminal outcome.
    RequestCompleted {
        /// Queue-issued id.
        id: RequestId,
        /// Attempts consumed.
        attempts: u32,
        /// Submission-to-completion wall time.
        elapsed: Duration,
    },
    /// A request reached a failed terminal outcome.
    RequestFailed {
        /// Queue-issued id.
        id: RequestId,
        /// Final failure classification.
        kind: FailureKind,
        /// Attempts consumed.
        attempts: u32,
        /// Submission-to-failure wall time.
        elapsed: Duration,
    },
    /// The optimizer published a new tuning snapshot.
    TuningAdjusted {
        /// New worker-slot count.
        concurrency: usize,
        /// New per-attempt timeout.
        timeout: Duration,
        /// New per-target rate.
        requests_per_second: f64,
    },
}

/// Receives engine events on the execution path. Must not block.
pub trait MetricsSink: Send + Sync {
    /// Observe one event.
    fn record(&self, event: &EngineEvent);
}

/// Sink that forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn record(&self, event: &EngineEvent) {
        match event {
            EngineEvent::AttemptFailed { target, kind, duration } => {
                tracing::warn!(target_name = %target, ?kind, ?duration, "attempt failed");
            }
            EngineEvent::RequestFailed { id, kind, attempts, elapsed } => {
                tracing::warn!(%id, ?kind, attempts, ?elapsed, "request failed");
            }
            EngineEvent::TuningAdjusted { concurrency, timeout, requests_per_second } => {
                tracing::info!(concurrency, ?timeout, requests_per_second, "tuning adjusted");
            }
            other => tracing::debug!(event = ?other, "engine event"),
        }
    }
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record(&self, _event: &EngineEvent) {}
}

/// Sink that buffers events for inspection in tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<EngineEvent>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far, in order.
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().expect("sink lock poisoned").clone()
    }
}

impl MetricsSink for MemorySink {
    fn record(&self, event: &EngineEvent) {
        self.events.lock().expect("sink lock poisoned").push(event.clone());
    }
}

struct WindowInner {
    attempts: u64,
    successes: u64,
    failures: HashMap<FailureKind, u64>,
    rate_limit_hits: u64,
    latencies: Histogram<u64>,
}

impl WindowInner {
    fn fresh() -> Self {
        Self {
            attempts: 0,
            successes: 0,
            failures: HashMap::new(),
            rate_limit_hits: 0,
            // Microsecond latencies, 3 significant figures.
            latencies: Histogram::new(3).expect("histogram construction"),
        }
    }
}

/// Accumulates attempt outcomes between optimizer adjustment cycles.
pub struct MetricsWindow {
    inner: Mutex<WindowInner>,
}

impl Default for MetricsWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsWindow {
    /// Empty window.
    pub fn new() -> Self {
        Self { inner: Mutex::new(WindowInner::fresh()) }
    }

    /// Count an attempt reaching the transport.
    pub fn record_attempt(&self) {
        self.inner.lock().expect("window lock poisoned").attempts += 1;
    }

    /// Count a successful attempt and its latency.
    pub fn record_success(&self, latency: Duration) {
        let mut inner = self.inner.lock().expect("window lock poisoned");
        inner.successes += 1;
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        // Out-of-range samples are dropped rather than failing the attempt.
        let _ = inner.latencies.record(micros.max(1));
    }

    /// Count a failed attempt.
    pub fn record_failure(&self, kind: FailureKind) {
        let mut inner = self.inner.lock().expect("window lock poisoned");
        *inner.failures.entry(kind).or_insert(0) += 1;
    }

    /// Count a rate-limit hit.
    pub fn record_rate_limit_hit(&self) {
        self.inner.lock().expect("window lock poisoned").rate_limit_hits += 1;
    }

    /// Read the current window without resetting it.
    pub fn snapshot(&self) -> MetricsSnapshot {
        Self::to_snapshot(&self.inner.lock().expect("window lock poisoned"))
    }

    /// Read the current window and start a fresh one.
    pub fn snapshot_and_reset(&self) -> MetricsSnapshot {
        let mut inner = self.inner.lock().expect("window lock poisoned");
        let snapshot = Self::to_snapshot(&inner);
        *inner = WindowInner::fresh();
        snapshot
    }

    fn to_snapshot(inner: &WindowInner) -> MetricsSnapshot {
        let failures: u64 = inner.failures.values().sum();
        let p95 = (inner.latencies.len() > 0).then(|| {
            Duration::from_micros(inner.latencies.value_at_quantile(0.95))
        });
        MetricsSnapshot {
            attempts: inner.attempts,
            successes: inner.successes,
            failures,
            failures_by_kind: inner.failures.clone(),
            rate_limit_hits: inner.rate_limit_hits,
            p95,
        }
    }
}

impl std::fmt::Debug for MetricsWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsWindow").finish_non_exhaustive()
    }
}

/// Point-in-time view of a metrics window.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    /// Attempts that reached the transport.
    pub attempts: u64,
    /// Successful attempts.
    pub successes: u64,
    /// Failed attempts, all kinds.
    pub failures: u64,
    /// Failed attempts by kind.
    pub failures_by_kind: HashMap<FailureKind, u64>,
    /// Waits past the rate-limit hit threshold.
    pub rate_limit_hits: u64,
    /// 95th-percentile attempt latency, when any attempt succeeded.
    pub p95: Option<Duration>,
}

impl MetricsSnapshot {
    /// Successes over settled outcomes, `None` for an empty window.
    pub fn success_rate(&self) -> Option<f64> {
        let settled = self.successes + self.failures;
        (settled > 0).then(|| self.successes as f64 / settled as f64)
    }
}
