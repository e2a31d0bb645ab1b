//! Live tuning and the autonomous AIMD optimizer.
//!
//! [`TuningCell`] publishes the current [`Tuning`] snapshot through an
//! `ArcSwap`; readers on the hot path load it lock-free. The [`Optimizer`]
//! rewrites the snapshot on a fixed cycle: multiplicative decrease under
//! failure, additive increase under sustained health, capped by a
//! [`ResourceProbe`] so added concurrency never outruns the host.

use crate::metrics::{EngineEvent, MetricsSink, MetricsWindow};
use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};

/// The knobs the optimizer owns. Everything the hot path reads per attempt
/// comes from one immutable snapshot, so an attempt never sees a torn mix of
/// old and new values.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuning {
    /// Worker slots the dispatcher may fill.
    pub concurrency: usize,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Per-target token-bucket refill rate.
    pub requests_per_second: f64,
    /// Consecutive failures before a circuit opens.
    pub failure_threshold: usize,
}

/// Shared, atomically-swapped tuning snapshot.
#[derive(Debug, Clone)]
pub struct TuningCell {
    inner: Arc<ArcSwap<Tuning>>,
    changed: Arc<Notify>,
}

impl TuningCell {
    /// Cell holding `initial`.
    pub fn new(initial: Tuning) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
            changed: Arc::new(Notify::new()),
        }
    }

    /// The current snapshot.
    pub fn get(&self) -> Arc<Tuning> {
        self.inner.load_full()
    }

    /// Publish a new snapshot and wake anyone watching for changes.
    pub fn set(&self, tuning: Tuning) {
        self.inner.store(Arc::new(tuning));
        self.changed.notify_waiters();
    }

    /// Notifier fired on every publish; the dispatcher watches it so a
    /// raised concurrency limit takes effect without waiting for a slot.
    pub fn change_signal(&self) -> &Notify {
        &self.changed
    }
}

/// Probe failure.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("resource probe failed: {0}")]
pub struct ProbeError(pub String);

/// Reports how much concurrency the host can stand.
pub trait ResourceProbe: Send + Sync {
    /// Upper bound for the concurrency knob.
    fn concurrency_cap(&self) -> Result<usize, ProbeError>;
}

/// Probe backed by host CPU and memory readings.
pub struct SystemProbe {
    system: Mutex<sysinfo::System>,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self { system: Mutex::new(sysinfo::System::new()) }
    }
}

impl SystemProbe {
    /// Probe with fresh system handles.
    pub fn new() -> Self {
        Self::default()
    }
}

const MEMORY_PER_SLOT: u64 = 32 * 1024 * 1024;
const SLOTS_PER_CPU: usize = 8;
const HARD_CAP: usize = 512;

impl ResourceProbe for SystemProbe {
    fn concurrency_cap(&self) -> Result<usize, ProbeError> {
        let mut system = self.system.lock().expect("probe lock poisoned");
        system.refresh_cpu_all();
        system.refresh_memory();
        let cpus = system.cpus().len().max(1);
        let memory_slots = usize::try_from(system.available_memory() / MEMORY_PER_SLOT)
            .unwrap_or(usize::MAX)
            .max(1);
        Ok((cpus * SLOTS_PER_CPU).min(memory_slots).min(HARD_CAP))
    }
}

impl std::fmt::Debug for SystemProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemProbe").finish_non_exhaustive()
    }
}

/// Probe returning a fixed cap, for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub usize);

impl ResourceProbe for FixedProbe {
    fn concurrency_cap(&self) -> Result<usize, ProbeError> {
        Ok(self.0)
    }
}

/// Optimizer cycle parameters.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Wall time between adjustment cycles.
    pub interval: Duration,
    /// Success rate below which the optimizer backs off.
    pub low_watermark: f64,
    /// Success rate at or above which the optimizer grows.
    pub high_watermark: f64,
    /// Additive concurrency increase per healthy cycle.
    pub concurrency_step: usize,
    /// Timeout target as a multiple of observed p95.
    pub timeout_safety_factor: f64,
    /// Floor for the tuned timeout.
    pub min_timeout: Duration,
    /// Ceiling for the tuned timeout.
    pub max_timeout: Duration,
    /// Floor for the tuned rate.
    pub min_rate: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            low_watermark: 0.90,
            high_watermark: 0.99,
            concurrency_step: 1,
            timeout_safety_factor: 2.0,
            min_timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(120),
            min_rate: 0.5,
        }
    }
}

/// Autonomous AIMD control loop over the live tuning.
pub struct Optimizer {
    tuning: TuningCell,
    metrics: Arc<MetricsWindow>,
    probe: Arc<dyn ResourceProbe>,
    sink: Arc<dyn MetricsSink>,
    config: OptimizerConfig,
    baseline: Tuning,
}

impl Optimizer {
    /// Optimizer over `tuning`, reading `metrics` each cycle. `baseline` is
    /// the configured tuning; additive increase never pushes the breaker
    /// threshold or rate above it.
    pub fn new(
        tuning: TuningCell,
        metrics: Arc<MetricsWindow>,
        probe: Arc<dyn ResourceProbe>,
        sink: Arc<dyn MetricsSink>,
        config: OptimizerConfig,
    ) -> Self {
        let baseline = tuning.get().as_ref().clone();
        Self { tuning, metrics, probe, sink, config, baseline }
    }

    /// Run one adjustment cycle. Public so tests can step deterministically.
    pub fn adjust(&self) {
        let window = self.metrics.snapshot_and_reset();
        let Some(success_rate) = window.success_rate() else {
            // Idle window; nothing to learn from.
            return;
        };
        let cap = match self.probe.concurrency_cap() {
            Ok(cap) => cap,
            Err(err) => {
                tracing::warn!(%err, "skipping adjustment cycle");
                return;
            }
        };

        let current = self.tuning.get();
        let mut next = current.as_ref().clone();

        if success_rate < self.config.low_watermark {
            // Multiplicative decrease: shed load quickly while failing.
            next.concurrency = (next.concurrency / 2).max(1);
            next.failure_threshold = (next.failure_threshold / 2).max(1);
            next.requests_per_second =
                (next.requests_per_second / 2.0).max(self.config.min_rate);
        } else if success_rate >= self.config.high_watermark {
            // Additive increase: grow cautiously, never past the host cap,
            // and recover thresholds toward the configured baseline.
            if next.concurrency < cap {
                next.concurrency = (next.concurrency + self.config.concurrency_step).min(cap);
            }
            next.failure_threshold =
                (next.failure_threshold + 1).min(self.baseline.failure_threshold);
            next.requests_per_second = (next.requests_per_second * 1.25)
                .min(self.baseline.requests_per_second);
        }

        if let Some(p95) = window.p95 {
            let tracked = p95.mul_f64(self.config.timeout_safety_factor);
            next.timeout = tracked.clamp(self.config.min_timeout, self.config.max_timeout);
        }

        if next != *current {
            tracing::info!(
                success_rate,
                concurrency = next.concurrency,
                timeout = ?next.timeout,
                requests_per_second = next.requests_per_second,
                failure_threshold = next.failure_threshold,
                "tuning adjusted"
            );
            self.sink.record(&EngineEvent::TuningAdjusted {
                concurrency: next.concurrency,
                timeout: next.timeout,
                requests_per_second: next.requests_per_second,
            });
            self.tuning.set(next);
        }
    }

    /// Drive adjustment cycles until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so the first cycle
        // sees a full window.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.adjust(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Optimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Optimizer")
            .field("config", &self.config)
            .field("baseline", &self.baseline)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{FailureKind, NullSink};

    fn tuning() -> Tuning {
        Tuning {
            concurrency: 8,
            timeout: Duration::from_secs(30),
            requests_per_second: 20.0,
            failure_threshold: 5,
        }
    }

    fn optimizer(cell: &TuningCell, metrics: &Arc<MetricsWindow>, cap: usize) -> Optimizer {
        Optimizer::new(
            cell.clone(),
            Arc::clone(metrics),
            Arc::new(FixedProbe(cap)),
            Arc::new(NullSink),
            OptimizerConfig::default(),
        )
    }

    fn fill(metrics: &MetricsWindow, successes: u64, failures: u64) {
        for _ in 0..(successes + failures) {
            metrics.record_attempt();
        }
        for _ in 0..successes {
            metrics.record_success(Duration::from_millis(10));
        }
        for _ in 0..failures {
            metrics.record_failure(FailureKind::HttpStatus);
        }
    }

    #[test]
    fn backs_off_multiplicatively_under_failure() {
        let cell = TuningCell::new(tuning());
        let metrics = Arc::new(MetricsWindow::new());
        let optimizer = optimizer(&cell, &metrics, 64);

        fill(&metrics, 5, 5);
        optimizer.adjust();

        let next = cell.get();
        assert_eq!(next.concurrency, 4);
        assert_eq!(next.failure_threshold, 2);
        assert_eq!(next.requests_per_second, 10.0);
    }

    #[test]
    fn grows_additively_when_healthy() {
        let cell = TuningCell::new(tuning());
        let metrics = Arc::new(MetricsWindow::new());
        let optimizer = optimizer(&cell, &metrics, 64);

        fill(&metrics, 100, 0);
        optimizer.adjust();

        assert_eq!(cell.get().concurrency, 9);
    }

    #[test]
    fn growth_respects_the_resource_cap() {
        let cell = TuningCell::new(tuning());
        let metrics = Arc::new(MetricsWindow::new());
        let optimizer = optimizer(&cell, &metrics, 8);

        fill(&metrics, 100, 0);
        optimizer.adjust();

        // Already at the cap; concurrency holds.
        assert_eq!(cell.get().concurrency, 8);
    }

    #[test]
    fn recovery_never_exceeds_baseline_knobs() {
        let cell = TuningCell::new(tuning());
        let metrics = Arc::new(MetricsWindow::new());
        let optimizer = optimizer(&cell, &metrics, 64);

        // Crash down, then recover for many cycles.
        fill(&metrics, 0, 10);
        optimizer.adjust();
        for _ in 0..20 {
            fill(&metrics, 100, 0);
            optimizer.adjust();
        }

        let next = cell.get();
        assert_eq!(next.failure_threshold, 5);
        assert_eq!(next.requests_per_second, 20.0);
    }

    #[test]
    fn concurrency_floors_at_one() {
        let cell = TuningCell::new(tuning());
        let metrics = Arc::new(MetricsWindow::new());
        let optimizer = optimizer(&cell, &metrics, 64);

        for _ in 0..6 {
            fill(&metrics, 0, 10);
            optimizer.adjust();
        }

        let next = cell.get();
        assert_eq!(next.concurrency, 1);
        assert_eq!(next.failure_threshold, 1);
        assert_eq!(next.requests_per_second, 0.5);
    }

    #[test]
    fn timeout_tracks_p95() {
        let cell = TuningCell::new(tuning());
        let metrics = Arc::new(MetricsWindow::new());
        let optimizer = optimizer(&cell, &metrics, 64);

        for _ in 0..100 {
            metrics.record_attempt();
            metrics.record_success(Duration::from_millis(500));
        }
        optimizer.adjust();

        // 2 x p95, within histogram precision.
        let timeout = cell.get().timeout;
        assert!(timeout >= Duration::from_millis(990), "timeout was {timeout:?}");
        assert!(timeout <= Duration::from_millis(1010), "timeout was {timeout:?}");
    }

    #[test]
    fn timeout_respects_the_floor() {
        let cell = TuningCell::new(tuning());
        let metrics = Arc::new(MetricsWindow::new());
        let optimizer = optimizer(&cell, &metrics, 64);

        for _ in 0..10 {
            metrics.record_attempt();
            metrics.record_success(Duration::from_millis(1));
        }
        optimizer.adjust();

        assert_eq!(cell.get().timeout, Duration::from_secs(1));
    }

    #[test]
    fn empty_window_changes_nothing() {
        let cell = TuningCell::new(tuning());
        let metrics = Arc::new(MetricsWindow::new());
        let optimizer = optimizer(&cell, &metrics, 64);

        optimizer.adjust();
        assert_eq!(*cell.get(), tuning());
    }

    #[test]
    fn middling_success_rate_only_retunes_timeout() {
        let cell = TuningCell::new(tuning());
        let metrics = Arc::new(MetricsWindow::new());
        let optimizer = optimizer(&cell, &metrics, 64);

        // 95%: between the watermarks.
        fill(&metrics, 95, 5);
        optimizer.adjust();

        let next = cell.get();
        assert_eq!(next.concurrency, 8);
        assert_eq!(next.requests_per_second, 20.0);
    }

    #[test]
    fn fixed_probe_reports_its_cap() {
        assert_eq!(FixedProbe(17).concurrency_cap(), Ok(17));
    }
}
