//! Per-target circuit breakers.
//!
//! Each target owns an independent CLOSED/OPEN/HALF_OPEN machine. The
//! failure threshold is read live from the tuning snapshot at each recorded
//! failure; the reset timeout is fixed at construction. Half-open admits
//! exactly one trial at a time.

use crate::context::Target;
use crate::optimizer::TuningCell;
use crate::time::Clock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Breaker state for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow; consecutive failures are being counted.
    Closed,
    /// Requests are rejected until the reset timeout elapses.
    Open,
    /// One trial request is probing the target.
    HalfOpen,
}

/// Outcome of asking the breaker to admit an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed circuit; proceed normally.
    Proceed,
    /// Half-open trial slot granted; the caller must report the outcome.
    Trial,
    /// Circuit open; the transport must not be invoked.
    Reject {
        /// Consecutive failures recorded when the circuit opened.
        failure_count: usize,
    },
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: usize,
    opened_at_millis: u64,
    trial_in_flight: bool,
}

/// Circuit breaker for a single target.
#[derive(Debug)]
pub struct CircuitBreaker {
    target: Target,
    inner: Mutex<BreakerInner>,
    tuning: TuningCell,
    reset_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Closed breaker for `target`.
    pub fn new(
        target: Target,
        tuning: TuningCell,
        reset_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            target,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at_millis: 0,
                trial_in_flight: false,
            }),
            tuning,
            reset_timeout,
            clock,
        }
    }

    /// Ask to admit one attempt.
    pub fn try_admit(&self) -> Admission {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => Admission::Proceed,
            CircuitState::Open => {
                let elapsed = self.clock.now_millis().saturating_sub(inner.opened_at_millis);
                if elapsed >= millis(self.reset_timeout) {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!(target_name = %self.target, "circuit half-open, admitting trial");
                    Admission::Trial
                } else {
                    Admission::Reject { failure_count: inner.consecutive_failures }
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Admission::Reject { failure_count: inner.consecutive_failures }
                } else {
                    inner.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    /// Record a successful attempt. Closes a half-open circuit and clears
    /// the failure count.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.trial_in_flight = false;
                tracing::info!(target_name = %self.target, "circuit closed after successful trial");
            }
            CircuitState::Closed => inner.consecutive_failures = 0,
            // A straggler from before the circuit opened; the open state
            // already owns the timeline.
            CircuitState::Open => {}
        }
    }

    /// Record a failed attempt. A half-open trial failure reopens the
    /// circuit and restarts the reset timer; in closed state the failure
    /// count advances and opens the circuit at the live threshold.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at_millis = self.clock.now_millis();
                inner.trial_in_flight = false;
                inner.consecutive_failures += 1;
                tracing::warn!(
                    target_name = %self.target,
                    failures = inner.consecutive_failures,
                    "trial failed, circuit reopened"
                );
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                let threshold = self.tuning.get().failure_threshold;
                if inner.consecutive_failures >= threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at_millis = self.clock.now_millis();
                    tracing::warn!(
                        target_name = %self.target,
                        failures = inner.consecutive_failures,
                        threshold,
                        "failure threshold reached, circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record an outcome that says nothing about target health (validation
    /// failures). Releases a held trial slot without moving the state.
    pub fn record_neutral(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Consecutive failures recorded so far.
    pub fn failure_count(&self) -> usize {
        self.inner.lock().expect("breaker lock poisoned").consecutive_failures
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Lazily-created breakers, one per target.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<Target, Arc<CircuitBreaker>>>,
    tuning: TuningCell,
    reset_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl BreakerRegistry {
    /// Empty registry.
    pub fn new(tuning: TuningCell, reset_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { breakers: RwLock::new(HashMap::new()), tuning, reset_timeout, clock }
    }

    /// The breaker for `target`, created closed on first use.
    pub fn for_target(&self, target: &Target) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().expect("registry lock poisoned").get(target) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write().expect("registry lock poisoned");
        Arc::clone(breakers.entry(target.clone()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                target.clone(),
                self.tuning.clone(),
                self.reset_timeout,
                Arc::clone(&self.clock),
            ))
        }))
    }

    /// Current state per target, sorted by target.
    pub fn snapshot(&self) -> Vec<(Target, CircuitState)> {
        let mut states: Vec<(Target, CircuitState)> = self
            .breakers
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|(target, breaker)| (target.clone(), breaker.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::Tuning;
    use crate::time::ManualClock;

    fn tuning(threshold: usize) -> TuningCell {
        TuningCell::new(Tuning {
            concurrency: 4,
            timeout: Duration::from_secs(30),
            requests_per_second: 10.0,
            failure_threshold: threshold,
        })
    }

    fn breaker(threshold: usize, clock: &ManualClock) -> CircuitBreaker {
        CircuitBreaker::new(
            Target::new("api"),
            tuning(threshold),
            Duration::from_secs(30),
            Arc::new(clock.clone()),
        )
    }

    #[test]
    fn opens_at_threshold() {
        let clock = ManualClock::new();
        let breaker = breaker(3, &clock);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.try_admit(), Admission::Proceed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.try_admit(), Admission::Reject { failure_count: 3 });
    }

    #[test]
    fn success_resets_the_count() {
        let clock = ManualClock::new();
        let breaker = breaker(3, &clock);

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        // Two since the reset; still closed.
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_admits_one_trial() {
        let clock = ManualClock::new();
        let breaker = breaker(1, &clock);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(30_000);
        assert_eq!(breaker.try_admit(), Admission::Trial);
        // Second concurrent request is rejected while the trial is out.
        assert_eq!(breaker.try_admit(), Admission::Reject { failure_count: 1 });

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.try_admit(), Admission::Proceed);
    }

    #[test]
    fn failed_trial_restarts_the_timer() {
        let clock = ManualClock::new();
        let breaker = breaker(1, &clock);
        breaker.record_failure();

        clock.advance(30_000);
        assert_eq!(breaker.try_admit(), Admission::Trial);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // Partway through the new window: still rejecting.
        clock.advance(15_000);
        assert!(matches!(breaker.try_admit(), Admission::Reject { .. }));

        clock.advance(15_000);
        assert_eq!(breaker.try_admit(), Admission::Trial);
    }

    #[test]
    fn rejects_before_reset_timeout() {
        let clock = ManualClock::new();
        let breaker = breaker(1, &clock);
        breaker.record_failure();

        clock.advance(29_999);
        assert!(matches!(breaker.try_admit(), Admission::Reject { .. }));
        clock.advance(1);
        assert_eq!(breaker.try_admit(), Admission::Trial);
    }

    #[test]
    fn neutral_outcome_releases_trial_slot() {
        let clock = ManualClock::new();
        let breaker = breaker(1, &clock);
        breaker.record_failure();
        clock.advance(30_000);

        assert_eq!(breaker.try_admit(), Admission::Trial);
        breaker.record_neutral();
        // Still half-open, but the slot is free for another trial.
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.try_admit(), Admission::Trial);
    }

    #[test]
    fn threshold_is_read_live() {
        let clock = ManualClock::new();
        let cell = tuning(5);
        let breaker = CircuitBreaker::new(
            Target::new("api"),
            cell.clone(),
            Duration::from_secs(30),
            Arc::new(clock.clone()),
        );

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        let mut tightened = cell.get().as_ref().clone();
        tightened.failure_threshold = 3;
        cell.set(tightened);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn registry_isolates_targets() {
        let clock = ManualClock::new();
        let registry = BreakerRegistry::new(
            tuning(1),
            Duration::from_secs(30),
            Arc::new(clock.clone()),
        );

        registry.for_target(&Target::new("a")).record_failure();
        assert_eq!(registry.for_target(&Target::new("a")).state(), CircuitState::Open);
        assert_eq!(registry.for_target(&Target::new("b")).state(), CircuitState::Closed);

        // Same target resolves to the same breaker.
        assert_eq!(
            registry.snapshot(),
            vec![
                (Target::new("a"), CircuitState::Open),
                (Target::new("b"), CircuitState::Closed),
            ]
        );
    }
}
