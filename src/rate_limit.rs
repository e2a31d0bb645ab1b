//! Per-target token-bucket rate limiting.
//!
//! Buckets are created lazily on first use of a target and refill
//! continuously at the live tuned rate. `acquire` suspends the caller until
//! a whole token is available; it never rejects.

use crate::context::Target;
use crate::optimizer::TuningCell;
use crate::time::Sleeper;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Fraction of the refill interval a wait must exceed to count as a
/// rate-limit hit in the metrics window. Sub-threshold waits are ordinary
/// pacing, not pressure.
const HIT_WAIT_FRACTION: f64 = 0.1;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single target's bucket. Capacity bounds how much burst can accrue
/// during a lull; buckets start empty so a cold start cannot burst past the
/// steady-state rate.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Empty bucket holding at most `capacity` tokens.
    pub fn new(capacity: f64) -> Self {
        Self {
            capacity,
            state: Mutex::new(BucketState { tokens: 0.0, last_refill: Instant::now() }),
        }
    }

    /// Take one token, refilling at `rate` tokens per second and sleeping
    /// through `sleeper` while short. Returns the time spent waiting.
    ///
    /// A short bucket reserves the next future token: the refill origin is
    /// pushed forward to the instant the deficit fills and the caller sleeps
    /// until then. The token count itself stays within `[0, capacity]`, and
    /// concurrent acquirers pace themselves in lock order with one sleep
    /// each.
    pub async fn acquire(&self, rate: f64, sleeper: &dyn Sleeper) -> Duration {
        let wait = {
            let mut state = self.state.lock().expect("bucket lock poisoned");
            let now = Instant::now();
            if now >= state.last_refill {
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * rate).min(self.capacity);
                state.last_refill = now;
            }
            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                return Duration::ZERO;
            }
            let deficit = 1.0 - state.tokens;
            state.tokens = 0.0;
            let ready_at = state.last_refill + Duration::from_secs_f64(deficit / rate);
            state.last_refill = ready_at;
            ready_at.saturating_duration_since(now)
        };
        sleeper.sleep(wait).await;
        wait
    }
}

/// Lazily-created per-target buckets sharing one live rate.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<Target, Arc<TokenBucket>>>,
    tuning: TuningCell,
    burst: f64,
    sleeper: Arc<dyn Sleeper>,
}

impl RateLimiter {
    /// Limiter reading its rate from `tuning`, with `burst` bucket capacity.
    pub fn new(tuning: TuningCell, burst: f64, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { buckets: Mutex::new(HashMap::new()), tuning, burst, sleeper }
    }

    /// Take one token for `target`, creating its bucket on first use.
    /// Suspends until a token is available; returns the time spent waiting.
    pub async fn acquire(&self, target: &Target) -> Duration {
        let bucket = self.bucket_for(target);
        let rate = self.tuning.get().requests_per_second;
        bucket.acquire(rate, self.sleeper.as_ref()).await
    }

    /// Minimum wait that counts as a rate-limit hit at the current rate.
    pub fn hit_threshold(&self) -> Duration {
        let rate = self.tuning.get().requests_per_second;
        Duration::from_secs_f64(HIT_WAIT_FRACTION / rate)
    }

    /// Targets with a live bucket, sorted.
    pub fn snapshot(&self) -> Vec<Target> {
        let mut targets: Vec<Target> = self
            .buckets
            .lock()
            .expect("limiter lock poisoned")
            .keys()
            .cloned()
            .collect();
        targets.sort();
        targets
    }

    fn bucket_for(&self, target: &Target) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock().expect("limiter lock poisoned");
        Arc::clone(
            buckets
                .entry(target.clone())
                .or_insert_with(|| Arc::new(TokenBucket::new(self.burst))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::Tuning;
    use crate::time::{TokioSleeper, TrackingSleeper};

    fn tuning(rate: f64) -> TuningCell {
        TuningCell::new(Tuning {
            concurrency: 4,
            timeout: Duration::from_secs(30),
            requests_per_second: rate,
            failure_threshold: 5,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn paces_to_the_refill_rate() {
        let bucket = TokenBucket::new(5.0);
        let sleeper = TokioSleeper;

        // Bucket starts empty: even the first token costs a full interval.
        let start = Instant::now();
        bucket.acquire(10.0, &sleeper).await;
        assert_eq!(start.elapsed(), Duration::from_millis(100));

        // Ten more tokens at 10 rps is another second.
        let start = Instant::now();
        for _ in 0..10 {
            bucket.acquire(10.0, &sleeper).await;
        }
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_bounds_burst_after_lull() {
        let bucket = TokenBucket::new(3.0);
        let sleeper = TokioSleeper;

        // A long idle period accrues at most `capacity` tokens.
        tokio::time::sleep(Duration::from_secs(60)).await;

        let start = Instant::now();
        for _ in 0..3 {
            bucket.acquire(10.0, &sleeper).await;
        }
        // Three tokens were banked; no waiting.
        assert_eq!(start.elapsed(), Duration::ZERO);

        // The fourth needs a refill interval.
        bucket.acquire(10.0, &sleeper).await;
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn per_target_isolation() {
        let sleeper = Arc::new(TrackingSleeper::new());
        let limiter = RateLimiter::new(tuning(1.0), 1.0, sleeper.clone());

        // Drain target "a" so it owes a wait, then hit "b".
        limiter.acquire(&Target::new("a")).await;
        limiter.acquire(&Target::new("a")).await;
        let waits_after_a = sleeper.recorded().len();
        assert!(waits_after_a >= 1);

        // "b" has its own fresh bucket: exactly the cold-start wait, no debt
        // inherited from "a".
        limiter.acquire(&Target::new("b")).await;
        let b_waits = sleeper.recorded().len() - waits_after_a;
        assert_eq!(b_waits, 1);

        assert_eq!(limiter.snapshot(), vec![Target::new("a"), Target::new("b")]);
    }

    #[tokio::test]
    async fn live_rate_is_read_per_acquire() {
        let sleeper = Arc::new(TrackingSleeper::new());
        let cell = tuning(1.0);
        let limiter = RateLimiter::new(cell.clone(), 1.0, sleeper.clone());

        limiter.acquire(&Target::new("a")).await;
        let slow_wait = *sleeper.recorded().last().unwrap();

        let mut faster = cell.get().as_ref().clone();
        faster.requests_per_second = 100.0;
        cell.set(faster);

        limiter.acquire(&Target::new("b")).await;
        let fast_wait = *sleeper.recorded().last().unwrap();
        assert!(fast_wait < slow_wait);
    }

    #[tokio::test]
    async fn hit_threshold_scales_with_rate() {
        let limiter = RateLimiter::new(tuning(10.0), 10.0, Arc::new(TrackingSleeper::new()));
        assert_eq!(limiter.hit_threshold(), Duration::from_millis(10));
    }
}
