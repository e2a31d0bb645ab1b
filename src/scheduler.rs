//! The engine: submission API, concurrency-gated dispatcher, and the
//! per-attempt policy nesting.
//!
//! Dispatch order: the dispatcher waits for a free worker slot *before*
//! dequeuing, so the queue keeps ordering authority until the moment a slot
//! exists. Each dispatched request then runs attempts under
//! rate limiter -> circuit breaker -> middleware -> timeout -> transport,
//! with the retry policy looping over the whole of it.

use crate::circuit_breaker::{Admission, BreakerRegistry, CircuitState};
use crate::config::EngineConfig;
use crate::context::{RequestContext, RequestDescriptor, RequestId, Target};
use crate::error::{FailureReport, RequestError, TransportError};
use crate::metrics::{
    EngineEvent, FailureKind, LogSink, MetricsSink, MetricsSnapshot, MetricsWindow, NullSink,
};
use crate::middleware::{AuthMiddleware, DefaultHeaders, Middleware, Pipeline};
use crate::optimizer::{Optimizer, OptimizerConfig, ResourceProbe, SystemProbe, TuningCell, Tuning};
use crate::queue::{Delivery, QueueEntry, RequestQueue};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::time::{Clock, MonotonicClock, Sleeper, TokioSleeper};
use crate::transport::{RawResponse, Response, ResponseParser, Transport};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;

/// Builder for [`Engine`]. The transport is the only mandatory collaborator.
pub struct EngineBuilder {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    middleware: Vec<Arc<dyn Middleware>>,
    parser: Option<Arc<dyn ResponseParser>>,
    sink: Arc<dyn MetricsSink>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn ResourceProbe>,
    optimizer: OptimizerConfig,
}

impl EngineBuilder {
    fn new(config: EngineConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            middleware: Vec::new(),
            parser: None,
            sink: Arc::new(NullSink),
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(MonotonicClock::default()),
            probe: Arc::new(SystemProbe::new()),
            optimizer: OptimizerConfig::default(),
        }
    }

    /// Append a middleware stage. Stages run in registration order on the
    /// request phase and reverse order on the response phase, after the
    /// built-in header and auth stages.
    pub fn middleware(mut self, stage: Arc<dyn Middleware>) -> Self {
        self.middleware.push(stage);
        self
    }

    /// Parse successful responses with `parser`.
    pub fn parser(mut self, parser: Arc<dyn ResponseParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Observe engine events with `sink`. Defaults to dropping them; use
    /// [`LogSink`] to forward to `tracing`.
    pub fn sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Inject the sleeper used for backoff and rate-limit waits.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Inject the clock the circuit breakers read.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Inject the resource probe capping optimizer growth.
    pub fn probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Override optimizer cycle parameters.
    pub fn optimizer(mut self, config: OptimizerConfig) -> Self {
        self.optimizer = config;
        self
    }

    /// Validate the configuration and start the engine tasks.
    pub fn build(self) -> Result<Engine, crate::config::ConfigError> {
        self.config.validate()?;

        let tuning = TuningCell::new(self.config.initial_tuning());
        let metrics = Arc::new(MetricsWindow::new());

        let mut stages: Vec<Arc<dyn Middleware>> = Vec::new();
        if !self.config.headers.is_empty() {
            stages.push(Arc::new(DefaultHeaders::new(self.config.headers.clone())));
        }
        if let Some(auth) = &self.config.auth {
            stages.push(Arc::new(AuthMiddleware::new(auth)));
        }
        stages.extend(self.middleware);

        let limiter = Arc::new(RateLimiter::new(
            tuning.clone(),
            self.config.burst_capacity(),
            Arc::clone(&self.sleeper),
        ));
        let breakers = Arc::new(BreakerRegistry::new(
            tuning.clone(),
            self.config.reset_timeout,
            Arc::clone(&self.clock),
        ));
        let retry = RetryPolicy::new(self.config.max_retries)
            .with_sleeper(Arc::clone(&self.sleeper));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            queue: RequestQueue::new(),
            pipeline: Pipeline::new(stages),
            limiter,
            breakers,
            retry,
            tuning: tuning.clone(),
            metrics: Arc::clone(&metrics),
            sink: self.sink,
            show_progress: self.config.show_progress,
            transport: self.transport,
            parser: self.parser,
            base_target: Target::new(self.config.base_url.clone()),
            in_flight: AtomicUsize::new(0),
            slot_freed: Notify::new(),
            shutdown_tx,
        });

        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&shared), shutdown_rx.clone()));
        let optimizer = Arc::new(Optimizer::new(
            tuning,
            metrics,
            self.probe,
            Arc::clone(&shared.sink),
            self.optimizer,
        ));
        let optimizer_task = tokio::spawn(optimizer.run(shutdown_rx));

        Ok(Engine { shared, tasks: Mutex::new(vec![dispatcher, optimizer_task]) })
    }
}

struct Shared {
    queue: RequestQueue,
    pipeline: Pipeline,
    limiter: Arc<RateLimiter>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryPolicy,
    tuning: TuningCell,
    metrics: Arc<MetricsWindow>,
    sink: Arc<dyn MetricsSink>,
    show_progress: bool,
    transport: Arc<dyn Transport>,
    parser: Option<Arc<dyn ResponseParser>>,
    base_target: Target,
    in_flight: AtomicUsize,
    slot_freed: Notify,
    shutdown_tx: watch::Sender<bool>,
}

/// Handle to one submitted request.
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    context: RequestContext,
    rx: oneshot::Receiver<Delivery>,
}

impl RequestHandle {
    /// Queue-issued id, usable with [`Engine::cancel`].
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the terminal outcome.
    pub async fn wait(self) -> Delivery {
        match self.rx.await {
            Ok(delivery) => delivery,
            // The engine dropped the reply sender without resolving it;
            // treated as cancellation (shutdown mid-flight).
            Err(_) => Err(FailureReport {
                context: self.context,
                error: RequestError::Cancelled,
                attempts: 0,
                elapsed: std::time::Duration::ZERO,
            }),
        }
    }
}

/// Priority-scheduling, self-tuning outbound request engine.
///
/// Built by [`Engine::builder`]. Call [`Engine::shutdown`] for a
/// deterministic drain; merely dropping the engine leaves in-flight
/// attempts to finish on their own.
pub struct Engine {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Start building an engine around `transport`.
    pub fn builder(config: EngineConfig, transport: Arc<dyn Transport>) -> EngineBuilder {
        EngineBuilder::new(config, transport)
    }

    /// Submit one request. Returns immediately with a handle; the request is
    /// executed when priority and a worker slot allow.
    pub fn submit(&self, descriptor: RequestDescriptor) -> Result<RequestHandle, RequestError> {
        let context = RequestContext::from_descriptor(descriptor, &self.shared.base_target);
        let (id, rx) = self.shared.queue.enqueue(context.clone())?;
        Ok(RequestHandle { id, context, rx })
    }

    /// Submit and wait for the terminal outcome.
    pub async fn fetch(&self, descriptor: RequestDescriptor) -> Delivery {
        let fallback = descriptor.clone();
        match self.submit(descriptor) {
            Ok(handle) => handle.wait().await,
            Err(error) => Err(self.rejection_report(fallback, error)),
        }
    }

    /// Submit a batch and wait for all outcomes, returned in submission
    /// order regardless of completion order.
    pub async fn fetch_batch(&self, descriptors: Vec<RequestDescriptor>) -> Vec<Delivery> {
        let handles: Vec<Result<RequestHandle, FailureReport>> = descriptors
            .into_iter()
            .map(|descriptor| {
                let fallback = descriptor.clone();
                self.submit(descriptor)
                    .map_err(|error| self.rejection_report(fallback, error))
            })
            .collect();
        futures::future::join_all(handles.into_iter().map(|handle| async move {
            match handle {
                Ok(handle) => handle.wait().await,
                Err(report) => Err(report),
            }
        }))
        .await
    }

    /// Report for a submission the queue refused, naming the request as
    /// it was handed in.
    fn rejection_report(&self, descriptor: RequestDescriptor, error: RequestError) -> FailureReport {
        FailureReport {
            context: RequestContext::from_descriptor(descriptor, &self.shared.base_target),
            error,
            attempts: 0,
            elapsed: std::time::Duration::ZERO,
        }
    }

    /// Cancel a pending request. Returns `true` if it was still queued;
    /// a request already dispatched (or already finished) is not
    /// interrupted and `false` is returned.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.shared.queue.cancel(id)
    }

    /// Cancel every pending request carrying any of `tags`; returns how
    /// many were cancelled.
    pub fn cancel_by_tags(&self, tags: &BTreeSet<String>) -> usize {
        self.shared.queue.cancel_by_tags(tags)
    }

    /// Wait until no pending or in-flight request carries any of `tags`.
    pub async fn wait_for_tags(&self, tags: &BTreeSet<String>) {
        self.shared.queue.wait_for_tags(tags).await;
    }

    /// The live tuning snapshot.
    pub fn tuning(&self) -> Arc<Tuning> {
        self.shared.tuning.get()
    }

    /// Current metrics window, without resetting it.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Circuit state per target seen so far.
    pub fn breaker_states(&self) -> Vec<(Target, CircuitState)> {
        self.shared.breakers.snapshot()
    }

    /// Pending (not yet dispatched) request count.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Stop accepting work, cancel everything pending, and wait for
    /// in-flight requests to settle.
    pub async fn shutdown(&self) {
        let _ = self.shared.shutdown_tx.send(true);
        self.shared.queue.close();

        let tasks: Vec<JoinHandle<()>> =
            self.tasks.lock().expect("engine lock poisoned").drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        loop {
            let drained = self.shared.slot_freed.notified();
            if self.shared.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("queue_len", &self.shared.queue.len())
            .field("in_flight", &self.shared.in_flight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Waits for a worker slot, then dequeues and spawns one request. Gating
/// before dequeue keeps ordering authority in the queue: a high-priority
/// submission arriving while all slots are busy is dispatched ahead of
/// older low-priority entries.
async fn dispatch_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        loop {
            let freed = shared.slot_freed.notified();
            let retuned = shared.tuning.change_signal().notified();
            let limit = shared.tuning.get().concurrency;
            if shared.in_flight.load(Ordering::Acquire) < limit {
                break;
            }
            tokio::select! {
                _ = freed => {}
                _ = retuned => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }

        let entry = match shared.queue.dequeue().await {
            Ok(entry) => entry,
            Err(_) => return,
        };

        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        let shared_task = Arc::clone(&shared);
        tokio::spawn(async move {
            execute_entry(&shared_task, entry).await;
            shared_task.in_flight.fetch_sub(1, Ordering::AcqRel);
            shared_task.slot_freed.notify_waiters();
        });
    }
}

/// Drive one dispatched request to its terminal outcome and resolve its
/// reply channel.
async fn execute_entry(shared: &Shared, entry: QueueEntry) {
    let QueueEntry { id, mut context, reply } = entry;
    let started = Instant::now();

    let outcome = run_attempts(shared, &mut context).await;
    shared.queue.mark_complete(&context);

    let delivery: Delivery = match outcome {
        Ok((raw, attempts)) => match parse_response(shared, raw) {
            Ok(response) => {
                emit_terminal(
                    shared,
                    EngineEvent::RequestCompleted { id, attempts, elapsed: started.elapsed() },
                );
                Ok(response)
            }
            Err(error) => {
                emit_terminal(
                    shared,
                    EngineEvent::RequestFailed {
                        id,
                        kind: FailureKind::of(&error),
                        attempts,
                        elapsed: started.elapsed(),
                    },
                );
                Err(FailureReport { context, error, attempts, elapsed: started.elapsed() })
            }
        },
        Err((error, attempts)) => {
            emit_terminal(
                shared,
                EngineEvent::RequestFailed {
                    id,
                    kind: FailureKind::of(&error),
                    attempts,
                    elapsed: started.elapsed(),
                },
            );
            Err(FailureReport { context, error, attempts, elapsed: started.elapsed() })
        }
    };

    // The submitter may have dropped its handle.
    let _ = reply.send(delivery);
}

fn parse_response(shared: &Shared, raw: RawResponse) -> Result<Response, RequestError> {
    let parsed = match &shared.parser {
        Some(parser) => Some(
            parser
                .parse(&raw)
                .map_err(|err| RequestError::Parse(err.to_string()))?,
        ),
        None => None,
    };
    Ok(Response { raw, parsed })
}

fn emit_terminal(shared: &Shared, event: EngineEvent) {
    if shared.show_progress {
        LogSink.record(&event);
    }
    shared.sink.record(&event);
}

/// The retry loop. On success returns the raw response and the number of
/// attempts consumed; on terminal failure returns the final error and the
/// attempt count (zero when the transport was never reached).
async fn run_attempts(
    shared: &Shared,
    context: &mut RequestContext,
) -> Result<(RawResponse, u32), (RequestError, u32)> {
    let breaker = shared.breakers.for_target(&context.target);
    let mut attempt: u32 = 0;

    loop {
        context.attempt = attempt;

        if context.past_deadline() {
            return Err((RequestError::DeadlineExceeded { elapsed: context.elapsed() }, attempt));
        }

        // Pacing first: a request that will be rejected by the breaker
        // anyway should still not burn a token for a later retry, but the
        // acquire suspends rather than rejects, so the order keeps rejected
        // requests from stampeding a recovering target.
        let waited = shared.limiter.acquire(&context.target).await;
        if waited >= shared.limiter.hit_threshold() {
            shared.metrics.record_rate_limit_hit();
            shared.sink.record(&EngineEvent::RateLimitWait {
                target: context.target.clone(),
                waited,
            });
        }

        let admission = breaker.try_admit();
        if let Admission::Reject { failure_count } = admission {
            let error = RequestError::CircuitOpen {
                target: context.target.clone(),
                failure_count,
            };
            shared.metrics.record_failure(FailureKind::CircuitOpen);
            shared.sink.record(&EngineEvent::AttemptFailed {
                target: context.target.clone(),
                kind: FailureKind::CircuitOpen,
                duration: std::time::Duration::ZERO,
            });
            // The transport was never reached; no retry is consumed and
            // backing off here would not change the breaker's timeline.
            return Err((error, attempt));
        }

        shared.metrics.record_attempt();
        shared.sink.record(&EngineEvent::AttemptStarted {
            target: context.target.clone(),
            attempt,
        });

        let attempt_started = Instant::now();
        match run_single_attempt(shared, context).await {
            Ok(raw) => {
                let duration = attempt_started.elapsed();
                breaker.record_success();
                shared.metrics.record_success(duration);
                shared.sink.record(&EngineEvent::AttemptSucceeded {
                    target: context.target.clone(),
                    duration,
                });
                return Ok((raw, attempt + 1));
            }
            Err(error) => {
                let duration = attempt_started.elapsed();
                if error.counts_against_breaker() {
                    breaker.record_failure();
                } else {
                    breaker.record_neutral();
                }
                let kind = FailureKind::of(&error);
                shared.metrics.record_failure(kind);
                shared.sink.record(&EngineEvent::AttemptFailed {
                    target: context.target.clone(),
                    kind,
                    duration,
                });

                if shared.retry.should_retry(&error, attempt) {
                    tracing::debug!(
                        target_name = %context.target,
                        path = %context.path,
                        attempt,
                        %error,
                        "retrying after backoff"
                    );
                    shared.retry.backoff(attempt, &error).await;
                    attempt += 1;
                    continue;
                }
                return Err((error, attempt + 1));
            }
        }
    }
}

/// One attempt: request phase, transport under the live timeout, response
/// phase.
async fn run_single_attempt(
    shared: &Shared,
    context: &mut RequestContext,
) -> Result<RawResponse, RequestError> {
    shared.pipeline.request_phase(context).await?;

    let timeout = shared.tuning.get().timeout;
    let started = Instant::now();
    let mut raw = match tokio::time::timeout(timeout, shared.transport.execute(context)).await {
        Ok(Ok(raw)) => raw,
        Ok(Err(transport_error)) => return Err(RequestError::Transport(transport_error)),
        Err(_) => {
            return Err(RequestError::Transport(TransportError::Timeout {
                elapsed: started.elapsed(),
                timeout,
            }));
        }
    };

    shared.pipeline.response_phase(context, &mut raw).await?;
    Ok(raw)
}
