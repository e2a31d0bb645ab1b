//! Error taxonomy for the scheduling engine.
//!
//! Two layers: [`TransportError`] describes what went wrong on the wire,
//! [`RequestError`] is the engine-level view a middleware or caller sees.
//! Terminal failures are wrapped in a [`FailureReport`] carrying the
//! originating context, the attempt count, and elapsed wall time, so a caller
//! can tell "never tried" apart from "tried and exhausted".

use crate::context::{RequestContext, Target};
use std::time::Duration;
use thiserror::Error;

/// Failure reported by the transport collaborator for one attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// The attempt exceeded its per-attempt deadline.
    #[error("attempt timed out after {elapsed:?} (limit {timeout:?})")]
    Timeout {
        /// Wall time the attempt ran before being cancelled.
        elapsed: Duration,
        /// The deadline in force for the attempt.
        timeout: Duration,
    },
    /// The connection could not be established or was dropped mid-flight.
    #[error("connection failed: {0}")]
    Connection(String),
    /// The upstream answered with a non-success HTTP status.
    #[error("upstream returned HTTP {0}")]
    HttpStatus(u16),
    /// The upstream explicitly rate limited the request (HTTP 429).
    #[error("upstream rate limited the request (retry after {retry_after:?})")]
    RateLimited {
        /// Server-suggested delay, when the response carried one.
        retry_after: Option<Duration>,
    },
}

impl TransportError {
    /// Whether the retry policy may re-attempt after this failure.
    ///
    /// Timeouts, connection errors, 5xx, and explicit 429s are transient.
    /// Any other HTTP status is a caller-side problem and surfaces at once.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout { .. }
            | TransportError::Connection(_)
            | TransportError::RateLimited { .. } => true,
            TransportError::HttpStatus(status) => (500..=599).contains(status),
        }
    }
}

/// Engine-level error for a single request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    /// The transport collaborator failed the attempt.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A declared schema was violated by the request or the response.
    #[error("validation failed for '{field}': expected {expected}, got {actual}")]
    Validation {
        /// Field name from the declared schema.
        field: String,
        /// Shape the schema declared.
        expected: &'static str,
        /// What was actually present.
        actual: String,
    },
    /// The circuit for the target is open; the transport was never invoked.
    #[error("circuit open for target '{target}' after {failure_count} consecutive failures")]
    CircuitOpen {
        /// Target whose circuit rejected the attempt.
        target: Target,
        /// Consecutive failures recorded when the circuit opened.
        failure_count: usize,
    },
    /// The queue was shut down before the request could be accepted.
    #[error("queue is closed")]
    QueueClosed,
    /// The entry was cancelled while still pending; it never reached dispatch.
    #[error("request cancelled before dispatch")]
    Cancelled,
    /// The request's hard deadline passed before the next attempt could
    /// start; the transport was not invoked for it.
    #[error("request deadline exceeded after {elapsed:?}")]
    DeadlineExceeded {
        /// Wall time since the request entered the queue.
        elapsed: Duration,
    },
    /// The response parser collaborator rejected a successful response.
    #[error("response parsing failed: {0}")]
    Parse(String),
}

impl RequestError {
    /// Whether the retry policy may loop on this error. Only transient
    /// transport failures qualify; everything else propagates unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RequestError::Transport(e) if e.is_transient())
    }

    /// Validation failures are contract bugs and deadline expiry is a
    /// caller-side budget, not a target-health signal; neither counts
    /// against the circuit breaker's failure threshold.
    pub fn counts_against_breaker(&self) -> bool {
        !matches!(
            self,
            RequestError::Validation { .. } | RequestError::DeadlineExceeded { .. }
        )
    }

    /// True for timeouts, at either the transport or the attempt deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestError::Transport(TransportError::Timeout { .. }))
    }

    /// True when the circuit breaker rejected the attempt.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, RequestError::CircuitOpen { .. })
    }

    /// True when the request was cancelled or the queue refused it.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RequestError::Cancelled | RequestError::QueueClosed)
    }

    /// Server-suggested retry delay, present on explicit 429 responses.
    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            RequestError::Transport(TransportError::RateLimited { retry_after }) => *retry_after,
            _ => None,
        }
    }
}

/// Terminal failure handed back to the caller.
#[derive(Debug, Clone, Error)]
#[error("request to '{}' failed after {attempts} attempt(s) over {elapsed:?}: {error}", .context.target)]
pub struct FailureReport {
    /// The request as it stood when the failure became terminal.
    pub context: RequestContext,
    /// The final error; earlier retryable failures are not recorded.
    pub error: RequestError,
    /// Total attempts made, zero when the request never reached the transport.
    pub attempts: u32,
    /// Wall time from dispatch (or cancellation) to the terminal failure.
    pub elapsed: Duration,
}

impl FailureReport {
    /// True when the request never reached the transport at all.
    pub fn never_attempted(&self) -> bool {
        self.attempts == 0
    }
}
