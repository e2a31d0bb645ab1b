//! Request identity and per-request state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, Instant};

/// The logical upstream endpoint a circuit breaker and rate limiter are
/// scoped to. Two requests with the same target share resilience state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target(String);

impl Target {
    /// Wrap a target name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The target name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Target {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for Target {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Dispatch priority; lower values dequeue first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Priority(pub u8);

impl Priority {
    /// Dispatched before everything else.
    pub const HIGH: Priority = Priority(0);
    /// Default for submissions that do not state a priority.
    pub const NORMAL: Priority = Priority(10);
    /// Background work, dispatched when nothing more urgent is queued.
    pub const LOW: Priority = Priority(20);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

/// Queue-issued identifier for a submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl RequestId {
    /// Raw sequence value backing this id.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a caller hands to the engine. Everything except the path is optional;
/// the target defaults to the engine's configured base target.
#[derive(Debug, Clone, Default)]
pub struct RequestDescriptor {
    /// Override the engine's base target for this request.
    pub target: Option<Target>,
    /// Path and query relative to the target.
    pub path: String,
    /// Request parameters, checked by validation middleware when declared.
    pub params: BTreeMap<String, serde_json::Value>,
    /// Per-request headers, merged over engine defaults.
    pub headers: BTreeMap<String, String>,
    /// Dispatch priority.
    pub priority: Priority,
    /// Tags for group cancellation and completion waits.
    pub tags: BTreeSet<String>,
    /// Free-form metadata carried through the pipeline untouched.
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Hard deadline; attempts are not started past it.
    pub deadline: Option<Instant>,
}

impl RequestDescriptor {
    /// Descriptor for `path` with default priority and no tags.
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), ..Self::default() }
    }

    /// Scope this request to `target` instead of the engine default.
    pub fn target(mut self, target: impl Into<Target>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set the dispatch priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Add a tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Add a request parameter.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Add a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Attach a metadata entry.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set a hard deadline.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Per-request state owned by the pipeline execution for its lifetime.
///
/// Only the attempt counter and headers mutate after construction; middleware
/// must treat everything else as read-only.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Resilience scope for this request.
    pub target: Target,
    /// Path and query relative to the target.
    pub path: String,
    /// Request parameters.
    pub params: BTreeMap<String, serde_json::Value>,
    /// Headers; middleware may add or replace entries in the request phase.
    pub headers: BTreeMap<String, String>,
    /// Dispatch priority.
    pub priority: Priority,
    /// Tags for group cancellation and completion waits.
    pub tags: BTreeSet<String>,
    /// Free-form metadata.
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Zero-based attempt counter, incremented by the retry loop.
    pub attempt: u32,
    /// When the request entered the queue.
    pub created_at: Instant,
    /// Hard deadline; attempts are not started past it.
    pub deadline: Option<Instant>,
}

impl RequestContext {
    /// Build the context for a submission, filling in the engine's base
    /// target when the descriptor does not name one.
    pub fn from_descriptor(descriptor: RequestDescriptor, base_target: &Target) -> Self {
        Self {
            target: descriptor.target.unwrap_or_else(|| base_target.clone()),
            path: descriptor.path,
            params: descriptor.params,
            headers: descriptor.headers,
            priority: descriptor.priority,
            tags: descriptor.tags,
            metadata: descriptor.metadata,
            attempt: 0,
            created_at: Instant::now(),
            deadline: descriptor.deadline,
        }
    }

    /// Wall time since the request entered the queue.
    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether the deadline, if any, has passed. Checked at attempt
    /// boundaries; an attempt already in flight is never interrupted by it.
    pub fn past_deadline(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Whether this request carries any of `tags`.
    pub fn has_any_tag(&self, tags: &BTreeSet<String>) -> bool {
        self.tags.iter().any(|tag| tags.contains(tag))
    }
}
