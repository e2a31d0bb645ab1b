#![allow(dead_code)]

use async_trait::async_trait;
use fanout::context::RequestContext;
use fanout::error::TransportError;
use fanout::transport::{RawResponse, Transport};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// One scripted transport behavior, consumed in order per path.
pub enum Scripted {
    /// Respond 200 with this body.
    Ok(Value),
    /// Fail with this transport error.
    Err(TransportError),
    /// Respond 200 with this body after a delay.
    OkAfter(Duration, Value),
    /// Park until the gate is notified, then respond 200.
    Hold(Arc<Notify>),
}

/// A recorded transport invocation.
#[derive(Debug, Clone)]
pub struct Call {
    pub path: String,
    pub at: Instant,
    pub headers: BTreeMap<String, String>,
    pub attempt: u32,
}

/// Transport fake driven by per-path scripts. Paths with no script (or an
/// exhausted script) succeed with an empty body.
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<Call>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a behavior to `path`'s script.
    pub fn script(&self, path: &str, behavior: Scripted) {
        self.scripts
            .lock()
            .unwrap()
            .entry(path.to_owned())
            .or_default()
            .push_back(behavior);
    }

    /// Script `n` consecutive failures for `path`.
    pub fn script_failures(&self, path: &str, n: usize, error: TransportError) {
        for _ in 0..n {
            self.script(path, Scripted::Err(error.clone()));
        }
    }

    /// All invocations so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Invocation paths in order.
    pub fn call_paths(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.path).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, context: &RequestContext) -> Result<RawResponse, TransportError> {
        self.calls.lock().unwrap().push(Call {
            path: context.path.clone(),
            at: Instant::now(),
            headers: context.headers.clone(),
            attempt: context.attempt,
        });
        let behavior = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&context.path)
            .and_then(|queue| queue.pop_front());
        match behavior {
            None => Ok(RawResponse::ok(serde_json::json!({}))),
            Some(Scripted::Ok(body)) => Ok(RawResponse::ok(body)),
            Some(Scripted::Err(error)) => Err(error),
            Some(Scripted::OkAfter(delay, body)) => {
                tokio::time::sleep(delay).await;
                Ok(RawResponse::ok(body))
            }
            Some(Scripted::Hold(gate)) => {
                gate.notified().await;
                Ok(RawResponse::ok(serde_json::json!({})))
            }
        }
    }
}

/// Poll until the transport has seen `n` calls, yielding between checks.
pub async fn wait_for_calls(transport: &MockTransport, n: usize) {
    for _ in 0..10_000 {
        if transport.call_count() >= n {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("transport never reached {n} calls (saw {})", transport.call_count());
}

pub fn connection_refused() -> TransportError {
    TransportError::Connection("connection refused".to_owned())
}
