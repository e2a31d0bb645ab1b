//! Collaborator seams: the wire transport and the response parser.
//!
//! The engine never talks to a network itself. It hands a prepared
//! [`RequestContext`] to an injected [`Transport`] and, on success, offers the
//! raw response to an optional [`ResponseParser`]. Both are trait objects so
//! tests substitute scripted fakes.

use crate::context::RequestContext;
use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Structured payload extracted from a response.
pub type StructuredData = serde_json::Value;

/// What the transport hands back for a successful attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: BTreeMap<String, String>,
    /// Decoded response body.
    pub body: serde_json::Value,
}

impl RawResponse {
    /// A 200 response with `body` and no headers.
    pub fn ok(body: serde_json::Value) -> Self {
        Self { status: 200, headers: BTreeMap::new(), body }
    }
}

/// Executes one attempt against the upstream.
///
/// Implementations report failures through [`TransportError`] rather than
/// panicking; the engine classifies them for retry and breaker accounting.
/// The per-attempt timeout is enforced outside this trait, so implementations
/// need not race their own deadline.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the request described by `context`.
    async fn execute(&self, context: &RequestContext) -> Result<RawResponse, TransportError>;
}

/// Output of a [`ResponseParser`].
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    /// Extracted structured payload.
    pub data: StructuredData,
    /// Parser-attached annotations (pagination cursors, record counts, ...).
    pub metadata: BTreeMap<String, String>,
}

/// Turns a raw response into structured data.
///
/// Parsing happens after the retry loop has settled on a successful response;
/// a parse failure is terminal and never retried.
pub trait ResponseParser: Send + Sync {
    /// Extract structured data from `response`.
    fn parse(
        &self,
        response: &RawResponse,
    ) -> Result<Parsed, Box<dyn std::error::Error + Send + Sync>>;
}

/// Successful outcome delivered to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// The raw response exactly as the pipeline's response phase left it.
    pub raw: RawResponse,
    /// Parser output, present when the engine was built with a parser.
    pub parsed: Option<Parsed>,
}
