//! Convenience re-exports for typical engine usage.

pub use crate::config::{AuthConfig, EngineConfig};
pub use crate::context::{Priority, RequestDescriptor, RequestId, Target};
pub use crate::error::{FailureReport, RequestError, TransportError};
pub use crate::metrics::{EngineEvent, LogSink, MemorySink, MetricsSink};
pub use crate::middleware::Middleware;
pub use crate::scheduler::{Engine, RequestHandle};
pub use crate::transport::{RawResponse, Response, ResponseParser, Transport};
pub use crate::validation::{FieldShape, Schema, ValidationMiddleware};
