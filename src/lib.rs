//! Priority-aware outbound request scheduling with built-in resilience.
//!
//! `fanout` drives high-volume traffic against rate-limited upstream APIs.
//! Requests enter a cancellable priority queue and are drained by a
//! dispatcher whose concurrency, timeout, and pacing knobs are retuned live
//! by an AIMD optimizer watching the success rate. Every attempt runs
//! through a middleware pipeline and is wrapped in a per-target token
//! bucket, a per-target circuit breaker, a per-attempt timeout, and a
//! jittered-exponential retry policy.
//!
//! The actual wire protocol is yours: implement [`Transport`] (and
//! optionally [`ResponseParser`]) and hand them to the builder.
//!
//! ```
//! use fanout::prelude::*;
//!
//! let config = EngineConfig {
//!     base_url: "https://api.example.com".to_owned(),
//!     concurrency: 8,
//!     requests_per_second: 50.0,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//!
//! let request = RequestDescriptor::new("/v1/users")
//!     .priority(Priority::HIGH)
//!     .param("page", 1)
//!     .tag("user-sync");
//! assert_eq!(request.path, "/v1/users");
//! ```
//!
//! [`Transport`]: transport::Transport
//! [`ResponseParser`]: transport::ResponseParser

#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod optimizer;
pub mod prelude;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod time;
pub mod transport;
pub mod validation;

pub use config::{AuthConfig, ConfigError, EngineConfig};
pub use context::{Priority, RequestDescriptor, RequestId, Target};
pub use error::{FailureReport, RequestError, TransportError};
pub use scheduler::{Engine, EngineBuilder, RequestHandle};
pub use transport::{RawResponse, Response, Transport};
