//! Middleware pipeline.
//!
//! Middleware run as an onion: request hooks fire in registration order, and
//! response hooks fire in reverse order, so the first middleware registered
//! sees the request first and the response last. A request-phase error
//! short-circuits the attempt before the transport is invoked.

use crate::config::AuthConfig;
use crate::context::RequestContext;
use crate::error::RequestError;
use crate::transport::RawResponse;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A pipeline stage. Both hooks default to no-ops so a middleware can
/// implement only the phase it cares about.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Inspect or mutate the outgoing request. Returning an error fails the
    /// attempt without invoking the transport.
    async fn on_request(&self, _context: &mut RequestContext) -> Result<(), RequestError> {
        Ok(())
    }

    /// Inspect or mutate a successful raw response before parsing.
    /// Returning an error converts the attempt into a failure.
    async fn on_response(
        &self,
        _context: &RequestContext,
        _response: &mut RawResponse,
    ) -> Result<(), RequestError> {
        Ok(())
    }
}

/// An immutable, ordered middleware chain.
#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<[Arc<dyn Middleware>]>,
}

impl Pipeline {
    /// Freeze `stages` into a pipeline.
    pub fn new(stages: Vec<Arc<dyn Middleware>>) -> Self {
        Self { stages: stages.into() }
    }

    /// Run request hooks in registration order; the first error wins.
    pub async fn request_phase(&self, context: &mut RequestContext) -> Result<(), RequestError> {
        for stage in self.stages.iter() {
            stage.on_request(context).await?;
        }
        Ok(())
    }

    /// Run response hooks in reverse registration order; the first error wins.
    pub async fn response_phase(
        &self,
        context: &RequestContext,
        response: &mut RawResponse,
    ) -> Result<(), RequestError> {
        for stage in self.stages.iter().rev() {
            stage.on_response(context, response).await?;
        }
        Ok(())
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the pipeline has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("stages", &self.stages.len()).finish()
    }
}

/// Injects a credential header unless the request already set one.
#[derive(Debug)]
pub struct AuthMiddleware {
    header: String,
    value: String,
}

impl AuthMiddleware {
    /// Build from the engine's auth configuration.
    pub fn new(auth: &AuthConfig) -> Self {
        match auth {
            AuthConfig::Bearer { token } => Self {
                header: "authorization".to_owned(),
                value: format!("Bearer {token}"),
            },
            AuthConfig::Header { name, value } => Self {
                header: name.to_lowercase(),
                value: value.clone(),
            },
        }
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn on_request(&self, context: &mut RequestContext) -> Result<(), RequestError> {
        context
            .headers
            .entry(self.header.clone())
            .or_insert_with(|| self.value.clone());
        Ok(())
    }
}

/// Applies engine-wide default headers; request headers take precedence.
#[derive(Debug, Default)]
pub struct DefaultHeaders {
    headers: BTreeMap<String, String>,
}

impl DefaultHeaders {
    /// Defaults from engine configuration.
    pub fn new(headers: BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

#[async_trait]
impl Middleware for DefaultHeaders {
    async fn on_request(&self, context: &mut RequestContext) -> Result<(), RequestError> {
        for (name, value) in &self.headers {
            context
                .headers
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{RequestDescriptor, Target};
    use serde_json::json;
    use std::sync::Mutex;

    fn context() -> RequestContext {
        RequestContext::from_descriptor(RequestDescriptor::new("/x"), &Target::new("api"))
    }

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_request: bool,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn on_request(&self, _context: &mut RequestContext) -> Result<(), RequestError> {
            self.log.lock().unwrap().push(format!("req:{}", self.name));
            if self.fail_request {
                return Err(RequestError::Validation {
                    field: "x".into(),
                    expected: "number",
                    actual: "missing".into(),
                });
            }
            Ok(())
        }

        async fn on_response(
            &self,
            _context: &RequestContext,
            _response: &mut RawResponse,
        ) -> Result<(), RequestError> {
            self.log.lock().unwrap().push(format!("resp:{}", self.name));
            Ok(())
        }
    }

    fn recorder(
        name: &'static str,
        log: &Arc<Mutex<Vec<String>>>,
        fail_request: bool,
    ) -> Arc<dyn Middleware> {
        Arc::new(Recorder { name, log: Arc::clone(log), fail_request })
    }

    #[tokio::test]
    async fn onion_ordering() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            recorder("a", &log, false),
            recorder("b", &log, false),
            recorder("c", &log, false),
        ]);

        let mut ctx = context();
        pipeline.request_phase(&mut ctx).await.unwrap();
        let mut response = RawResponse::ok(json!({}));
        pipeline.response_phase(&ctx, &mut response).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            ["req:a", "req:b", "req:c", "resp:c", "resp:b", "resp:a"]
        );
    }

    #[tokio::test]
    async fn request_error_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            recorder("a", &log, false),
            recorder("b", &log, true),
            recorder("c", &log, false),
        ]);

        let mut ctx = context();
        let err = pipeline.request_phase(&mut ctx).await.unwrap_err();
        assert!(matches!(err, RequestError::Validation { .. }));
        // "c" never ran.
        assert_eq!(*log.lock().unwrap(), ["req:a", "req:b"]);
    }

    #[tokio::test]
    async fn auth_respects_existing_header() {
        let auth = AuthMiddleware::new(&AuthConfig::Bearer { token: "t0k".into() });

        let mut ctx = context();
        auth.on_request(&mut ctx).await.unwrap();
        assert_eq!(ctx.headers["authorization"], "Bearer t0k");

        let mut ctx = context();
        ctx.headers.insert("authorization".into(), "Bearer mine".into());
        auth.on_request(&mut ctx).await.unwrap();
        assert_eq!(ctx.headers["authorization"], "Bearer mine");
    }

    #[tokio::test]
    async fn default_headers_do_not_override() {
        let mut defaults = BTreeMap::new();
        defaults.insert("user-agent".to_owned(), "fanout/0.1".to_owned());
        defaults.insert("accept".to_owned(), "application/json".to_owned());
        let middleware = DefaultHeaders::new(defaults);

        let mut ctx = context();
        ctx.headers.insert("accept".into(), "text/csv".into());
        middleware.on_request(&mut ctx).await.unwrap();
        assert_eq!(ctx.headers["user-agent"], "fanout/0.1");
        assert_eq!(ctx.headers["accept"], "text/csv");
    }
}
