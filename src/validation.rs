//! Declared-shape validation middleware.
//!
//! A [`Schema`] maps field names to the JSON shape each must have. The
//! middleware checks request params in the request phase and the response
//! body in the response phase. Violations surface as
//! [`RequestError::Validation`], which never retries and never counts
//! against the circuit breaker.

use crate::context::RequestContext;
use crate::error::RequestError;
use crate::middleware::Middleware;
use crate::transport::RawResponse;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// JSON shape a declared field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldShape {
    /// JSON string.
    String,
    /// JSON number, integral or floating.
    Number,
    /// JSON boolean.
    Boolean,
    /// JSON array.
    Array,
    /// JSON object.
    Object,
}

impl FieldShape {
    /// Shape name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            FieldShape::String => "string",
            FieldShape::Number => "number",
            FieldShape::Boolean => "boolean",
            FieldShape::Array => "array",
            FieldShape::Object => "object",
        }
    }

    /// Whether `value` has this shape.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            FieldShape::String => value.is_string(),
            FieldShape::Number => value.is_number(),
            FieldShape::Boolean => value.is_boolean(),
            FieldShape::Array => value.is_array(),
            FieldShape::Object => value.is_object(),
        }
    }
}

fn shape_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Declared fields and their required shapes. Every declared field is
/// required; undeclared fields pass through unchecked.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: BTreeMap<String, FieldShape>,
}

impl Schema {
    /// Empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a required field.
    pub fn field(mut self, name: impl Into<String>, shape: FieldShape) -> Self {
        self.fields.insert(name.into(), shape);
        self
    }

    /// Check a parameter map against the declared fields.
    pub fn check_params(&self, params: &BTreeMap<String, Value>) -> Result<(), RequestError> {
        for (name, shape) in &self.fields {
            match params.get(name) {
                None => return Err(violation(name, *shape, "missing")),
                Some(value) if !shape.matches(value) => {
                    return Err(violation(name, *shape, shape_of(value)));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Check a response body. Declared fields must exist at the top level of
    /// the body object with the declared shape.
    pub fn check_body(&self, body: &Value) -> Result<(), RequestError> {
        for (name, shape) in &self.fields {
            match body.get(name) {
                None => return Err(violation(name, *shape, "missing")),
                Some(value) if !shape.matches(value) => {
                    return Err(violation(name, *shape, shape_of(value)));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

fn violation(field: &str, expected: FieldShape, actual: &str) -> RequestError {
    RequestError::Validation {
        field: field.to_owned(),
        expected: expected.name(),
        actual: actual.to_owned(),
    }
}

/// Middleware enforcing request and response schemas.
#[derive(Debug, Default)]
pub struct ValidationMiddleware {
    params: Option<Schema>,
    response: Option<Schema>,
}

impl ValidationMiddleware {
    /// Validate nothing until schemas are attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require request params to match `schema`.
    pub fn params(mut self, schema: Schema) -> Self {
        self.params = Some(schema);
        self
    }

    /// Require response bodies to match `schema`.
    pub fn response(mut self, schema: Schema) -> Self {
        self.response = Some(schema);
        self
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    async fn on_request(&self, context: &mut RequestContext) -> Result<(), RequestError> {
        if let Some(schema) = &self.params {
            schema.check_params(&context.params)?;
        }
        Ok(())
    }

    async fn on_response(
        &self,
        _context: &RequestContext,
        response: &mut RawResponse,
    ) -> Result<(), RequestError> {
        if let Some(schema) = &self.response {
            schema.check_body(&response.body)?;
        }
        Ok(())
    }
}
