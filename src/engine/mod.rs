//! Seam between the subscription machinery and the GraphQL execution engine.
//!
//! The engine itself is a black box: the manager only needs to know which
//! root fields the schema's subscription type exposes and how to execute one
//! subscription document against one event payload.

pub mod document;
mod schema;

pub use document::{subscription_target, DocumentError};
pub use schema::{AsyncGraphQlExecutor, EventContext, EventPayload};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// One execution of a subscription document for one published event.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub query: String,
    /// The published payload
    pub root_value: Value,
    /// Server-level context, passed through opaquely
    pub context: Value,
    pub variables: Map<String, Value>,
    pub operation_name: Option<String>,
}

/// Engine output: `data` is `None` when execution produced no data at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub data: Option<Value>,
    pub errors: Vec<GraphQlError>,
}

impl ExecutionResult {
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            data: None,
            errors: vec![GraphQlError::new(message)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

/// Engine-neutral GraphQL error
#[derive(Debug, Clone, PartialEq)]
pub struct GraphQlError {
    pub message: String,
    pub locations: Vec<Location>,
    pub path: Option<Value>,
    pub extensions: Option<Value>,
}

impl GraphQlError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: Vec::new(),
            path: None,
            extensions: None,
        }
    }
}

impl fmt::Display for GraphQlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Turns an engine error into the JSON placed in a frame's `errors` list.
pub type ErrorFormatter = Arc<dyn Fn(&GraphQlError) -> Value + Send + Sync>;

/// Default error formatting: `message`, plus `locations` and `path` when
/// known, plus `validation` when the error carries validator messages in its
/// extensions.
pub fn format_error(error: &GraphQlError) -> Value {
    let mut formatted = Map::new();
    formatted.insert("message".to_string(), Value::String(error.message.clone()));

    if !error.locations.is_empty() {
        formatted.insert("locations".to_string(), json!(error.locations));
    }
    if let Some(path) = &error.path {
        formatted.insert("path".to_string(), path.clone());
    }
    if let Some(validation) = error
        .extensions
        .as_ref()
        .and_then(|ext| ext.get("validation"))
    {
        formatted.insert("validation".to_string(), validation.clone());
    }

    Value::Object(formatted)
}

pub fn default_error_formatter() -> ErrorFormatter {
    Arc::new(format_error)
}

/// The execution engine as seen by the subscription manager.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Whether the schema's subscription root type has a field `name`.
    fn has_subscription_field(&self, name: &str) -> bool;

    /// Check a subscription document against the schema before it is
    /// registered. Engines that cannot validate up front accept everything.
    async fn validate(
        &self,
        _query: &str,
        _variables: &Map<String, Value>,
        _operation_name: Option<&str>,
    ) -> Result<(), Vec<GraphQlError>> {
        Ok(())
    }

    /// Execute a subscription document with the event payload as root value.
    ///
    /// Resolver failures are reported in the result, never as a panic or an
    /// `Err`.
    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("schema '{0}' not found")]
pub struct SchemaNotFound(pub String);

/// Named schemas, built once at startup.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<dyn Executor>>,
    default_schema: String,
}

impl SchemaRegistry {
    pub fn new(default_schema: impl Into<String>) -> Self {
        Self {
            schemas: HashMap::new(),
            default_schema: default_schema.into(),
        }
    }

    pub fn with_schema(mut self, name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        self.schemas.insert(name.into(), executor);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Executor>, SchemaNotFound> {
        self.schemas
            .get(name)
            .cloned()
            .ok_or_else(|| SchemaNotFound(name.to_string()))
    }

    /// The schema selected by configuration.
    pub fn default_schema(&self) -> Result<Arc<dyn Executor>, SchemaNotFound> {
        self.get(&self.default_schema)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.schemas.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
