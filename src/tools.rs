//! Tool definition system for LLM function calling.
//!
//! A tool is a named capability with a JSON Schema describing its input and an
//! optional async handler. Tools without a handler are *declared but not
//! locally executable* — the agent loop answers such calls with a tool error
//! and lets the model recover.
//!
//! # Schema construction
//!
//! Rust has no runtime reflection to inspect a handler's signature, so the
//! schema is declared alongside the handler with a small parameter builder.
//! The type mapping matches what providers expect:
//!
//! | [`ParamType`] | JSON Schema |
//! |---|---|
//! | `String` | `{"type": "string"}` |
//! | `Integer` | `{"type": "integer"}` |
//! | `Number` | `{"type": "number"}` |
//! | `Boolean` | `{"type": "boolean"}` |
//! | `Array(T)` | `{"type": "array", "items": T}` |
//! | `AnyOf([T...])` | `{"anyOf": [T...]}` |
//!
//! Required parameters are those added with [`ToolBuilder::param`];
//! [`ToolBuilder::optional_param`] leaves the parameter out of `required`.
//!
//! # Example
//!
//! ```no_run
//! use universal_agent::tools::{tool, ParamType};
//! use serde_json::json;
//!
//! let add = tool("add", "Add two numbers")
//!     .param("a", ParamType::Number)
//!     .param("b", ParamType::Number)
//!     .handler(|input| async move {
//!         let a = input["a"].as_f64().unwrap_or(0.0);
//!         let b = input["b"].as_f64().unwrap_or(0.0);
//!         Ok(json!(a + b))
//!     })
//!     .build();
//! ```

use crate::{Error, Result};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Async tool handler: JSON input object in, JSON result out.
///
/// Wrapped in `Arc` so tool definitions clone cheaply and can be shared across
/// sessions. Handlers that keep internal state are responsible for their own
/// locking.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// Parameter types understood by the schema builder.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array(Box<ParamType>),
    AnyOf(Vec<ParamType>),
}

impl ParamType {
    /// Render this parameter type as a JSON Schema fragment.
    pub fn to_schema(&self) -> Value {
        match self {
            ParamType::String => json!({"type": "string"}),
            ParamType::Integer => json!({"type": "integer"}),
            ParamType::Number => json!({"type": "number"}),
            ParamType::Boolean => json!({"type": "boolean"}),
            ParamType::Array(items) => json!({"type": "array", "items": items.to_schema()}),
            ParamType::AnyOf(types) => {
                let schemas: Vec<Value> = types.iter().map(|t| t.to_schema()).collect();
                json!({"anyOf": schemas})
            }
        }
    }
}

/// A named tool with its input schema and optional handler.
#[derive(Clone)]
pub struct ToolDefinition {
    name: String,
    description: String,
    input_schema: Value,
    handler: Option<ToolHandler>,
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl ToolDefinition {
    /// Create a tool from pre-built parts. Prefer the [`tool`] builder for
    /// schema construction.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: Option<ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Invoke the handler with a JSON input object.
    ///
    /// Fails with [`Error::Tool`] when the tool was declared without a
    /// handler.
    pub async fn execute(&self, input: Value) -> Result<Value> {
        match &self.handler {
            Some(handler) => handler(input).await,
            None => Err(Error::tool(format!("tool '{}' has no handler", self.name))),
        }
    }
}

/// Start building a tool definition.
pub fn tool(name: impl Into<String>, description: impl Into<String>) -> ToolBuilder {
    ToolBuilder {
        name: name.into(),
        description: description.into(),
        properties: Map::new(),
        required: Vec::new(),
        schema: None,
        handler: None,
    }
}

/// Builder returned by [`tool`].
pub struct ToolBuilder {
    name: String,
    description: String,
    properties: Map<String, Value>,
    required: Vec<String>,
    schema: Option<Value>,
    handler: Option<ToolHandler>,
}

impl ToolBuilder {
    /// Add a required parameter.
    pub fn param(mut self, name: impl Into<String>, ty: ParamType) -> Self {
        let name = name.into();
        self.properties.insert(name.clone(), ty.to_schema());
        self.required.push(name);
        self
    }

    /// Add an optional parameter (same schema, excluded from `required`).
    pub fn optional_param(mut self, name: impl Into<String>, ty: ParamType) -> Self {
        self.properties.insert(name.into(), ty.to_schema());
        self
    }

    /// Attach a description to a previously declared parameter.
    pub fn describe(mut self, name: &str, description: impl Into<String>) -> Self {
        if let Some(Value::Object(prop)) = self.properties.get_mut(name) {
            prop.insert("description".to_string(), json!(description.into()));
        }
        self
    }

    /// Replace the generated schema with a full JSON Schema object.
    pub fn schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Attach an async handler.
    pub fn handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |input| Box::pin(handler(input))));
        self
    }

    /// Attach a synchronous handler, wrapped into the async handler type at
    /// registration so the engine awaits every tool uniformly.
    pub fn handler_sync<F>(mut self, handler: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(move |input| {
            let result = handler(input);
            Box::pin(async move { result })
        }));
        self
    }

    pub fn build(self) -> ToolDefinition {
        let input_schema = self.schema.unwrap_or_else(|| {
            let mut schema = Map::new();
            schema.insert("type".to_string(), json!("object"));
            schema.insert("properties".to_string(), Value::Object(self.properties));
            if !self.required.is_empty() {
                schema.insert("required".to_string(), json!(self.required));
            }
            Value::Object(schema)
        });

        ToolDefinition {
            name: self.name,
            description: self.description,
            input_schema,
            handler: self.handler,
        }
    }
}

/// Name-indexed tool collection used when resolving tool calls.
///
/// Re-registering a name replaces the previous definition.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolDefinition>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a slice of shared definitions, preserving order.
    pub fn from_tools(tools: &[Arc<ToolDefinition>]) -> Self {
        let mut registry = Self::new();
        for tool in tools {
            registry.register_arc(Arc::clone(tool));
        }
        registry
    }

    pub fn register(&mut self, tool: ToolDefinition) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<ToolDefinition>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Result<&Arc<ToolDefinition>> {
        self.tools
            .get(name)
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))
    }

    /// All definitions in registration order, for provider request building.
    pub fn definitions(&self) -> Vec<Arc<ToolDefinition>> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.order)
            .finish()
    }
}

/// Stringify a handler result for the conversation history: strings pass
/// through verbatim, everything else is JSON-encoded.
pub(crate) fn stringify_result(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_type_mapping() {
        assert_eq!(ParamType::String.to_schema(), json!({"type": "string"}));
        assert_eq!(ParamType::Integer.to_schema(), json!({"type": "integer"}));
        assert_eq!(ParamType::Number.to_schema(), json!({"type": "number"}));
        assert_eq!(ParamType::Boolean.to_schema(), json!({"type": "boolean"}));
        assert_eq!(
            ParamType::Array(Box::new(ParamType::String)).to_schema(),
            json!({"type": "array", "items": {"type": "string"}})
        );
        assert_eq!(
            ParamType::AnyOf(vec![ParamType::String, ParamType::Integer]).to_schema(),
            json!({"anyOf": [{"type": "string"}, {"type": "integer"}]})
        );
    }

    #[test]
    fn test_builder_schema_shape() {
        let definition = tool("search", "Search the web")
            .param("query", ParamType::String)
            .optional_param("limit", ParamType::Integer)
            .describe("query", "What to search for")
            .build();

        let schema = definition.input_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["query"]["type"], "string");
        assert_eq!(
            schema["properties"]["query"]["description"],
            "What to search for"
        );
        assert_eq!(schema["properties"]["limit"]["type"], "integer");
        assert_eq!(schema["required"], json!(["query"]));
    }

    #[test]
    fn test_builder_no_required_params() {
        let definition = tool("now", "Current time").build();
        assert!(definition.input_schema().get("required").is_none());
    }

    #[tokio::test]
    async fn test_execute_async_handler() {
        let definition = tool("double", "Double a number")
            .param("n", ParamType::Number)
            .handler(|input| async move {
                let n = input["n"].as_f64().unwrap_or(0.0);
                Ok(json!(n * 2.0))
            })
            .build();

        let result = definition.execute(json!({"n": 21})).await.unwrap();
        assert_eq!(result, json!(42.0));
    }

    #[tokio::test]
    async fn test_execute_sync_handler() {
        let definition = tool("upper", "Uppercase a string")
            .param("s", ParamType::String)
            .handler_sync(|input| {
                let s = input["s"].as_str().unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .build();

        let result = definition.execute(json!({"s": "hi"})).await.unwrap();
        assert_eq!(result, json!("HI"));
    }

    #[tokio::test]
    async fn test_execute_without_handler() {
        let definition = tool("declared_only", "No local handler").build();
        let err = definition.execute(json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Tool(_)));
    }

    #[test]
    fn test_registry_lookup_and_replace() {
        let mut registry = ToolRegistry::new();
        registry.register(tool("a", "first").build());
        registry.register(tool("b", "second").build());
        assert_eq!(registry.len(), 2);

        assert!(registry.get("a").is_ok());
        assert!(matches!(
            registry.get("missing"),
            Err(Error::ToolNotFound(_))
        ));

        // Re-registration replaces, order is preserved
        registry.register(tool("a", "replaced").build());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("a").unwrap().description(), "replaced");
        let names: Vec<_> = registry
            .definitions()
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_stringify_result() {
        assert_eq!(stringify_result(&json!("plain")), "plain");
        assert_eq!(stringify_result(&json!({"x": 1})), r#"{"x":1}"#);
        assert_eq!(stringify_result(&json!(5)), "5");
    }
}
