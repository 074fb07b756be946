//! Local tool definitions.
//!
//! A [`LocalTool`] pairs a spec-level [`ToolDefinition`] with an async
//! handler. Handlers are type-erased (`Arc<dyn Fn(Value) -> Pin<Box<dyn
//! Future ...>>>`) so tools with different concrete futures can live in one
//! registry and be invoked concurrently across tasks.
//!
//! Schemas may be written in three notations, all normalised to a draft-07
//! object schema at definition time:
//!
//! - simple type notation: `{"command": "string"}` (everything required)
//! - extended property maps: `{"limit": {"type": "integer", "optional": true}}`
//! - full JSON Schema: passed through unchanged
//!
//! # Example
//!
//! ```
//! use agent_kernel::local_tool;
//! use serde_json::json;
//!
//! let shell = local_tool("shell_command", "Run a shell command")
//!     .param("command", "string")
//!     .build(|args| async move {
//!         let command = args["command"].as_str().unwrap_or_default().to_string();
//!         Ok(json!({"stdout": format!("ran {command}")}))
//!     });
//! assert_eq!(shell.definition().name, "shell_command");
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::Result;
use crate::types::{ApprovalMode, ToolDefinition};

/// Type-erased async tool handler.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// An in-process tool: a definition plus the handler that implements it.
#[derive(Clone)]
pub struct LocalTool {
    definition: ToolDefinition,
    handler: ToolHandler,
}

impl LocalTool {
    /// Create a tool from a name, description, flexible schema and handler.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameter_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let definition = ToolDefinition::new(
            name,
            description,
            normalize_schema(parameter_schema),
        );
        Self {
            definition,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    /// Create a tool from an already-built definition and a handler.
    ///
    /// The definition's schema is normalised like every other notation.
    pub fn from_definition<F, Fut>(mut definition: ToolDefinition, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        definition.parameter_schema = normalize_schema(definition.parameter_schema);
        Self {
            definition,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    /// The tool's definition.
    pub fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    /// The tool's name.
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Run the handler with already-validated arguments.
    pub async fn execute(&self, arguments: Value) -> Result<Value> {
        (self.handler)(arguments).await
    }

    /// Mark the tool as requiring approval under `default` mode.
    pub fn with_approval_required(mut self, required: bool) -> Self {
        self.definition.approval_required = required;
        self
    }

    /// Override the tool's approval mode.
    pub fn with_approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.definition.approval_mode = mode;
        self
    }

    /// Override the tool's timeout.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.definition.timeout_secs = Some(secs);
        self
    }
}

/// The handler is not debuggable; show the definition only.
impl std::fmt::Debug for LocalTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTool")
            .field("definition", &self.definition)
            .finish()
    }
}

/// Start building a tool with a fluent API.
///
/// ```
/// use agent_kernel::local_tool;
/// use serde_json::json;
///
/// let add = local_tool("add", "Add two numbers")
///     .param("a", "number")
///     .param("b", "number")
///     .build(|args| async move {
///         let a = args["a"].as_f64().unwrap_or(0.0);
///         let b = args["b"].as_f64().unwrap_or(0.0);
///         Ok(json!({"result": a + b}))
///     });
/// ```
pub fn local_tool(name: impl Into<String>, description: impl Into<String>) -> LocalToolBuilder {
    LocalToolBuilder::new(name, description)
}

/// Builder for [`LocalTool`] with incremental parameters.
pub struct LocalToolBuilder {
    name: String,
    description: String,
    schema: Value,
    approval_required: bool,
    approval_mode: ApprovalMode,
    timeout_secs: Option<u64>,
}

impl LocalToolBuilder {
    /// Start a builder with a name and description.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: serde_json::json!({}),
            approval_required: false,
            approval_mode: ApprovalMode::Default,
            timeout_secs: None,
        }
    }

    /// Replace the whole schema (any supported notation).
    pub fn schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    /// Add a required parameter with a simple type string
    /// (`string` / `number` / `integer` / `boolean` / `array` / `object`).
    pub fn param(mut self, name: impl Into<String>, type_str: &str) -> Self {
        if !self.schema.is_object() {
            self.schema = serde_json::json!({});
        }
        if let Some(obj) = self.schema.as_object_mut() {
            obj.insert(name.into(), Value::String(type_str.to_string()));
        }
        self
    }

    /// Add an optional parameter with a simple type string.
    pub fn optional_param(mut self, name: impl Into<String>, type_str: &str) -> Self {
        if !self.schema.is_object() {
            self.schema = serde_json::json!({});
        }
        if let Some(obj) = self.schema.as_object_mut() {
            obj.insert(
                name.into(),
                serde_json::json!({"type": type_str, "optional": true}),
            );
        }
        self
    }

    /// Require approval under `default` mode.
    pub fn approval_required(mut self) -> Self {
        self.approval_required = true;
        self
    }

    /// Set the approval mode.
    pub fn approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = mode;
        self
    }

    /// Set the per-tool timeout.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Finalise with the handler.
    pub fn build<F, Fut>(self, handler: F) -> LocalTool
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let mut tool = LocalTool::new(self.name, self.description, self.schema, handler);
        tool.definition.approval_required = self.approval_required;
        tool.definition.approval_mode = self.approval_mode;
        tool.definition.timeout_secs = self.timeout_secs;
        tool
    }
}

/// Normalise any supported schema notation into a draft-07 object schema.
///
/// A map that already has `type` and `properties` passes through unchanged.
/// Otherwise each entry is either a simple type string (required) or an
/// extended property map whose `optional` / `required` markers and `default`
/// decide membership in the `required` array; the non-standard markers are
/// stripped from the emitted schema.
pub fn normalize_schema(schema: Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        });
    };

    if obj.contains_key("type") && obj.contains_key("properties") {
        return schema;
    }

    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();

    for (param_name, param_spec) in obj {
        if let Some(type_str) = param_spec.as_str() {
            properties.insert(param_name.clone(), type_to_schema(type_str));
            required.push(param_name.clone());
        } else if param_spec.is_object() {
            let mut prop = param_spec.clone();
            let prop_obj = prop.as_object_mut().expect("checked is_object");

            let is_optional = prop_obj
                .remove("optional")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let is_required = prop_obj.remove("required").and_then(|v| v.as_bool());
            let has_default = prop_obj.contains_key("default");

            properties.insert(param_name.clone(), prop);

            if is_required == Some(true) {
                required.push(param_name.clone());
            } else if is_optional || is_required == Some(false) {
                // explicitly optional
            } else if !has_default {
                required.push(param_name.clone());
            }
        }
    }

    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

fn type_to_schema(type_str: &str) -> Value {
    let json_type = match type_str {
        "string" | "str" => "string",
        "integer" | "int" | "i32" | "i64" | "u32" | "u64" => "integer",
        "number" | "float" | "f32" | "f64" => "number",
        "boolean" | "bool" => "boolean",
        "array" | "list" | "vec" => "array",
        "object" | "dict" | "map" => "object",
        _ => "string",
    };
    serde_json::json!({ "type": json_type })
}
