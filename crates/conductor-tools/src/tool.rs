// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single tool invocation requested by the model.
///
/// `arguments` is the raw JSON string exactly as assembled from the stream;
/// it is parsed only at the validation boundary and echoed back verbatim in
/// logs and events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Opaque identifier issued by the model (echoed back with the result)
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// One declared parameter of a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    /// Declared JSON type (`string`, `number`, `object`, …).
    pub param_type: String,
    pub required: bool,
    #[serde(default)]
    pub description: String,
    /// Optional JSON-Schema fragment overriding the plain declared type.
    /// May contain local `$ref`s into the tool's component registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

impl ToolParameter {
    pub fn new(name: impl Into<String>, param_type: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            required,
            description: String::new(),
            schema: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    /// The effective schema fragment for this parameter.
    pub fn effective_schema(&self) -> Value {
        match &self.schema {
            Some(s) => s.clone(),
            None => serde_json::json!({
                "type": self.param_type,
                "description": self.description,
            }),
        }
    }
}

/// Static description of a tool: name, human description, ordered parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self { name: name.into(), description: description.into(), parameters: Vec::new() }
    }

    pub fn with_parameter(mut self, parameter: ToolParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Object-level JSON Schema over all declared parameters.
    pub fn parameters_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for p in &self.parameters {
            properties.insert(p.name.clone(), p.effective_schema());
            if p.required {
                required.push(Value::String(p.name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// The result of executing a tool.
///
/// On success `data` carries an arbitrary JSON-serializable payload; on
/// failure `data` is `None` and `error` holds the message.  `metadata` is a
/// free-form side channel (sub-agent run ids, error class names, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl ToolResult {
    /// Successful result with a payload.
    pub fn ok(data: impl Into<Value>) -> Self {
        Self { success: true, data: Some(data.into()), error: None, metadata: None }
    }

    /// Failed result with an error message.
    pub fn fail(error: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(error.into()), metadata: None }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Insert a single metadata entry, creating the map if needed.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// Fetch a string metadata entry.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key)?.as_str()
    }
}

/// Call context handed to every tool execution.
///
/// Carries the owning run/thread identity plus opaque metadata (for example
/// authentication material a provider stashed at construction).  Cloneable so
/// parallel dispatch can hand each task its own copy.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub run_id: String,
    pub thread_id: String,
    pub metadata: Map<String, Value>,
}

impl ToolContext {
    pub fn new(run_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self { run_id: run_id.into(), thread_id: thread_id.into(), metadata: Map::new() }
    }
}

/// Trait that every tool must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Execute with already-validated JSON arguments.  Errors should be
    /// reported through [`ToolResult::fail`], not panics.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult;

    /// Optional OpenAPI-like component registry
    /// (`{"components":{"schemas":{…}}}`) used for `$ref` resolution in this
    /// tool's parameter schemas.
    fn openapi_components(&self) -> Option<Value> {
        None
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
