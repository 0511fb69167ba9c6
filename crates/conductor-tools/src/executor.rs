// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ToolError;
use crate::provider::ToolProvider;
use crate::schema::{resolve_refs, SchemaRegistry};
use crate::tool::{ToolCall, ToolContext, ToolResult};

/// How a batch of tool calls from one turn is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    #[default]
    Sequential,
    Parallel,
}

/// One slot of the executor's output: the call identity plus its result.
/// Slots are returned in input order regardless of strategy.
#[derive(Debug, Clone)]
pub struct ExecutedToolCall {
    pub tool_call_id: String,
    pub tool_name: String,
    pub result: ToolResult,
}

/// Validates and runs batches of tool calls against a provider.
pub struct ToolExecutor {
    provider: Arc<dyn ToolProvider>,
    strategy: ExecutionStrategy,
}

impl ToolExecutor {
    pub fn new(provider: Arc<dyn ToolProvider>, strategy: ExecutionStrategy) -> Self {
        Self { provider, strategy }
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    /// Execute every call in `calls`, returning one result slot per call in
    /// input order.  A call never raises out of its slot: lookup failures,
    /// argument errors, validation errors, and task panics all become
    /// non-success results.
    pub async fn execute_batch(
        &self,
        calls: &[ToolCall],
        ctx: &ToolContext,
    ) -> Vec<ExecutedToolCall> {
        match self.strategy {
            ExecutionStrategy::Sequential => {
                let mut out = Vec::with_capacity(calls.len());
                for call in calls {
                    out.push(self.run_isolated(call.clone(), ctx.clone()).await);
                }
                out
            }
            ExecutionStrategy::Parallel => {
                // Dispatch all tasks, then join in input order.  Each task
                // gets a cloned Arc to the provider; tasks are isolated so
                // one panic does not cancel the others.
                let tasks: Vec<_> = calls
                    .iter()
                    .map(|call| {
                        let provider = Arc::clone(&self.provider);
                        let call = call.clone();
                        let ctx = ctx.clone();
                        tokio::spawn(async move { dispatch_one(provider, &call, &ctx).await })
                    })
                    .collect();

                let mut out = Vec::with_capacity(calls.len());
                for (call, task) in calls.iter().zip(tasks) {
                    let result = match task.await {
                        Ok(result) => result,
                        Err(e) => ToolResult::fail(format!("tool execution panicked: {e}"))
                            .meta("errorName", "PanicError"),
                    };
                    out.push(ExecutedToolCall {
                        tool_call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        result,
                    });
                }
                out
            }
        }
    }

    /// Run one call in its own task so a panicking tool cannot tear down the
    /// agent loop in sequential mode either.
    async fn run_isolated(&self, call: ToolCall, ctx: ToolContext) -> ExecutedToolCall {
        let provider = Arc::clone(&self.provider);
        let id = call.id.clone();
        let name = call.name.clone();
        let result =
            match tokio::spawn(async move { dispatch_one(provider, &call, &ctx).await }).await {
                Ok(result) => result,
                Err(e) => ToolResult::fail(format!("tool execution panicked: {e}"))
                    .meta("errorName", "PanicError"),
            };
        ExecutedToolCall { tool_call_id: id, tool_name: name, result }
    }
}

/// Validate one call and invoke its tool.
async fn dispatch_one(
    provider: Arc<dyn ToolProvider>,
    call: &ToolCall,
    ctx: &ToolContext,
) -> ToolResult {
    let Some(tool) = provider.get_tool(&call.name) else {
        return ToolError::NotFound { name: call.name.clone() }.into_result();
    };

    let args: Value = match serde_json::from_str(&call.arguments) {
        Ok(v) => v,
        Err(e) => {
            return ToolError::InvalidArguments {
                reason: e.to_string(),
                raw: call.arguments.clone(),
            }
            .into_result();
        }
    };

    let definition = tool.definition();
    let registry = tool
        .openapi_components()
        .map(|c| SchemaRegistry::from_components(&c))
        .unwrap_or_default();

    let mut errors = Vec::new();
    for param in &definition.parameters {
        let value = args.get(&param.name);
        if param.required && value.is_none() {
            errors.push(format!("missing required parameter: {}", param.name));
            continue;
        }
        let (Some(value), Some(schema)) = (value, &param.schema) else {
            continue;
        };
        let resolved = resolve_refs(schema, &registry);
        validate_value(&param.name, value, &resolved, &mut errors);
    }
    if !errors.is_empty() {
        return ToolError::Validation { errors }.into_result();
    }

    debug!(tool = %call.name, call_id = %call.id, "dispatching tool call");
    // The executing tool sees which call it is answering (sub-agent spawners
    // tag their worker threads with it).
    let mut ctx = ctx.clone();
    ctx.metadata
        .insert("toolCallId".into(), Value::String(call.id.clone()));
    tool.execute(args, &ctx).await
}

/// Compile `schema` and collect every validation error for `value`.
///
/// The validator is configured to report all errors and to check standard
/// string formats (date-time, uri, uuid, …).  A schema that fails to compile
/// is itself a validation error — a tool shipping a broken schema must not
/// silently accept arbitrary arguments.
fn validate_value(param: &str, value: &Value, schema: &Value, errors: &mut Vec<String>) {
    let validator = match jsonschema::options()
        .should_validate_formats(true)
        .build(schema)
    {
        Ok(v) => v,
        Err(e) => {
            errors.push(format!("parameter {param}: schema failed to compile: {e}"));
            return;
        }
    };
    for e in validator.iter_errors(value) {
        errors.push(format!(
            "{} {} (schema path: {})",
            e.instance_path(), e, e.schema_path()
        ));
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
