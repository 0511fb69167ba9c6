// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod error;
pub mod executor;
pub mod provider;
pub mod schema;
pub mod tool;

pub use error::ToolError;
pub use executor::{ExecutedToolCall, ExecutionStrategy, ToolExecutor};
pub use provider::{
    CompositeToolProvider, StaticToolProvider, StaticToolsetOrchestrator, ToolProvider,
    ToolsetInfo, ToolsetOrchestrator,
};
pub use schema::{resolve_refs, SchemaRegistry};
pub use tool::{Tool, ToolCall, ToolContext, ToolDefinition, ToolParameter, ToolResult};
