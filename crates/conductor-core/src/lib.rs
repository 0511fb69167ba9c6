// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod agent;
mod context;
mod delegate;
mod errors;
mod events;
mod manager;
mod processor;
mod prompts;
#[cfg(test)]
mod tests;

pub use agent::{AgentRunner, CancelFlag, RunContext, ToolOutputSubmission};
pub use context::{ContextManager, SUMMARY_FOOTER, SUMMARY_HEADER};
pub use delegate::{DelegateToSpecialistTool, DELEGATE_TOOL_NAME};
pub use errors::{codes, CoreError};
pub use events::{event_stream, EventEnvelope, MessageDelta, RunEvent, SubAgentNotice};
pub use manager::{InteractionManager, InteractionMode, ManagerConfig, ToolsetRouterTool};
pub use processor::{ParsedEvent, ResponseProcessor};
pub use prompts::{
    generic_tools_prompt, planner_prompt, specialist_prompt, toolsets_router_prompt,
};
