// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Default system prompts for the interaction modes.
//!
//! Callers may override any of these through the run configuration; these
//! are the defaults the interaction manager wires when nothing is supplied.

use conductor_tools::{ToolDefinition, ToolsetInfo};

/// System prompt for the generic single-provider mode: describes the
/// available tools and basic usage discipline.
pub fn generic_tools_prompt(tools: &[ToolDefinition]) -> String {
    let mut prompt = String::from(
        "You are a capable assistant. You can call the tools listed below to \
         fulfil the user's request. Use a tool whenever it provides \
         information you would otherwise have to guess. When no tool is \
         needed, answer directly and concisely.\n",
    );
    if tools.is_empty() {
        prompt.push_str("\nNo tools are currently available; answer from your own knowledge.");
        return prompt;
    }
    prompt.push_str("\nAvailable tools:\n");
    for tool in tools {
        prompt.push_str(&format!("- {}: {}\n", tool.name, tool.description));
    }
    prompt.push_str(
        "\nAlways provide tool arguments as a JSON object matching the tool's \
         parameter schema.",
    );
    prompt
}

/// System prompt for the planning agent: plan, delegate to specialists,
/// observe their results, and synthesize the final answer.
pub fn planner_prompt(toolsets: &[ToolsetInfo]) -> String {
    let mut prompt = String::from(
        "You are a planning agent. You do not execute domain work yourself; \
         you break the user's request into focused sub-tasks and delegate \
         each one to a specialist using the `delegateToSpecialistAgent` tool. \
         Observe each specialist's output, delegate follow-up sub-tasks when \
         needed, and finally synthesize a complete answer for the user.\n\
         \nAvailable specialists:\n",
    );
    for set in toolsets {
        prompt.push_str(&format!("- {}: {}\n", set.id, set.description));
    }
    prompt.push_str(
        "\nDescribe each sub-task precisely and include any output format \
         the specialist must follow. Do not invent specialists that are not \
         listed.",
    );
    prompt
}

/// System prompt for a specialist worker spawned by the delegate tool.
pub fn specialist_prompt(toolset: &ToolsetInfo, required_output_format: Option<&str>) -> String {
    let mut prompt = format!(
        "You are a specialist agent for the `{}` toolset: {}. Complete the \
         assigned sub-task using your tools and reply with the result as \
         plain text. Stay within the scope of the sub-task.",
        toolset.id, toolset.description
    );
    if let Some(format) = required_output_format {
        prompt.push_str(&format!("\n\nRequired output format: {format}"));
    }
    prompt
}

/// System prompt for the legacy router mode: one synthetic tool fronts every
/// toolset.
pub fn toolsets_router_prompt(toolsets: &[ToolsetInfo]) -> String {
    let mut prompt = String::from(
        "You are a capable assistant. All capabilities are exposed through \
         the single `invokeToolsetTool` tool: pass the toolset id, the tool \
         name within that set, and the tool's parameters.\n\
         \nAvailable toolsets:\n",
    );
    for set in toolsets {
        prompt.push_str(&format!("- {}: {}\n", set.id, set.description));
    }
    prompt
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
