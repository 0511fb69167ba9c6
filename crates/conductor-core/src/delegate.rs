// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use conductor_model::{ChatRole, LlmClient};
use conductor_store::{
    AgentKind, MemoryStores, NewMessage, NewRun, NewThread, RunConfig, RunStore, ThreadStore,
};
use conductor_tools::{
    Tool, ToolContext, ToolDefinition, ToolParameter, ToolResult, ToolsetOrchestrator,
};

use crate::agent::{AgentRunner, CancelFlag, RunContext};
use crate::errors::codes;
use crate::events::{RunEvent, SubAgentNotice};
use crate::prompts::specialist_prompt;

pub const DELEGATE_TOOL_NAME: &str = "delegateToSpecialistAgent";

/// How much smaller a worker's continuation budget is than its parent's.
const WORKER_CONTINUATION_DECREMENT: u32 = 2;

/// Planner-side tool that spawns an isolated specialist run.
///
/// The worker gets a fresh in-memory storage set and a fresh thread tagged
/// with the parent identifiers; its events are consumed here and never merged
/// into the parent's stream.  The parent loop surfaces the outcome through
/// the regular tool-execution events plus a synthesized sub-agent invocation
/// event driven by the result metadata.
pub struct DelegateToSpecialistTool {
    orchestrator: Arc<dyn ToolsetOrchestrator>,
    llm: Arc<dyn LlmClient>,
    parent_config: RunConfig,
    notices: mpsc::Sender<SubAgentNotice>,
}

impl DelegateToSpecialistTool {
    pub fn new(
        orchestrator: Arc<dyn ToolsetOrchestrator>,
        llm: Arc<dyn LlmClient>,
        parent_config: RunConfig,
        notices: mpsc::Sender<SubAgentNotice>,
    ) -> Self {
        Self { orchestrator, llm, parent_config, notices }
    }

    /// The worker's configuration: parent model settings, a specialist
    /// prompt, and a reduced continuation budget.
    fn worker_config(&self, system_prompt: String) -> RunConfig {
        RunConfig {
            agent_kind: AgentKind::Base,
            model: self.parent_config.model.clone(),
            temperature: self.parent_config.temperature,
            max_tokens: self.parent_config.max_tokens,
            system_prompt: Some(system_prompt),
            max_tool_call_continuations: self
                .parent_config
                .max_tool_call_continuations
                .saturating_sub(WORKER_CONTINUATION_DECREMENT),
            execution_strategy: self.parent_config.execution_strategy,
            context: self.parent_config.context.clone(),
        }
    }
}

#[async_trait]
impl Tool for DelegateToSpecialistTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            DELEGATE_TOOL_NAME,
            "Delegate a focused sub-task to a specialist agent that has \
             access to the named toolset. The specialist runs in isolation \
             and returns its final text output.",
        )
        .with_parameter(
            ToolParameter::new("specialistId", "string", true)
                .with_description("Id of the specialist toolset to delegate to"),
        )
        .with_parameter(
            ToolParameter::new("subTaskDescription", "string", true)
                .with_description("Precise description of the sub-task"),
        )
        .with_parameter(
            ToolParameter::new("requiredOutputFormat", "string", false)
                .with_description("Output format the specialist must follow"),
        )
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let Some(specialist_id) = args.get("specialistId").and_then(Value::as_str) else {
            return ToolResult::fail("missing required parameter: specialistId");
        };
        let Some(sub_task) = args.get("subTaskDescription").and_then(Value::as_str) else {
            return ToolResult::fail("missing required parameter: subTaskDescription");
        };
        let output_format = args.get("requiredOutputFormat").and_then(Value::as_str);

        // Announce the invocation before the sub-run starts; the parent loop
        // drains this into `agent.sub_agent.invocation.started`.
        let _ = self.notices.try_send(SubAgentNotice {
            specialist_id: specialist_id.to_string(),
            sub_task_description: sub_task.to_string(),
        });

        let Some(toolset) = self
            .orchestrator
            .toolsets()
            .into_iter()
            .find(|t| t.id == specialist_id)
        else {
            return ToolResult::fail(format!("unknown specialist toolset: {specialist_id}"))
                .meta("errorName", "ToolNotFoundError")
                .meta("specialistId", specialist_id);
        };
        let Some(provider) = self.orchestrator.provider(specialist_id) else {
            return ToolResult::fail(format!("unknown specialist toolset: {specialist_id}"))
                .meta("errorName", "ToolNotFoundError")
                .meta("specialistId", specialist_id);
        };

        // Isolated world for the worker: its own stores and its own thread,
        // tagged with the parent identity for traceability.
        let stores = MemoryStores::new();
        let mut thread_meta = serde_json::Map::new();
        thread_meta.insert("parentRunId".into(), Value::String(ctx.run_id.clone()));
        thread_meta.insert("parentThreadId".into(), Value::String(ctx.thread_id.clone()));
        thread_meta.insert("specialistId".into(), Value::String(specialist_id.to_string()));
        if let Some(tool_call_id) = ctx.metadata.get("toolCallId") {
            thread_meta.insert("parentToolCallId".into(), tool_call_id.clone());
        }
        let thread = match stores
            .threads
            .create(NewThread { metadata: thread_meta, ..Default::default() })
            .await
        {
            Ok(thread) => thread,
            Err(e) => return ToolResult::fail(format!("failed to create worker thread: {e}")),
        };

        let system_prompt = specialist_prompt(&toolset, output_format);
        let config = self.worker_config(system_prompt.clone());
        let run = match stores
            .runs
            .create(NewRun::new(thread.id.clone(), config.clone()))
            .await
        {
            Ok(run) => run,
            Err(e) => return ToolResult::fail(format!("failed to create worker run: {e}")),
        };
        debug!(
            specialist = specialist_id,
            worker_run = %run.id,
            "delegating sub-task to specialist"
        );

        // The worker never carries a delegate tool, so its notice channel
        // stays silent.
        let (_notice_tx, notice_rx) = mpsc::channel::<SubAgentNotice>(8);
        let mut worker = AgentRunner::new(
            Arc::clone(&self.llm),
            provider,
            stores.messages.clone(),
            stores.threads.clone(),
            stores.runs.clone(),
            notice_rx,
        );
        let worker_ctx = RunContext {
            run_id: run.id.clone(),
            thread_id: thread.id.clone(),
            config,
            system_prompt,
            cancel: CancelFlag::new(),
        };
        let initial = vec![NewMessage::new(&thread.id, ChatRole::User, sub_task)];

        // Drive the worker and consume its event stream internally.
        let (tx, mut rx) = mpsc::channel(256);
        let run_future = worker.run(&worker_ctx, initial, tx);
        let drain_future = async {
            let mut events = Vec::new();
            while let Some(envelope) = rx.recv().await {
                events.push(envelope);
            }
            events
        };
        let (run_result, events) = tokio::join!(run_future, drain_future);

        let base_meta = |result: ToolResult, status: &str| {
            result
                .meta("subAgentRunId", run.id.clone())
                .meta("specialistId", specialist_id)
                .meta("subTaskDescription", sub_task)
                .meta("subAgentStatus", status)
        };

        if let Err(e) = run_result {
            return base_meta(
                ToolResult::fail(format!("specialist run could not start: {e}")),
                "failed",
            );
        }

        // Map the worker's terminal state onto the tool result.
        let terminal = events.iter().rev().find(|e| e.event.is_terminal());
        match terminal.map(|e| &e.event) {
            Some(RunEvent::RunCompleted) => {
                let final_text = events
                    .iter()
                    .rev()
                    .find_map(|e| match &e.event {
                        RunEvent::MessageCompleted { message }
                            if message.role == ChatRole::Assistant =>
                        {
                            message.content.as_text().map(str::to_string)
                        }
                        _ => None,
                    })
                    .unwrap_or_default();
                base_meta(ToolResult::ok(final_text), "completed")
            }
            Some(RunEvent::RunFailed { error }) => base_meta(
                ToolResult::fail(error.message.clone()).meta("errorCode", error.code.clone()),
                "failed",
            ),
            _ => base_meta(
                ToolResult::fail("specialist run stopped requiring external action")
                    .meta("errorCode", codes::STOPPED_REQUIRING_ACTION),
                "requires_action",
            ),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
