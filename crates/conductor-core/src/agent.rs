// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use conductor_model::{
    ChatContent, ChatRole, CompletionOptions, FinishReason, LlmClient, LlmResponse,
    ToolCallRequest, ToolChoice, ToolSchema,
};
use conductor_store::{
    MessagePatch, MessageStore, NewMessage, RunConfig, RunError, RunPatch, RunStatus, RunStore,
    StoredMessage, ThreadStore,
};
use conductor_tools::{
    ExecutedToolCall, ExecutionStrategy, ToolCall, ToolContext, ToolExecutor, ToolProvider,
};

use crate::context::ContextManager;
use crate::errors::{codes, CoreError};
use crate::events::{EventEnvelope, MessageDelta, RunEvent, SubAgentNotice};
use crate::processor::{ParsedEvent, ResponseProcessor};

/// Cooperative cancellation flag shared between the caller and the loop.
///
/// Checked at the loop top, between stream events, and between tool
/// executions; in-flight LLM or tool calls are never pre-empted.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A tool output submitted by an external caller to resume a paused run.
#[derive(Debug, Clone)]
pub struct ToolOutputSubmission {
    pub tool_call_id: String,
    pub tool_name: Option<String>,
    pub output: String,
}

/// Everything a single run invocation needs; owns no shared mutable state so
/// concurrent runs of the same agent stay independent.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: String,
    pub thread_id: String,
    pub config: RunConfig,
    pub system_prompt: String,
    pub cancel: CancelFlag,
}

/// Drives one agent run: turn-by-turn LLM streaming, tool dispatch, message
/// persistence, and event emission.  Base and planner agents both use this
/// loop; they differ only in the system prompt and tool provider they are
/// constructed with.
pub struct AgentRunner {
    llm: Arc<dyn LlmClient>,
    tool_provider: Arc<dyn ToolProvider>,
    messages: Arc<dyn MessageStore>,
    threads: Arc<dyn ThreadStore>,
    runs: Arc<dyn RunStore>,
    /// Out-of-band notices from tools (sub-agent announcements), drained at
    /// execution checkpoints.  The paired sender lives inside the delegate
    /// tool registered with `tool_provider`.
    notice_rx: mpsc::Receiver<SubAgentNotice>,
}

impl AgentRunner {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tool_provider: Arc<dyn ToolProvider>,
        messages: Arc<dyn MessageStore>,
        threads: Arc<dyn ThreadStore>,
        runs: Arc<dyn RunStore>,
        notice_rx: mpsc::Receiver<SubAgentNotice>,
    ) -> Self {
        Self { llm, tool_provider, messages, threads, runs, notice_rx }
    }

    /// Start or continue a run, consuming `initial` as this turn's input
    /// messages.  Events flow through `tx` until the run terminates or
    /// pauses for external action; the channel is dropped when the
    /// invocation returns.
    ///
    /// Configuration and unknown-run errors are returned synchronously;
    /// everything that happens inside the run is reported as events and the
    /// invocation returns `Ok`.
    pub async fn run(
        &mut self,
        ctx: &RunContext,
        initial: Vec<NewMessage>,
        tx: mpsc::Sender<EventEnvelope>,
    ) -> Result<(), CoreError> {
        let context_manager = ContextManager::new(
            Arc::clone(&self.llm),
            Arc::clone(&self.messages),
            Arc::clone(&self.threads),
            ctx.config.context.clone(),
            ctx.config.model.clone(),
        )?;

        let record = self
            .runs
            .get(&ctx.run_id)
            .await?
            .ok_or_else(|| CoreError::InvalidState(format!("unknown run: {}", ctx.run_id)))?;

        let started_patch = RunPatch {
            status: Some(RunStatus::InProgress),
            started_at: record.started_at.is_none().then(Utc::now),
            ..Default::default()
        };
        self.runs.update(&ctx.run_id, started_patch).await?;
        if record.status == RunStatus::Queued {
            self.emit(ctx, &tx, RunEvent::RunCreated { status: RunStatus::InProgress })
                .await;
        } else {
            self.emit(ctx, &tx, RunEvent::StatusChanged { status: RunStatus::InProgress })
                .await;
        }

        self.drive(ctx, initial, &context_manager, tx).await;
        Ok(())
    }

    /// Resume a run paused in `requires_action` by feeding the supplied tool
    /// outputs as the next turn's input.
    pub async fn submit_tool_outputs(
        &mut self,
        ctx: &RunContext,
        outputs: Vec<ToolOutputSubmission>,
        tx: mpsc::Sender<EventEnvelope>,
    ) -> Result<(), CoreError> {
        let initial = outputs
            .into_iter()
            .map(|o| {
                let mut msg = NewMessage::new(&ctx.thread_id, ChatRole::Tool, o.output);
                msg.metadata.tool_call_id = Some(o.tool_call_id);
                msg.metadata.name = o.tool_name;
                msg
            })
            .collect();
        self.run(ctx, initial, tx).await
    }

    /// The turn loop.  All failure paths emit a terminal event; this method
    /// never returns early without one.
    async fn drive(
        &mut self,
        ctx: &RunContext,
        initial: Vec<NewMessage>,
        context_manager: &ContextManager,
        tx: mpsc::Sender<EventEnvelope>,
    ) {
        let max_continuations = ctx.config.max_tool_call_continuations;
        let mut pending_inputs = initial;
        let mut turn: u32 = 0;

        loop {
            if ctx.cancel.is_cancelled() {
                return self.finish_cancelled(ctx, &tx).await;
            }

            turn += 1;
            if turn > max_continuations + 5 {
                return self
                    .finish_failed(
                        ctx,
                        &tx,
                        codes::ITERATION_LIMIT_EXCEEDED,
                        format!("run exceeded the safety budget of {} turns", max_continuations + 5),
                    )
                    .await;
            }
            let step_id = format!("step_{turn}");
            self.emit(ctx, &tx, RunEvent::StepCreated { step_id: step_id.clone(), turn })
                .await;

            // Persist this turn's inputs, then clear the buffer.
            let mut new_chat = Vec::with_capacity(pending_inputs.len());
            for msg in std::mem::take(&mut pending_inputs) {
                let msg = msg.for_run(&ctx.run_id, &step_id);
                let stored = match self.messages.add(msg).await {
                    Ok(stored) => stored,
                    Err(e) => {
                        return self
                            .finish_failed(ctx, &tx, codes::STORAGE_ERROR, e.to_string())
                            .await;
                    }
                };
                new_chat.push(stored.to_chat());
                self.emit(ctx, &tx, RunEvent::MessageCreated { message: stored }).await;
            }

            let assembled = match context_manager
                .assemble(&ctx.thread_id, &ctx.system_prompt, &new_chat)
                .await
            {
                Ok(list) => list,
                Err(e) => {
                    let code = if e.is::<conductor_store::StoreError>() {
                        codes::STORAGE_ERROR
                    } else {
                        codes::LLM_ERROR
                    };
                    return self.finish_failed(ctx, &tx, code, e.to_string()).await;
                }
            };

            // Tool schemas for this turn; with no tools the model must not
            // attempt a call.
            let schemas: Vec<ToolSchema> = self
                .tool_provider
                .get_tools()
                .iter()
                .map(|t| {
                    let def = t.definition();
                    ToolSchema {
                        name: def.name.clone(),
                        description: def.description.clone(),
                        parameters: def.parameters_schema(),
                    }
                })
                .collect();
            let tools = self.llm.format_tools(&schemas);
            let tool_choice = if tools.is_empty() { ToolChoice::None } else { ToolChoice::Auto };

            // Streaming assistant shell, finalized after the stream ends.
            let mut shell = NewMessage::new(&ctx.thread_id, ChatRole::Assistant, "");
            shell.metadata.in_progress = Some(true);
            let shell = match self.messages.add(shell.for_run(&ctx.run_id, &step_id)).await {
                Ok(stored) => stored,
                Err(e) => {
                    return self
                        .finish_failed(ctx, &tx, codes::STORAGE_ERROR, e.to_string())
                        .await;
                }
            };
            self.emit(ctx, &tx, RunEvent::MessageCreated { message: shell.clone() })
                .await;

            let options = CompletionOptions {
                model: ctx.config.model.clone(),
                tools,
                tool_choice,
                stream: true,
                temperature: ctx.config.temperature,
                max_tokens: ctx.config.max_tokens,
                ..Default::default()
            };
            let response = match self.llm.generate(assembled, options).await {
                Ok(response) => response,
                Err(e) => {
                    return self
                        .finish_failed(ctx, &tx, codes::LLM_ERROR, e.to_string())
                        .await;
                }
            };

            let outcome = match self.consume_response(ctx, &tx, &shell, response).await {
                Some(outcome) => outcome,
                None => {
                    // Cancelled mid-stream; the partial message is already
                    // persisted as-is.
                    return self.finish_cancelled(ctx, &tx).await;
                }
            };
            let TurnOutcome { text, tool_calls, finish, failure, .. } = outcome;

            if let Some((code, message)) = failure {
                // Keep the log coherent before failing the run.
                self.finalize_assistant(&shell.id, &text, &[]).await;
                return self.finish_failed(ctx, &tx, code, message).await;
            }

            let finalized = match self.finalize_assistant(&shell.id, &text, &tool_calls).await {
                Some(message) => message,
                None => {
                    return self
                        .finish_failed(
                            ctx,
                            &tx,
                            codes::STORAGE_ERROR,
                            "failed to finalize assistant message",
                        )
                        .await;
                }
            };
            self.emit(ctx, &tx, RunEvent::MessageCompleted { message: finalized })
                .await;

            // Decide the next step from the finish reason.
            let has_calls = !tool_calls.is_empty();
            match finish {
                Some(FinishReason::ToolCalls) if has_calls => {
                    self.emit(
                        ctx,
                        &tx,
                        RunEvent::RunRequiresAction { pending_tool_calls: tool_calls.clone() },
                    )
                    .await;

                    if turn >= max_continuations {
                        // Paused: an external caller may resume through
                        // `submit_tool_outputs`.
                        self.patch_record(ctx, RunPatch::status(RunStatus::RequiresAction))
                            .await;
                        debug!(run_id = %ctx.run_id, turn, "run paused awaiting tool outputs");
                        return;
                    }

                    if ctx.cancel.is_cancelled() {
                        return self.finish_cancelled(ctx, &tx).await;
                    }
                    let executed = match self.execute_calls(ctx, &tx, &tool_calls).await {
                        Some(executed) => executed,
                        None => return self.finish_cancelled(ctx, &tx).await,
                    };

                    let mut next = Vec::with_capacity(executed.len());
                    for ex in executed {
                        let content = if ex.result.success {
                            stringify_data(ex.result.data.as_ref())
                        } else {
                            format!(
                                "Error: {}",
                                ex.result.error.as_deref().unwrap_or("unknown error")
                            )
                        };
                        let mut msg = NewMessage::new(&ctx.thread_id, ChatRole::Tool, content);
                        msg.metadata.tool_call_id = Some(ex.tool_call_id);
                        msg.metadata.name = Some(ex.tool_name);
                        next.push(msg);
                    }
                    if next.is_empty() {
                        return self
                            .finish_failed(
                                ctx,
                                &tx,
                                codes::ALL_TOOLS_FAILED,
                                "no tool produced a result to return to the model",
                            )
                            .await;
                    }
                    pending_inputs = next;
                    self.patch_record(ctx, RunPatch::status(RunStatus::InProgress)).await;
                }
                Some(FinishReason::Length) | Some(FinishReason::ContentFilter) => {
                    let reason = finish.as_ref().map(FinishReason::as_str).unwrap_or("none");
                    return self
                        .finish_failed(
                            ctx,
                            &tx,
                            codes::LLM_FINISH_REASON_ERROR,
                            format!("model stopped with finish reason: {reason}"),
                        )
                        .await;
                }
                _ if has_calls => {
                    // Tool calls were streamed but the finish reason does not
                    // allow executing them; completing would orphan the calls.
                    let reason = finish.as_ref().map(FinishReason::as_str).unwrap_or("none");
                    return self
                        .finish_failed(
                            ctx,
                            &tx,
                            codes::LLM_FINISH_REASON_ERROR,
                            format!("tool calls issued under finish reason: {reason}"),
                        )
                        .await;
                }
                // `stop`, a missing finish reason, and unknown-but-empty
                // reasons all complete the run.
                _ => {
                    self.emit(ctx, &tx, RunEvent::RunCompleted).await;
                    self.patch_record(ctx, RunPatch::finished(RunStatus::Completed)).await;
                    return;
                }
            }
        }
    }

    /// Drive the response through the processor, emitting deltas and
    /// collecting assembled tool calls.  Returns `None` when cancellation was
    /// observed mid-stream (the partial assistant text is persisted first).
    async fn consume_response(
        &mut self,
        ctx: &RunContext,
        tx: &mpsc::Sender<EventEnvelope>,
        shell: &StoredMessage,
        response: LlmResponse,
    ) -> Option<TurnOutcome> {
        let mut processor = ResponseProcessor::new();
        let mut outcome = TurnOutcome::default();

        match response {
            LlmResponse::Stream(mut chunks) => loop {
                if outcome.finish_seen {
                    break;
                }
                if ctx.cancel.is_cancelled() {
                    let _ = self
                        .messages
                        .update(
                            &shell.id,
                            MessagePatch {
                                content: Some(ChatContent::Text(outcome.text.clone())),
                                ..Default::default()
                            },
                        )
                        .await;
                    return None;
                }
                match chunks.next().await {
                    Some(Ok(chunk)) => {
                        for parsed in processor.on_chunk(chunk) {
                            self.apply_parsed(ctx, tx, shell, parsed, &mut outcome).await;
                        }
                        if outcome.failure.is_some() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        outcome.failure = Some((codes::LLM_ERROR, e.to_string()));
                        break;
                    }
                    None => {
                        for parsed in processor.on_stream_end() {
                            self.apply_parsed(ctx, tx, shell, parsed, &mut outcome).await;
                        }
                        break;
                    }
                }
            },
            LlmResponse::Complete(message) => {
                for parsed in processor.on_complete(message) {
                    self.apply_parsed(ctx, tx, shell, parsed, &mut outcome).await;
                }
            }
        }
        Some(outcome)
    }

    async fn apply_parsed(
        &self,
        ctx: &RunContext,
        tx: &mpsc::Sender<EventEnvelope>,
        shell: &StoredMessage,
        parsed: ParsedEvent,
        outcome: &mut TurnOutcome,
    ) {
        match parsed {
            ParsedEvent::TextChunk(text) => {
                outcome.text.push_str(&text);
                self.emit(
                    ctx,
                    tx,
                    RunEvent::MessageDelta {
                        message_id: shell.id.clone(),
                        delta: MessageDelta::Text(text),
                    },
                )
                .await;
            }
            ParsedEvent::ToolCallDetected(tool_call) => {
                let step_id = shell.metadata.step_id.clone().unwrap_or_default();
                outcome.tool_calls.push(tool_call.clone());
                self.emit(
                    ctx,
                    tx,
                    RunEvent::ToolCallCreated {
                        step_id: step_id.clone(),
                        tool_call: tool_call.clone(),
                    },
                )
                .await;
                self.emit(
                    ctx,
                    tx,
                    RunEvent::ToolCallCompletedByLlm {
                        step_id,
                        tool_call_id: tool_call.id.clone(),
                    },
                )
                .await;
                self.emit(
                    ctx,
                    tx,
                    RunEvent::MessageDelta {
                        message_id: shell.id.clone(),
                        delta: MessageDelta::ToolCall(tool_call),
                    },
                )
                .await;
            }
            ParsedEvent::StreamEnd(reason) => {
                outcome.finish = reason;
                outcome.finish_seen = true;
            }
            ParsedEvent::Error { code, message } => {
                if outcome.failure.is_none() {
                    outcome.failure = Some((code, message));
                }
            }
        }
    }

    /// Run the turn's tool calls with per-call execution events, preserving
    /// input order.  Returns `None` when cancellation was observed between
    /// executions.
    async fn execute_calls(
        &mut self,
        ctx: &RunContext,
        tx: &mpsc::Sender<EventEnvelope>,
        calls: &[ToolCall],
    ) -> Option<Vec<ExecutedToolCall>> {
        let executor =
            ToolExecutor::new(Arc::clone(&self.tool_provider), ctx.config.execution_strategy);
        let tool_ctx = ToolContext::new(&ctx.run_id, &ctx.thread_id);

        let mut executed = Vec::with_capacity(calls.len());
        match ctx.config.execution_strategy {
            ExecutionStrategy::Sequential => {
                for call in calls {
                    if ctx.cancel.is_cancelled() {
                        return None;
                    }
                    self.emit(
                        ctx,
                        tx,
                        RunEvent::ToolExecutionStarted {
                            tool_call_id: call.id.clone(),
                            tool_name: call.name.clone(),
                        },
                    )
                    .await;
                    let mut batch = executor
                        .execute_batch(std::slice::from_ref(call), &tool_ctx)
                        .await;
                    let ex = batch.remove(0);
                    self.drain_notices(ctx, tx).await;
                    self.emit_execution_completed(ctx, tx, &ex).await;
                    executed.push(ex);
                }
            }
            ExecutionStrategy::Parallel => {
                for call in calls {
                    self.emit(
                        ctx,
                        tx,
                        RunEvent::ToolExecutionStarted {
                            tool_call_id: call.id.clone(),
                            tool_name: call.name.clone(),
                        },
                    )
                    .await;
                }
                let batch = executor.execute_batch(calls, &tool_ctx).await;
                self.drain_notices(ctx, tx).await;
                for ex in batch {
                    self.emit_execution_completed(ctx, tx, &ex).await;
                    executed.push(ex);
                }
            }
        }
        Some(executed)
    }

    async fn emit_execution_completed(
        &self,
        ctx: &RunContext,
        tx: &mpsc::Sender<EventEnvelope>,
        ex: &ExecutedToolCall,
    ) {
        self.emit(
            ctx,
            tx,
            RunEvent::ToolExecutionCompleted {
                tool_call_id: ex.tool_call_id.clone(),
                tool_name: ex.tool_name.clone(),
                result: ex.result.clone(),
            },
        )
        .await;
        // A result tagged with a sub-agent run id came from a delegate tool;
        // surface the dedicated invocation event alongside.
        if let Some(sub_run_id) = ex.result.metadata_str("subAgentRunId") {
            let specialist_id = ex
                .result
                .metadata_str("specialistId")
                .unwrap_or_default()
                .to_string();
            self.emit(
                ctx,
                tx,
                RunEvent::SubAgentInvocationCompleted {
                    tool_call_id: ex.tool_call_id.clone(),
                    sub_agent_run_id: sub_run_id.to_string(),
                    specialist_id,
                    result: ex.result.clone(),
                },
            )
            .await;
        }
    }

    /// Surface pending tool notices as events.
    async fn drain_notices(&mut self, ctx: &RunContext, tx: &mpsc::Sender<EventEnvelope>) {
        while let Ok(notice) = self.notice_rx.try_recv() {
            self.emit(
                ctx,
                tx,
                RunEvent::SubAgentInvocationStarted {
                    specialist_id: notice.specialist_id,
                    sub_task_description: notice.sub_task_description,
                },
            )
            .await;
        }
    }

    async fn finalize_assistant(
        &self,
        message_id: &str,
        text: &str,
        tool_calls: &[ToolCall],
    ) -> Option<StoredMessage> {
        let requests: Vec<ToolCallRequest> = tool_calls
            .iter()
            .map(|tc| ToolCallRequest {
                id: tc.id.clone(),
                name: tc.name.clone(),
                arguments: tc.arguments.clone(),
            })
            .collect();
        let patch = MessagePatch {
            content: Some(ChatContent::Text(text.to_string())),
            tool_calls: (!requests.is_empty()).then_some(requests),
            in_progress: Some(false),
        };
        match self.messages.update(message_id, patch).await {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("failed to finalize assistant message {message_id}: {e}");
                None
            }
        }
    }

    async fn finish_cancelled(&self, ctx: &RunContext, tx: &mpsc::Sender<EventEnvelope>) {
        self.emit(ctx, tx, RunEvent::StatusChanged { status: RunStatus::Cancelling })
            .await;
        self.patch_record(ctx, RunPatch::status(RunStatus::Cancelling)).await;
        self.emit(ctx, tx, RunEvent::StatusChanged { status: RunStatus::Cancelled })
            .await;
        self.patch_record(ctx, RunPatch::finished(RunStatus::Cancelled)).await;
    }

    async fn finish_failed(
        &self,
        ctx: &RunContext,
        tx: &mpsc::Sender<EventEnvelope>,
        code: &str,
        message: impl Into<String>,
    ) {
        let message = message.into();
        warn!(run_id = %ctx.run_id, code, "run failed: {message}");
        let error = RunError::new(code, message);
        self.emit(ctx, tx, RunEvent::RunFailed { error: error.clone() }).await;
        self.patch_record(ctx, RunPatch::finished(RunStatus::Failed).with_error(error))
            .await;
    }

    /// Best-effort record update; failing to write the record must not mask
    /// the event that was already emitted.
    async fn patch_record(&self, ctx: &RunContext, patch: RunPatch) {
        if let Err(e) = self.runs.update(&ctx.run_id, patch).await {
            warn!(run_id = %ctx.run_id, "failed to update run record: {e}");
        }
    }

    async fn emit(&self, ctx: &RunContext, tx: &mpsc::Sender<EventEnvelope>, event: RunEvent) {
        let _ = tx
            .send(EventEnvelope::now(&ctx.run_id, &ctx.thread_id, event))
            .await;
    }
}

#[derive(Default)]
struct TurnOutcome {
    text: String,
    tool_calls: Vec<ToolCall>,
    finish: Option<FinishReason>,
    finish_seen: bool,
    failure: Option<(&'static str, String)>,
}

/// Tool-result payload as presented back to the model: strings verbatim,
/// everything else JSON-encoded.
fn stringify_data(data: Option<&serde_json::Value>) -> String {
    match data {
        None => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
