// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};

use conductor_store::{RunError, RunStatus, StoredMessage};
use conductor_tools::{ToolCall, ToolResult};

/// A fragment appended to a streaming assistant message.
#[derive(Debug, Clone)]
pub enum MessageDelta {
    Text(String),
    ToolCall(ToolCall),
}

/// Events emitted by a run.  The set is closed; consumers can match
/// exhaustively.  Within one run events are totally ordered and the sequence
/// contains exactly one terminal event (`RunCompleted`, `RunFailed`, or a
/// `StatusChanged` to `Cancelled`).
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// The run record was created / picked up; carries the initial status.
    RunCreated { status: RunStatus },
    /// A new turn (step) of the run loop began.
    StepCreated { step_id: String, turn: u32 },
    /// The run status changed outside the dedicated terminal events
    /// (`cancelling`, `cancelled`, resumptions).
    StatusChanged { status: RunStatus },
    /// A message was persisted to the thread.
    MessageCreated { message: StoredMessage },
    /// A chunk was appended to the streaming assistant message.
    MessageDelta { message_id: String, delta: MessageDelta },
    /// The streaming assistant message was finalized.
    MessageCompleted { message: StoredMessage },
    /// The model issued a tool call (assembled from the stream).
    ToolCallCreated { step_id: String, tool_call: ToolCall },
    /// The model finished emitting the tool call.
    ToolCallCompletedByLlm { step_id: String, tool_call_id: String },
    /// A tool execution began.
    ToolExecutionStarted { tool_call_id: String, tool_name: String },
    /// A tool execution finished; `result` carries success or failure.
    ToolExecutionCompleted {
        tool_call_id: String,
        tool_name: String,
        result: ToolResult,
    },
    /// A delegate tool began spawning a specialist sub-run.
    SubAgentInvocationStarted {
        specialist_id: String,
        sub_task_description: String,
    },
    /// A specialist sub-run finished; ids mirror the tool result metadata.
    SubAgentInvocationCompleted {
        tool_call_id: String,
        sub_agent_run_id: String,
        specialist_id: String,
        result: ToolResult,
    },
    /// The run paused (or is about to execute tools) with pending calls.
    RunRequiresAction { pending_tool_calls: Vec<ToolCall> },
    /// Terminal: the run failed.
    RunFailed { error: RunError },
    /// Terminal: the run completed.
    RunCompleted,
}

impl RunEvent {
    /// The dotted wire name of this event type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunCreated { .. } => "agent.run.created",
            Self::StepCreated { .. } => "agent.run.step.created",
            Self::StatusChanged { .. } => "agent.run.status.changed",
            Self::MessageCreated { .. } => "thread.message.created",
            Self::MessageDelta { .. } => "thread.message.delta",
            Self::MessageCompleted { .. } => "thread.message.completed",
            Self::ToolCallCreated { .. } => "thread.run.step.tool_call.created",
            Self::ToolCallCompletedByLlm { .. } => "thread.run.step.tool_call.completed_by_llm",
            Self::ToolExecutionStarted { .. } => "agent.tool.execution.started",
            Self::ToolExecutionCompleted { .. } => "agent.tool.execution.completed",
            Self::SubAgentInvocationStarted { .. } => "agent.sub_agent.invocation.started",
            Self::SubAgentInvocationCompleted { .. } => "agent.sub_agent.invocation.completed",
            Self::RunRequiresAction { .. } => "thread.run.requires_action",
            Self::RunFailed { .. } => "thread.run.failed",
            Self::RunCompleted => "thread.run.completed",
        }
    }

    /// Whether this event terminates the run's event sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunFailed { .. }
                | Self::RunCompleted
                | Self::StatusChanged { status: RunStatus::Cancelled }
        )
    }
}

/// Immutable, timestamped event record as delivered to consumers.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub run_id: String,
    pub thread_id: String,
    pub at: DateTime<Utc>,
    pub event: RunEvent,
}

impl EventEnvelope {
    pub fn now(run_id: &str, thread_id: &str, event: RunEvent) -> Self {
        Self {
            run_id: run_id.to_string(),
            thread_id: thread_id.to_string(),
            at: Utc::now(),
            event,
        }
    }
}

/// Adapt an event receiver into a futures `Stream` for consumers that prefer
/// stream combinators over a channel receive loop.
pub fn event_stream(
    rx: tokio::sync::mpsc::Receiver<EventEnvelope>,
) -> tokio_stream::wrappers::ReceiverStream<EventEnvelope> {
    tokio_stream::wrappers::ReceiverStream::new(rx)
}

/// Out-of-band notice sent by a tool to the run loop that drives it.
///
/// The loop drains these at its checkpoints and surfaces them as events;
/// today the only sender is the delegate tool announcing a sub-run.
#[derive(Debug, Clone)]
pub struct SubAgentNotice {
    pub specialist_id: String,
    pub sub_task_description: String,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
