use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use conductor_model::{ChatContent, ChatMessage, ChatRole, ToolCallRequest};
use conductor_tools::ExecutionStrategy;

// ─── Messages ─────────────────────────────────────────────────────────────────

/// Metadata attached to a persisted message.  All fields are optional; absent
/// fields are omitted from the serialized record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Tool calls issued by an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    /// For tool messages: the id of the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For tool messages: the function name that produced the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Set while an assistant message is still streaming.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress: Option<bool>,
    /// The run that produced this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// The run step (turn) that produced this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

/// A message as persisted in a thread.  Append-only; the only permitted
/// update is finalizing the latest streaming assistant record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub thread_id: String,
    pub role: ChatRole,
    pub content: ChatContent,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl StoredMessage {
    /// Project this record into the wire message shape for an LLM call.
    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
            tool_calls: self.metadata.tool_calls.clone().unwrap_or_default(),
            tool_call_id: self.metadata.tool_call_id.clone(),
            name: self.metadata.name.clone(),
        }
    }
}

// ─── Threads ──────────────────────────────────────────────────────────────────

/// A conversation thread.  Created on first use by an external caller; the
/// core never deletes threads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// The most recent history summary produced for this thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_summary: Option<String>,
}

// ─── Runs ─────────────────────────────────────────────────────────────────────

/// Which agent variant a run uses.  Variants only name configuration
/// defaults (system prompt + tool provider); the loop is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    #[default]
    Base,
    Planner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Expired,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed | Self::Completed | Self::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }
}

/// The last error recorded on a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub code: String,
    pub message: String,
}

impl RunError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }
}

/// Context-manager budgets carried in the run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextParams {
    /// Absolute token ceiling for the outgoing message list.
    pub token_threshold: usize,
    /// Token budget for a produced summary.
    pub summary_target_tokens: usize,
    /// Headroom reserved for system prompt, new input, and the response.
    pub reserved_tokens: usize,
    /// Model used for summarization calls; falls back to the run model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarization_model: Option<String>,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            token_threshold: 8_000,
            summary_target_tokens: 1_024,
            reserved_tokens: 1_536,
            summarization_model: None,
        }
    }
}

/// Effective configuration snapshot for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub agent_kind: AgentKind,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// How many turns may continue past a tool-calling turn before the run
    /// pauses in `requires_action`.
    pub max_tool_call_continuations: u32,
    #[serde(default)]
    pub execution_strategy: ExecutionStrategy,
    #[serde(default)]
    pub context: ContextParams,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            agent_kind: AgentKind::Base,
            model: String::new(),
            temperature: None,
            max_tokens: None,
            system_prompt: None,
            max_tool_call_continuations: 10,
            execution_strategy: ExecutionStrategy::default(),
            context: ContextParams::default(),
        }
    }
}

/// Configuration errors detected at construction time.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RunConfigError {
    #[error("no model configured")]
    MissingModel,
    #[error(
        "token_threshold ({token_threshold}) must exceed summary_target_tokens \
         ({summary_target_tokens}) + reserved_tokens ({reserved_tokens})"
    )]
    BadContextBudget {
        token_threshold: usize,
        summary_target_tokens: usize,
        reserved_tokens: usize,
    },
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), RunConfigError> {
        if self.model.is_empty() {
            return Err(RunConfigError::MissingModel);
        }
        let ctx = &self.context;
        if ctx.token_threshold <= ctx.summary_target_tokens + ctx.reserved_tokens {
            return Err(RunConfigError::BadContextBudget {
                token_threshold: ctx.token_threshold,
                summary_target_tokens: ctx.summary_target_tokens,
                reserved_tokens: ctx.reserved_tokens,
            });
        }
        Ok(())
    }
}

/// A single, identifiable execution of an agent on one thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: String,
    pub thread_id: String,
    pub agent_kind: AgentKind,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RunError>,
    pub config: RunConfig,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
