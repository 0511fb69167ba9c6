// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use conductor_model::{ChatContent, ChatRole, ToolCallRequest};

use crate::error::StoreError;
use crate::types::{
    AgentKind, AgentRun, MessageMetadata, RunConfig, RunError, RunStatus, StoredMessage, Thread,
};

// ─── Threads ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct NewThread {
    pub title: Option<String>,
    pub user_id: Option<String>,
    pub metadata: Map<String, Value>,
}

/// Partial thread update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ThreadPatch {
    pub title: Option<String>,
    pub user_id: Option<String>,
    pub metadata: Option<Map<String, Value>>,
    pub latest_summary: Option<String>,
}

#[async_trait]
pub trait ThreadStore: Send + Sync {
    async fn create(&self, data: NewThread) -> Result<Thread, StoreError>;
    async fn get(&self, id: &str) -> Result<Option<Thread>, StoreError>;
    async fn update(&self, id: &str, patch: ThreadPatch) -> Result<Thread, StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
    async fn list(&self, user_id: Option<&str>, limit: Option<usize>)
        -> Result<Vec<Thread>, StoreError>;
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub thread_id: String,
    pub role: ChatRole,
    pub content: ChatContent,
    pub metadata: MessageMetadata,
}

impl NewMessage {
    pub fn new(thread_id: impl Into<String>, role: ChatRole, content: impl Into<ChatContent>) -> Self {
        Self {
            thread_id: thread_id.into(),
            role,
            content: content.into(),
            metadata: MessageMetadata::default(),
        }
    }

    pub fn for_run(mut self, run_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        self.metadata.run_id = Some(run_id.into());
        self.metadata.step_id = Some(step_id.into());
        self
    }
}

/// Patch for finalizing a streaming assistant record: new content plus
/// metadata (tool calls, cleared `in_progress`).
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub content: Option<ChatContent>,
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    pub in_progress: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

/// Query window over a thread's messages.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub limit: Option<usize>,
    pub order: SortOrder,
    /// Only messages created before this message id.
    pub before: Option<String>,
    /// Only messages created after this message id.
    pub after: Option<String>,
}

impl MessageQuery {
    /// The `limit` most recent messages, newest first.
    pub fn recent(limit: usize) -> Self {
        Self { limit: Some(limit), ..Default::default() }
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn add(&self, message: NewMessage) -> Result<StoredMessage, StoreError>;
    async fn list(
        &self,
        thread_id: &str,
        query: MessageQuery,
    ) -> Result<Vec<StoredMessage>, StoreError>;
    async fn update(&self, id: &str, patch: MessagePatch) -> Result<StoredMessage, StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

// ─── Runs ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewRun {
    pub thread_id: String,
    pub agent_kind: AgentKind,
    pub config: RunConfig,
    pub metadata: Map<String, Value>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewRun {
    pub fn new(thread_id: impl Into<String>, config: RunConfig) -> Self {
        Self {
            thread_id: thread_id.into(),
            agent_kind: config.agent_kind,
            config,
            metadata: Map::new(),
            expires_at: None,
        }
    }
}

/// Partial run update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<RunError>,
    pub metadata: Option<Map<String, Value>>,
}

impl RunPatch {
    pub fn status(status: RunStatus) -> Self {
        Self { status: Some(status), ..Default::default() }
    }

    /// Terminal patch: status plus completion time.
    pub fn finished(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: RunError) -> Self {
        self.last_error = Some(error);
        self
    }
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create(&self, data: NewRun) -> Result<AgentRun, StoreError>;
    async fn get(&self, id: &str) -> Result<Option<AgentRun>, StoreError>;
    async fn update(&self, id: &str, patch: RunPatch) -> Result<AgentRun, StoreError>;
}
