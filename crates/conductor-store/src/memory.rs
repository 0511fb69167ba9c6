// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Default in-memory storage.
//!
//! Suitable for tests, small deployments, and sub-agent isolation.  Each
//! store owns its locking; the core never serializes concurrent appenders
//! itself.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::traits::{
    MessagePatch, MessageQuery, MessageStore, NewMessage, NewRun, NewThread, RunPatch, RunStore,
    SortOrder, ThreadPatch, ThreadStore,
};
use crate::types::{AgentRun, RunStatus, StoredMessage, Thread};

fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4())
}

// ─── Threads ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryThreadStore {
    threads: RwLock<HashMap<String, Thread>>,
}

impl InMemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ThreadStore for InMemoryThreadStore {
    async fn create(&self, data: NewThread) -> Result<Thread, StoreError> {
        let now = Utc::now();
        let thread = Thread {
            id: new_id("thread"),
            created_at: now,
            updated_at: now,
            title: data.title,
            user_id: data.user_id,
            metadata: data.metadata,
            latest_summary: None,
        };
        self.threads
            .write()
            .await
            .insert(thread.id.clone(), thread.clone());
        Ok(thread)
    }

    async fn get(&self, id: &str) -> Result<Option<Thread>, StoreError> {
        Ok(self.threads.read().await.get(id).cloned())
    }

    async fn update(&self, id: &str, patch: ThreadPatch) -> Result<Thread, StoreError> {
        let mut threads = self.threads.write().await;
        let thread = threads
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("thread", id))?;
        if let Some(title) = patch.title {
            thread.title = Some(title);
        }
        if let Some(user_id) = patch.user_id {
            thread.user_id = Some(user_id);
        }
        if let Some(metadata) = patch.metadata {
            thread.metadata = metadata;
        }
        if let Some(summary) = patch.latest_summary {
            thread.latest_summary = Some(summary);
        }
        thread.updated_at = Utc::now();
        Ok(thread.clone())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.threads
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("thread", id))
    }

    async fn list(
        &self,
        user_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Thread>, StoreError> {
        let threads = self.threads.read().await;
        let mut out: Vec<Thread> = threads
            .values()
            .filter(|t| user_id.is_none() || t.user_id.as_deref() == user_id)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.created_at);
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryMessageStore {
    /// Per-thread message log in insertion (creation) order.
    by_thread: RwLock<HashMap<String, Vec<StoredMessage>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn add(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        let stored = StoredMessage {
            id: new_id("msg"),
            thread_id: message.thread_id.clone(),
            role: message.role,
            content: message.content,
            created_at: Utc::now(),
            metadata: message.metadata,
        };
        self.by_thread
            .write()
            .await
            .entry(message.thread_id)
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn list(
        &self,
        thread_id: &str,
        query: MessageQuery,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let by_thread = self.by_thread.read().await;
        let log = by_thread.get(thread_id).map(Vec::as_slice).unwrap_or(&[]);

        let mut start = 0usize;
        let mut end = log.len();
        if let Some(after) = &query.after {
            if let Some(pos) = log.iter().position(|m| &m.id == after) {
                start = pos + 1;
            }
        }
        if let Some(before) = &query.before {
            if let Some(pos) = log.iter().position(|m| &m.id == before) {
                end = pos.min(end);
            }
        }
        let window = &log[start.min(end)..end];

        let mut out: Vec<StoredMessage> = window.to_vec();
        if query.order == SortOrder::Descending {
            out.reverse();
        }
        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn update(&self, id: &str, patch: MessagePatch) -> Result<StoredMessage, StoreError> {
        let mut by_thread = self.by_thread.write().await;
        for log in by_thread.values_mut() {
            if let Some(msg) = log.iter_mut().find(|m| m.id == id) {
                if let Some(content) = patch.content {
                    msg.content = content;
                }
                if let Some(tool_calls) = patch.tool_calls {
                    msg.metadata.tool_calls = Some(tool_calls);
                }
                if let Some(in_progress) = patch.in_progress {
                    msg.metadata.in_progress = if in_progress { Some(true) } else { None };
                }
                return Ok(msg.clone());
            }
        }
        Err(StoreError::not_found("message", id))
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut by_thread = self.by_thread.write().await;
        for log in by_thread.values_mut() {
            if let Some(pos) = log.iter().position(|m| m.id == id) {
                log.remove(pos);
                return Ok(());
            }
        }
        Err(StoreError::not_found("message", id))
    }
}

// ─── Runs ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<String, AgentRun>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create(&self, data: NewRun) -> Result<AgentRun, StoreError> {
        let run = AgentRun {
            id: new_id("run"),
            thread_id: data.thread_id,
            agent_kind: data.agent_kind,
            status: RunStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            expires_at: data.expires_at,
            last_error: None,
            config: data.config,
            metadata: data.metadata,
        };
        self.runs.write().await.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn get(&self, id: &str) -> Result<Option<AgentRun>, StoreError> {
        Ok(self.runs.read().await.get(id).cloned())
    }

    async fn update(&self, id: &str, patch: RunPatch) -> Result<AgentRun, StoreError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("run", id))?;
        if let Some(status) = patch.status {
            run.status = status;
        }
        if let Some(started_at) = patch.started_at {
            run.started_at = Some(started_at);
        }
        if let Some(completed_at) = patch.completed_at {
            run.completed_at = Some(completed_at);
        }
        if let Some(last_error) = patch.last_error {
            run.last_error = Some(last_error);
        }
        if let Some(metadata) = patch.metadata {
            run.metadata = metadata;
        }
        Ok(run.clone())
    }
}

// ─── Bundle ───────────────────────────────────────────────────────────────────

/// All three stores behind `Arc`s, for wiring a manager or an isolated
/// sub-agent run in one line.
#[derive(Clone)]
pub struct MemoryStores {
    pub threads: Arc<InMemoryThreadStore>,
    pub messages: Arc<InMemoryMessageStore>,
    pub runs: Arc<InMemoryRunStore>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self {
            threads: Arc::new(InMemoryThreadStore::new()),
            messages: Arc::new(InMemoryMessageStore::new()),
            runs: Arc::new(InMemoryRunStore::new()),
        }
    }
}

impl Default for MemoryStores {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
