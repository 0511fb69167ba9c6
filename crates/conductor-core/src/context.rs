// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use tracing::{debug, warn};

use conductor_model::{ChatContent, ChatMessage, ChatRole, CompletionOptions, LlmClient, LlmResponse};
use conductor_store::{
    ContextParams, MessageQuery, MessageStore, NewMessage, ThreadPatch, ThreadStore,
};

use crate::errors::CoreError;

pub const SUMMARY_HEADER: &str = "======== CONVERSATION HISTORY SUMMARY ========";
pub const SUMMARY_FOOTER: &str = "======== END OF SUMMARY ========";

/// How many recent messages are considered when assembling history.
const HISTORY_FETCH_LIMIT: usize = 100;

const SUMMARIZATION_PROMPT: &str =
    "You are a conversation compaction assistant. Summarise the conversation \
     below in a concise, information-dense way. Preserve all established \
     facts, decisions made, open questions, and the latest state of the task. \
     The summary will replace the original history in the model's context.";

/// Assembles the bounded message list for the next LLM call:
/// `[system_prompt, <historical tail with optional summary prefix>, <new>]`.
///
/// Never drops the system prompt or the new-turn messages.  May exceed the
/// ceiling only when those alone already exceed it; that case is logged, not
/// raised.
pub struct ContextManager {
    llm: Arc<dyn LlmClient>,
    messages: Arc<dyn MessageStore>,
    threads: Arc<dyn ThreadStore>,
    params: ContextParams,
    /// Model used for token counting and as the summarization fallback.
    model: String,
}

impl ContextManager {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        messages: Arc<dyn MessageStore>,
        threads: Arc<dyn ThreadStore>,
        params: ContextParams,
        model: impl Into<String>,
    ) -> Result<Self, CoreError> {
        if params.token_threshold <= params.summary_target_tokens + params.reserved_tokens {
            return Err(CoreError::Configuration(format!(
                "token_threshold ({}) must exceed summary_target_tokens ({}) + reserved_tokens ({})",
                params.token_threshold, params.summary_target_tokens, params.reserved_tokens
            )));
        }
        Ok(Self { llm, messages, threads, params, model: model.into() })
    }

    /// Build the outgoing message list for one turn.
    ///
    /// `new_messages` are this turn's inputs, already persisted to the thread
    /// by the caller; their stored copies are deduplicated out of the
    /// historical middle so they appear exactly once, at the end.
    pub async fn assemble(
        &self,
        thread_id: &str,
        system_prompt: &str,
        new_messages: &[ChatMessage],
    ) -> anyhow::Result<Vec<ChatMessage>> {
        let stored = self
            .messages
            .list(thread_id, MessageQuery::recent(HISTORY_FETCH_LIMIT))
            .await?;
        // Restore chronological order (the query returns newest first).
        let history: Vec<ChatMessage> = stored.iter().rev().map(|m| m.to_chat()).collect();

        // An existing summary replaces everything before it.
        let historical = match find_latest_summary(&history) {
            Some(idx) => history[idx..].to_vec(),
            None => history,
        };

        // Drop the historical suffix that duplicates this turn's new messages.
        let mut middle = strip_duplicate_suffix(historical.clone(), new_messages);

        let system = ChatMessage::system(system_prompt);
        let mut tokens = self
            .count(&system, &middle, new_messages)
            .await?;

        let summarizable = middle.iter().filter(|m| m.role != ChatRole::System).count();
        if tokens > self.params.token_threshold && summarizable >= 2 {
            // Summarize the full post-summary tail as persisted (including
            // the stored copies of the new messages) so that nothing in the
            // log falls outside the summary's coverage on later turns.  The
            // new messages still follow verbatim at the end of the output.
            match self.summarize(&historical).await {
                Ok(summary) => {
                    let summary_message = ChatMessage::system(format!(
                        "{SUMMARY_HEADER}\n{summary}\n{SUMMARY_FOOTER}"
                    ));
                    self.persist_summary(thread_id, &summary, &summary_message).await;
                    middle = vec![summary_message];
                    tokens = self.count(&system, &middle, new_messages).await?;
                }
                Err(e) => {
                    // Deterministic truncation below still recovers the budget.
                    warn!("summarization failed, falling back to truncation: {e}");
                }
            }
        }

        // Trim oldest droppable messages until the list fits the ceiling
        // minus the reserved headroom.
        let budget = self.params.token_threshold.saturating_sub(self.params.reserved_tokens);
        while tokens > budget {
            let Some(pos) = middle.iter().position(|m| !is_pinned(m)) else {
                break;
            };
            middle.remove(pos);
            tokens = self.count(&system, &middle, new_messages).await?;
        }
        if tokens > budget {
            warn!(
                tokens,
                budget, "context exceeds budget with only pinned messages left"
            );
        }

        let mut out = Vec::with_capacity(1 + middle.len() + new_messages.len());
        out.push(system);
        out.extend(middle);
        out.extend(new_messages.iter().cloned());
        Ok(out)
    }

    async fn count(
        &self,
        system: &ChatMessage,
        middle: &[ChatMessage],
        new_messages: &[ChatMessage],
    ) -> anyhow::Result<usize> {
        let mut all = Vec::with_capacity(1 + middle.len() + new_messages.len());
        all.push(system.clone());
        all.extend_from_slice(middle);
        all.extend_from_slice(new_messages);
        self.llm.count_tokens(&all, &self.model).await
    }

    /// One tool-free LLM call producing the history summary.
    async fn summarize(&self, historical: &[ChatMessage]) -> anyhow::Result<String> {
        let model = self
            .params
            .summarization_model
            .clone()
            .unwrap_or_else(|| self.model.clone());
        debug!(%model, messages = historical.len(), "summarizing history");

        let request = vec![
            ChatMessage::system(SUMMARIZATION_PROMPT),
            ChatMessage::user(serialize_history(historical)),
        ];
        let options = CompletionOptions {
            model,
            temperature: Some(0.2),
            max_tokens: Some(self.params.summary_target_tokens as u32),
            stream: false,
            ..Default::default()
        };

        let summary = match self.llm.generate(request, options).await? {
            LlmResponse::Complete(msg) => msg.as_text().unwrap_or_default().to_string(),
            LlmResponse::Stream(mut chunks) => {
                use futures::StreamExt;
                let mut text = String::new();
                while let Some(chunk) = chunks.next().await {
                    if let Some(t) = chunk?.text {
                        text.push_str(&t);
                    }
                }
                text
            }
        };
        if summary.trim().is_empty() {
            anyhow::bail!("summarization model returned an empty summary");
        }
        Ok(summary)
    }

    /// Record the summary on the thread and append the sentinel message so
    /// later assemblies pick it up from history.  Failures here degrade
    /// future context quality but must not fail the turn.
    async fn persist_summary(
        &self,
        thread_id: &str,
        summary: &str,
        summary_message: &ChatMessage,
    ) {
        if let Err(e) = self
            .messages
            .add(NewMessage::new(
                thread_id,
                ChatRole::System,
                summary_message.content.clone(),
            ))
            .await
        {
            warn!("failed to persist summary message: {e}");
        }
        if let Err(e) = self
            .threads
            .update(
                thread_id,
                ThreadPatch {
                    latest_summary: Some(summary.to_string()),
                    ..Default::default()
                },
            )
            .await
        {
            warn!("failed to record latest summary on thread: {e}");
        }
    }
}

/// Index of the most recent summary message, if any.
fn find_latest_summary(history: &[ChatMessage]) -> Option<usize> {
    history.iter().rposition(is_summary)
}

fn is_summary(m: &ChatMessage) -> bool {
    m.role == ChatRole::System
        && m.as_text().is_some_and(|t| t.starts_with(SUMMARY_HEADER))
}

/// System prompts and summaries are never truncated away.
fn is_pinned(m: &ChatMessage) -> bool {
    m.role == ChatRole::System
}

/// Remove a trailing block of `historical` that duplicates `new_messages`.
fn strip_duplicate_suffix(
    mut historical: Vec<ChatMessage>,
    new_messages: &[ChatMessage],
) -> Vec<ChatMessage> {
    let n = new_messages.len();
    if n == 0 || historical.len() < n {
        return historical;
    }
    let tail = &historical[historical.len() - n..];
    let duplicated = tail
        .iter()
        .zip(new_messages)
        .all(|(a, b)| same_message(a, b));
    if duplicated {
        historical.truncate(historical.len() - n);
    }
    historical
}

/// Message identity for deduplication: role, content, originating tool-call
/// id, and issued tool-calls list.
fn same_message(a: &ChatMessage, b: &ChatMessage) -> bool {
    a.role == b.role
        && a.content == b.content
        && a.tool_call_id == b.tool_call_id
        && a.tool_calls == b.tool_calls
}

/// Plain-text rendering of a message list for the summarization prompt.
fn serialize_history(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|m| !is_summary(m) && m.role != ChatRole::System)
        .map(|m| {
            let role = match m.role {
                ChatRole::User => "User",
                ChatRole::Assistant => "Assistant",
                ChatRole::Tool => "Tool",
                ChatRole::System => "System",
            };
            let mut text = match &m.content {
                ChatContent::Text(t) => t.clone(),
                parts => parts.flatten(),
            };
            for tc in &m.tool_calls {
                text.push_str(&format!(" [tool_call: {}({})]", tc.name, tc.arguments));
            }
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
