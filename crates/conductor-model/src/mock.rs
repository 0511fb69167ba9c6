// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::client::{LlmClient, LlmResponse};
use crate::types::{ChatMessage, CompletionOptions, FinishReason, StreamChunk};

/// One scripted reply for the mock client.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    /// Streamed reply: the chunks are emitted in order.
    Chunks(Vec<StreamChunk>),
    /// Non-streamed reply: a single finished assistant message.
    Complete(ChatMessage),
    /// The stream yields one error item (transport failure mid-stream).
    StreamError(String),
}

/// A pre-scripted mock client.  Each call to `generate` pops the next script
/// from the front of the queue, so tests can specify exact chunk sequences —
/// including fragmented tool calls — without network access.
pub struct ScriptedLlmClient {
    scripts: Arc<Mutex<Vec<ScriptedResponse>>>,
    /// The last request seen by this client.  Written on each `generate` call
    /// so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<(Vec<ChatMessage>, CompletionOptions)>>>,
    /// Every request seen, in order.  Useful for asserting on summarization
    /// calls that happen between user-visible turns.
    pub requests: Arc<Mutex<Vec<(Vec<ChatMessage>, CompletionOptions)>>>,
}

impl ScriptedLlmClient {
    pub fn new(scripts: Vec<ScriptedResponse>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            last_request: Arc::new(Mutex::new(None)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: client that streams a single text reply and stops.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![ScriptedResponse::Chunks(vec![
            StreamChunk::text_delta(reply),
            StreamChunk::finish(FinishReason::Stop),
        ])])
    }

    /// Convenience: client that issues one tool call, then a text reply on
    /// the following call.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            ScriptedResponse::Chunks(vec![
                StreamChunk::tool_call(0, tool_id, tool_name, args_json),
                StreamChunk::finish(FinishReason::ToolCalls),
            ]),
            ScriptedResponse::Chunks(vec![
                StreamChunk::text_delta(final_text),
                StreamChunk::finish(FinishReason::Stop),
            ]),
        ])
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> anyhow::Result<LlmResponse> {
        *self.last_request.lock().unwrap() = Some((messages.clone(), options.clone()));
        self.requests.lock().unwrap().push((messages, options));

        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed.
                tracing::warn!("scripted client exhausted; returning fallback text");
                ScriptedResponse::Chunks(vec![
                    StreamChunk::text_delta("[no more scripts]"),
                    StreamChunk::finish(FinishReason::Stop),
                ])
            } else {
                scripts.remove(0)
            }
        };

        Ok(match script {
            ScriptedResponse::Chunks(chunks) => {
                let items: Vec<anyhow::Result<StreamChunk>> =
                    chunks.into_iter().map(Ok).collect();
                LlmResponse::Stream(Box::pin(stream::iter(items)))
            }
            ScriptedResponse::Complete(msg) => LlmResponse::Complete(msg),
            ScriptedResponse::StreamError(msg) => {
                let items: Vec<anyhow::Result<StreamChunk>> = vec![Err(anyhow::anyhow!(msg))];
                LlmResponse::Stream(Box::pin(stream::iter(items)))
            }
        })
    }

    /// chars/4 heuristic; deterministic, which is what the context-manager
    /// tests rely on.
    async fn count_tokens(&self, messages: &[ChatMessage], _model: &str) -> anyhow::Result<usize> {
        Ok(messages.iter().map(|m| m.approx_tokens()).sum())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
