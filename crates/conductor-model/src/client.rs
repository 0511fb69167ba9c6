// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::types::{ChatMessage, CompletionOptions, StreamChunk, ToolSchema};

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

/// The result of a completion request: a finished message or a chunk stream,
/// depending on `CompletionOptions::stream`.
pub enum LlmResponse {
    Complete(ChatMessage),
    Stream(ChunkStream),
}

impl std::fmt::Debug for LlmResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete(m) => f.debug_tuple("Complete").field(m).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Transport-agnostic LLM client.
///
/// The orchestration core only ever talks to this trait: it asks for a
/// completion (streamed or not), counts tokens for context budgeting, and
/// formats tool schemas into whatever shape the provider expects.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a completion request.  When `options.stream` is set the response
    /// is a chunk stream; otherwise a single complete assistant message.
    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> anyhow::Result<LlmResponse>;

    /// Count the tokens the given messages occupy for `model`.
    async fn count_tokens(&self, messages: &[ChatMessage], model: &str) -> anyhow::Result<usize>;

    /// Format tool schemas for this provider.
    ///
    /// The default produces the OpenAI function-calling shape; providers with
    /// a different tool dialect override this.
    fn format_tools(&self, schemas: &[ToolSchema]) -> Vec<serde_json::Value> {
        schemas
            .iter()
            .map(|s| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": s.name,
                        "description": s.description,
                        "parameters": s.parameters,
                    }
                })
            })
            .collect()
    }
}
