// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod client;
mod mock;
mod types;

pub use client::{ChunkStream, LlmClient, LlmResponse};
pub use mock::{ScriptedLlmClient, ScriptedResponse};
pub use types::{
    ChatContent, ChatMessage, ChatRole, CompletionOptions, ContentPart, FinishReason, StreamChunk,
    ToolCallFragment, ToolCallRequest, ToolChoice, ToolSchema,
};
