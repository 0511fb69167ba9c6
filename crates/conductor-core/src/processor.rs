// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::collections::HashSet;

use tracing::warn;

use conductor_model::{ChatMessage, FinishReason, StreamChunk};
use conductor_tools::ToolCall;

use crate::errors::codes;

/// A semantic event parsed out of the raw LLM response.
#[derive(Debug, Clone)]
pub enum ParsedEvent {
    TextChunk(String),
    /// A fully assembled tool call with syntactically valid JSON arguments.
    ToolCallDetected(ToolCall),
    StreamEnd(Option<FinishReason>),
    /// A parse error; fatal to the current turn.
    Error { code: &'static str, message: String },
}

/// Per-turn stream parser: converts LLM chunks into semantic events.
///
/// Tool calls may arrive fragmented across chunks, keyed by an integer stream
/// index; fragments are buffered per index and finalized when the chunk
/// carrying the finish reason arrives.  The processor produces a finite,
/// non-restartable event sequence and never retries or mutates model output.
#[derive(Debug, Default)]
pub struct ResponseProcessor {
    /// index → partial assembly, ordered so finalization preserves the
    /// provider's call order.
    pending: BTreeMap<u32, PendingToolCall>,
    finished: bool,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl ResponseProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one stream chunk; returns the events it produced.
    ///
    /// After the finish-reason chunk the processor is exhausted and further
    /// chunks are ignored.
    pub fn on_chunk(&mut self, chunk: StreamChunk) -> Vec<ParsedEvent> {
        if self.finished {
            warn!("stream chunk received after finish reason; ignoring");
            return Vec::new();
        }

        let mut out = Vec::new();
        if let Some(text) = chunk.text {
            if !text.is_empty() {
                out.push(ParsedEvent::TextChunk(text));
            }
        }
        for frag in chunk.tool_calls {
            let ptc = self.pending.entry(frag.index).or_default();
            if let Some(id) = frag.id {
                if !id.is_empty() {
                    ptc.id = id;
                }
            }
            if let Some(name) = frag.name {
                if !name.is_empty() {
                    ptc.name = name;
                }
            }
            if let Some(arguments) = frag.arguments {
                ptc.arguments.push_str(&arguments);
            }
        }
        if let Some(reason) = chunk.finish_reason {
            out.extend(self.finalize(Some(reason)));
        }
        out
    }

    /// The stream ended without ever delivering a finish reason.
    pub fn on_stream_end(&mut self) -> Vec<ParsedEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finalize(None)
    }

    /// Non-streaming path: the LLM returned one complete assistant message.
    ///
    /// Text is suppressed when tool calls are present so the same content is
    /// not billed twice against the conversation.
    pub fn on_complete(&mut self, message: ChatMessage) -> Vec<ParsedEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for tc in &message.tool_calls {
            out.push(match Self::check_call(tc.id.clone(), tc.name.clone(), &tc.arguments, &mut seen) {
                Ok(call) => ParsedEvent::ToolCallDetected(call),
                Err(e) => e,
            });
        }
        if message.tool_calls.is_empty() {
            if let Some(text) = message.as_text() {
                if !text.is_empty() {
                    out.push(ParsedEvent::TextChunk(text.to_string()));
                }
            }
        }
        let reason = if message.tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        };
        out.push(ParsedEvent::StreamEnd(Some(reason)));
        out
    }

    fn finalize(&mut self, reason: Option<FinishReason>) -> Vec<ParsedEvent> {
        self.finished = true;

        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for (_, ptc) in std::mem::take(&mut self.pending) {
            if ptc.id.is_empty() || ptc.name.is_empty() {
                out.push(ParsedEvent::Error {
                    code: codes::INCOMPLETE_TOOL_CALL,
                    message: format!(
                        "tool call ended incomplete (id: {:?}, name: {:?})",
                        ptc.id, ptc.name
                    ),
                });
                continue;
            }
            out.push(match Self::check_call(ptc.id, ptc.name, &ptc.arguments, &mut seen) {
                Ok(call) => ParsedEvent::ToolCallDetected(call),
                Err(e) => e,
            });
        }
        out.push(ParsedEvent::StreamEnd(reason));
        out
    }

    /// Validate argument syntax and id uniqueness for an assembled call.
    fn check_call(
        id: String,
        name: String,
        arguments: &str,
        seen: &mut HashSet<String>,
    ) -> Result<ToolCall, ParsedEvent> {
        if !seen.insert(id.clone()) {
            return Err(ParsedEvent::Error {
                code: codes::DUPLICATE_TOOL_CALL_ID,
                message: format!("duplicate tool call id in one turn: {id}"),
            });
        }
        // Syntax check only; schema validation belongs to the executor.  The
        // raw string is what travels onward.
        if let Err(e) = serde_json::from_str::<serde_json::Value>(arguments) {
            return Err(ParsedEvent::Error {
                code: codes::LLM_PARSE_ERROR,
                message: format!("tool call {id} ({name}) has malformed JSON arguments: {e}"),
            });
        }
        Ok(ToolCall { id, name, arguments: arguments.to_string() })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use conductor_model::ToolCallFragment;

    use super::*;

    fn frag(index: u32, id: Option<&str>, name: Option<&str>, args: Option<&str>) -> StreamChunk {
        StreamChunk {
            tool_calls: vec![ToolCallFragment {
                index,
                id: id.map(Into::into),
                name: name.map(Into::into),
                arguments: args.map(Into::into),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn text_chunks_pass_through() {
        let mut p = ResponseProcessor::new();
        let events = p.on_chunk(StreamChunk::text_delta("hi"));
        assert!(matches!(&events[0], ParsedEvent::TextChunk(t) if t == "hi"));
    }

    #[test]
    fn empty_text_delta_produces_nothing() {
        let mut p = ResponseProcessor::new();
        assert!(p.on_chunk(StreamChunk::text_delta("")).is_empty());
    }

    #[test]
    fn fragmented_tool_call_assembles_on_finish() {
        let mut p = ResponseProcessor::new();
        assert!(p.on_chunk(frag(0, Some("tc1"), Some("lookup"), Some("{\"q\":"))).is_empty());
        assert!(p.on_chunk(frag(0, None, None, Some("\"rust\"}"))).is_empty());
        let events = p.on_chunk(StreamChunk::finish(FinishReason::ToolCalls));

        match &events[0] {
            ParsedEvent::ToolCallDetected(tc) => {
                assert_eq!(tc.id, "tc1");
                assert_eq!(tc.name, "lookup");
                assert_eq!(tc.arguments, "{\"q\":\"rust\"}");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
        assert!(matches!(
            events.last(),
            Some(ParsedEvent::StreamEnd(Some(FinishReason::ToolCalls)))
        ));
    }

    #[test]
    fn parallel_tool_calls_ordered_by_index() {
        let mut p = ResponseProcessor::new();
        // Second call's fragments arrive first.
        p.on_chunk(frag(1, Some("b"), Some("second"), Some("{}")));
        p.on_chunk(frag(0, Some("a"), Some("first"), Some("{}")));
        let events = p.on_chunk(StreamChunk::finish(FinishReason::ToolCalls));

        let ids: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ParsedEvent::ToolCallDetected(tc) => Some(tc.id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn malformed_arguments_yield_llm_parse_error() {
        let mut p = ResponseProcessor::new();
        p.on_chunk(frag(0, Some("tc1"), Some("f"), Some("{not json")));
        let events = p.on_chunk(StreamChunk::finish(FinishReason::ToolCalls));
        assert!(matches!(
            &events[0],
            ParsedEvent::Error { code, .. } if *code == codes::LLM_PARSE_ERROR
        ));
    }

    #[test]
    fn buffer_without_id_yields_incomplete_error() {
        let mut p = ResponseProcessor::new();
        p.on_chunk(frag(0, None, Some("f"), Some("{}")));
        let events = p.on_chunk(StreamChunk::finish(FinishReason::ToolCalls));
        assert!(matches!(
            &events[0],
            ParsedEvent::Error { code, .. } if *code == codes::INCOMPLETE_TOOL_CALL
        ));
    }

    #[test]
    fn duplicate_ids_yield_error() {
        let mut p = ResponseProcessor::new();
        p.on_chunk(frag(0, Some("dup"), Some("f"), Some("{}")));
        p.on_chunk(frag(1, Some("dup"), Some("g"), Some("{}")));
        let events = p.on_chunk(StreamChunk::finish(FinishReason::ToolCalls));
        let has_dup = events.iter().any(|e| {
            matches!(e, ParsedEvent::Error { code, .. } if *code == codes::DUPLICATE_TOOL_CALL_ID)
        });
        assert!(has_dup, "{events:?}");
    }

    #[test]
    fn stream_end_without_reason_is_none() {
        let mut p = ResponseProcessor::new();
        p.on_chunk(StreamChunk::text_delta("partial"));
        let events = p.on_stream_end();
        assert!(matches!(events.last(), Some(ParsedEvent::StreamEnd(None))));
    }

    #[test]
    fn processor_is_not_restartable() {
        let mut p = ResponseProcessor::new();
        p.on_chunk(StreamChunk::finish(FinishReason::Stop));
        assert!(p.on_chunk(StreamChunk::text_delta("late")).is_empty());
        assert!(p.on_stream_end().is_empty());
    }

    // ── Non-streaming path ────────────────────────────────────────────────────

    #[test]
    fn complete_message_with_text_only() {
        let mut p = ResponseProcessor::new();
        let events = p.on_complete(ChatMessage::assistant("whole answer"));
        assert!(matches!(&events[0], ParsedEvent::TextChunk(t) if t == "whole answer"));
        assert!(matches!(
            events.last(),
            Some(ParsedEvent::StreamEnd(Some(FinishReason::Stop)))
        ));
    }

    #[test]
    fn complete_message_with_tool_calls_suppresses_text() {
        let mut p = ResponseProcessor::new();
        let msg = ChatMessage::assistant_with_tool_calls(
            "narration the model added",
            vec![conductor_model::ToolCallRequest {
                id: "tc1".into(),
                name: "f".into(),
                arguments: "{}".into(),
            }],
        );
        let events = p.on_complete(msg);
        assert!(
            !events.iter().any(|e| matches!(e, ParsedEvent::TextChunk(_))),
            "text must be suppressed when tool calls are present"
        );
        assert!(matches!(&events[0], ParsedEvent::ToolCallDetected(tc) if tc.id == "tc1"));
        assert!(matches!(
            events.last(),
            Some(ParsedEvent::StreamEnd(Some(FinishReason::ToolCalls)))
        ));
    }
}
