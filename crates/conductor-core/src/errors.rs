// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use conductor_store::StoreError;

/// Stable error codes recorded on `thread.run.failed` events and in run
/// records.
pub mod codes {
    /// The safety counter tripped (turns exceeded the continuation budget).
    pub const ITERATION_LIMIT_EXCEEDED: &str = "iteration_limit_exceeded";
    /// Tool-call arguments assembled from the stream were not valid JSON.
    pub const LLM_PARSE_ERROR: &str = "llm_parse_error";
    /// A tool-call buffer was still missing its id or name at stream end.
    pub const INCOMPLETE_TOOL_CALL: &str = "incomplete_tool_call";
    /// One assistant turn issued two tool calls with the same id.
    pub const DUPLICATE_TOOL_CALL_ID: &str = "duplicate_tool_call_id";
    /// The model stopped for a reason the loop cannot continue from.
    pub const LLM_FINISH_REASON_ERROR: &str = "llm_finish_reason_error";
    /// Every tool in a turn failed and no result message could be built.
    pub const ALL_TOOLS_FAILED: &str = "all_tools_failed";
    /// Transport or mid-stream failure from the LLM client.
    pub const LLM_ERROR: &str = "llm_error";
    /// A storage operation failed; the message preserves the backend error.
    pub const STORAGE_ERROR: &str = "storage_error";
    /// The event stream ended without a terminal event.
    pub const ABNORMAL_TERMINATION: &str = "abnormal_termination";
    /// A specialist sub-run ended paused instead of terminating.
    pub const STOPPED_REQUIRING_ACTION: &str = "stopped_requiring_action";
}

/// Synchronous errors raised by the core's public surface.
///
/// Everything that happens *inside* a run is reported through the event
/// stream instead; these are the construction-time and call-time failures.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Missing or inconsistent setup detected at construction.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Operation invoked against a run or manager in the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
