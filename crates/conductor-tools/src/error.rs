// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::{Map, Value};

use crate::tool::ToolResult;

/// Errors raised while dispatching a single tool call.
///
/// These never escape the executor: every variant is folded into a
/// non-success [`ToolResult`] whose metadata carries the error class name.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: {name}")]
    NotFound { name: String },

    #[error("invalid tool arguments: {reason}")]
    InvalidArguments { reason: String, raw: String },

    #[error("argument validation failed: {}", errors.join("; "))]
    Validation { errors: Vec<String> },

    #[error("tool provider initialization failed: {0}")]
    Initialization(String),
}

impl ToolError {
    /// Stable class name recorded in result metadata.
    pub fn error_name(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "ToolNotFoundError",
            Self::InvalidArguments { .. } => "ValidationError",
            Self::Validation { .. } => "ValidationError",
            Self::Initialization(_) => "InitializationError",
        }
    }

    /// Fold this error into the executor's result slot.
    pub fn into_result(self) -> ToolResult {
        let mut metadata = Map::new();
        metadata.insert("errorName".into(), Value::String(self.error_name().into()));
        match &self {
            Self::InvalidArguments { raw, .. } => {
                metadata.insert("rawArguments".into(), Value::String(raw.clone()));
            }
            Self::Validation { errors } => {
                metadata.insert(
                    "validationErrors".into(),
                    Value::Array(errors.iter().cloned().map(Value::String).collect()),
                );
            }
            _ => {}
        }
        ToolResult::fail(self.to_string()).with_metadata(metadata)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_tool_not_found_error() {
        let r = ToolError::NotFound { name: "nope".into() }.into_result();
        assert!(!r.success);
        assert_eq!(r.metadata_str("errorName"), Some("ToolNotFoundError"));
        assert!(r.error.unwrap().contains("nope"));
    }

    #[test]
    fn invalid_arguments_keeps_raw_string() {
        let r = ToolError::InvalidArguments {
            reason: "expected value".into(),
            raw: "{not json".into(),
        }
        .into_result();
        assert_eq!(r.metadata_str("rawArguments"), Some("{not json"));
        assert_eq!(r.metadata_str("errorName"), Some("ValidationError"));
    }

    #[test]
    fn validation_carries_error_list() {
        let r = ToolError::Validation { errors: vec!["a".into(), "b".into()] }.into_result();
        let errs = r.metadata.unwrap()["validationErrors"].clone();
        assert_eq!(errs, serde_json::json!(["a", "b"]));
    }
}
