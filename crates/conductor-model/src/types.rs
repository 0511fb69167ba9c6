use serde::{Deserialize, Serialize};

// ─── Content part types ───────────────────────────────────────────────────────

/// A single content part in a multi-part message.
///
/// Used for user messages that mix text with images.  Images are represented
/// as data URLs (`data:<mime>;base64,<b64>`) or HTTPS URLs for providers that
/// accept remote references.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: String },
}

impl ContentPart {
    /// Convenience constructor for a plain text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Convenience constructor for an image part.
    pub fn image(image_url: impl Into<String>) -> Self {
        Self::ImageUrl { image_url: image_url.into() }
    }
}

/// The content of a message: a plain string or an ordered part sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl ChatContent {
    /// Return the plain text of this content, if it is a single text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            Self::Parts(parts) if parts.len() == 1 => match &parts[0] {
                ContentPart::Text { text } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    /// Lossy flattening to plain text; image parts become a placeholder.
    pub fn flatten(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.as_str(),
                    ContentPart::ImageUrl { .. } => "[image]",
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

impl From<String> for ChatContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for ChatContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation issued by the model.
///
/// `arguments` is the raw JSON string exactly as the model produced it; it is
/// forwarded verbatim when logging or echoing the call and only parsed at the
/// validation boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// A single message as presented to (or received from) the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: ChatContent,
    /// Tool calls issued by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// For tool messages: the id of the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For tool messages: the function name that produced this result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(ChatRole::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(ChatRole::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(ChatRole::Assistant, text)
    }

    fn text(role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: ChatContent::Text(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    /// Assistant message carrying one or more tool calls alongside its text.
    pub fn assistant_with_tool_calls(
        text: impl Into<String>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: ChatContent::Text(text.into()),
            tool_calls,
            tool_call_id: None,
            name: None,
        }
    }

    /// Tool-role message answering a specific tool call.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: ChatRole::Tool,
            content: ChatContent::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }

    /// Return the plain text of this message, if any.
    pub fn as_text(&self) -> Option<&str> {
        self.content.as_text()
    }

    /// Approximate token count used for context budgeting.
    ///
    /// Uses a 4-chars-per-token heuristic for text; image parts count a fixed
    /// 765 tokens (the typical high-detail estimate for a 512×512 region).
    pub fn approx_tokens(&self) -> usize {
        let mut chars = match &self.content {
            ChatContent::Text(t) => t.len(),
            ChatContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    ContentPart::ImageUrl { .. } => 765 * 4,
                })
                .sum(),
        };
        for tc in &self.tool_calls {
            chars += tc.name.len() + tc.arguments.len();
        }
        (chars / 4).max(1)
    }
}

// ─── Completion options ───────────────────────────────────────────────────────

/// How the model is allowed to use tools this turn.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
    /// Force a specific function by name.
    Function(String),
}

impl ToolChoice {
    /// Wire representation in the OpenAI function-calling dialect.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Self::Auto => serde_json::Value::String("auto".into()),
            Self::None => serde_json::Value::String("none".into()),
            Self::Required => serde_json::Value::String("required".into()),
            Self::Function(name) => serde_json::json!({
                "type": "function",
                "function": { "name": name }
            }),
        }
    }
}

/// Options for a single completion request.
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    pub model: String,
    /// Provider-formatted tool list (see `LlmClient::format_tools`).
    pub tools: Vec<serde_json::Value>,
    pub tool_choice: ToolChoice,
    pub stream: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// System prompt passthrough for clients that carry it out of band.
    pub system_prompt: Option<String>,
    /// Opaque provider-specific options forwarded verbatim.
    pub provider_options: Option<serde_json::Value>,
}

// ─── Tool schema ──────────────────────────────────────────────────────────────

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

// ─── Streaming types ──────────────────────────────────────────────────────────

/// Why the model stopped producing output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "stop" => Self::Stop,
            "tool_calls" => Self::ToolCalls,
            "length" => Self::Length,
            "content_filter" => Self::ContentFilter,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Stop => "stop",
            Self::ToolCalls => "tool_calls",
            Self::Length => "length",
            Self::ContentFilter => "content_filter",
            Self::Other(s) => s,
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fragment of a tool call delivered inside a stream chunk.
///
/// Providers interleave fragments for parallel tool calls by `index`; each
/// field may arrive in a different chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallFragment {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// One chunk of a streaming completion.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    /// Text delta, if this chunk carries one.
    pub text: Option<String>,
    /// Tool-call fragments carried by this chunk.
    pub tool_calls: Vec<ToolCallFragment>,
    /// Present on the final content chunk of the stream.
    pub finish_reason: Option<FinishReason>,
}

impl StreamChunk {
    pub fn text_delta(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), ..Default::default() }
    }

    pub fn finish(reason: FinishReason) -> Self {
        Self { finish_reason: Some(reason), ..Default::default() }
    }

    /// Chunk carrying a complete tool call at the given stream index.
    pub fn tool_call(
        index: u32,
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            tool_calls: vec![ToolCallFragment {
                index,
                id: Some(id.into()),
                name: Some(name.into()),
                arguments: Some(arguments.into()),
            }],
            ..Default::default()
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
