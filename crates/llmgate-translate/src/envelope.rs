//! Canonical request/response envelope. Every caller format converts to and from this shape rather
//! than the hexagon being six bespoke pairwise converters; a (source,
//! target) translation is `to_target(from_source(payload))`.
//!
//! The envelope carries only what the testable properties require —
//! model name, role sequence, content text, tool-call name/args, and
//! thinking blocks — and keeps anything else (temperature, top_p,
//! provider-specific knobs) in an opaque `extra` JSON object so it
//! survives a round trip without needing a dedicated field per provider
//! flag.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    Thinking(String),
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn text_only(role: Role, text: impl Into<String>) -> Self {
        Self { role, content: vec![ContentBlock::Text(text.into())] }
    }

    /// Concatenated text content, ignoring tool/thinking blocks — used by
    /// the round-trip test and by formats that only have a flat string.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThinkingMode {
    Budget(u64),
    Auto,
    Level(&'static str),
}

#[derive(Debug, Clone, Default)]
pub struct CanonicalRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<Value>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub stream: bool,
    pub thinking: Option<ThinkingMode>,
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct CanonicalResponse {
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl Default for Message {
    fn default() -> Self {
        Self { role: Role::User, content: Vec::new() }
    }
}
