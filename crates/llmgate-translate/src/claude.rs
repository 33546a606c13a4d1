//! Anthropic Messages ↔ canonical envelope.

use serde_json::{Map, Value, json};

use crate::envelope::{CanonicalRequest, CanonicalResponse, ContentBlock, Message, Role, ThinkingMode};

pub fn request_from_claude(payload: &Value) -> CanonicalRequest {
    let mut req = CanonicalRequest { model: str_field(payload, "model"), stream: bool_field(payload, "stream"), ..Default::default() };

    req.system = payload.get("system").and_then(Value::as_str).map(str::to_string);

    if let Some(messages) = payload.get("messages").and_then(Value::as_array) {
        for m in messages {
            let role = if str_field(m, "role") == "assistant" { Role::Assistant } else { Role::User };
            let content = match m.get("content") {
                Some(Value::String(text)) => vec![ContentBlock::Text(text.clone())],
                Some(Value::Array(parts)) => parts.iter().filter_map(content_block_from_claude_block).collect(),
                _ => Vec::new(),
            };
            req.messages.push(Message { role, content });
        }
    }

    req.tools = payload.get("tools").and_then(Value::as_array).cloned().unwrap_or_default();
    req.max_tokens = payload.get("max_tokens").and_then(Value::as_u64);
    req.temperature = payload.get("temperature").and_then(Value::as_f64);
    if let Some(thinking) = payload.get("thinking") {
        req.thinking = thinking.get("budget_tokens").and_then(Value::as_u64).map(ThinkingMode::Budget);
    }

    if let Some(obj) = payload.as_object() {
        for (k, v) in obj {
            if !matches!(k.as_str(), "model" | "messages" | "system" | "tools" | "max_tokens" | "temperature" | "stream" | "thinking") {
                req.extra.insert(k.clone(), v.clone());
            }
        }
    }
    req
}

fn content_block_from_claude_block(block: &Value) -> Option<ContentBlock> {
    match block.get("type").and_then(Value::as_str) {
        Some("text") => Some(ContentBlock::Text(str_field(block, "text"))),
        Some("thinking") => Some(ContentBlock::Thinking(str_field(block, "thinking"))),
        Some("tool_use") => Some(ContentBlock::ToolUse {
            id: str_field(block, "id"),
            name: str_field(block, "name"),
            input: block.get("input").cloned().unwrap_or(Value::Null),
        }),
        Some("tool_result") => Some(ContentBlock::ToolResult {
            tool_use_id: str_field(block, "tool_use_id"),
            content: block.get("content").cloned().unwrap_or(Value::Null),
        }),
        _ => None,
    }
}

pub fn request_to_claude(req: &CanonicalRequest) -> Value {
    let mut messages = Vec::new();
    for m in &req.messages {
        if m.role == Role::System {
            continue;
        }
        messages.push(json!({
            "role": if m.role == Role::Assistant { "assistant" } else { "user" },
            "content": content_blocks_to_claude(&m.content),
        }));
    }
    let mut out = Map::new();
    out.insert("model".to_string(), json!(req.model));
    out.insert("messages".to_string(), json!(messages));
    out.insert("stream".to_string(), json!(req.stream));
    out.insert("max_tokens".to_string(), json!(req.max_tokens.unwrap_or(4096)));
    if let Some(system) = &req.system {
        out.insert("system".to_string(), json!(system));
    }
    if !req.tools.is_empty() {
        out.insert("tools".to_string(), json!(req.tools));
    }
    if let Some(temperature) = req.temperature {
        out.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(ThinkingMode::Budget(budget)) = req.thinking {
        out.insert("thinking".to_string(), json!({ "type": "enabled", "budget_tokens": budget }));
    }
    for (k, v) in &req.extra {
        out.entry(k.clone()).or_insert_with(|| v.clone());
    }
    Value::Object(out)
}

fn content_blocks_to_claude(blocks: &[ContentBlock]) -> Value {
    let parts: Vec<Value> = blocks
        .iter()
        .map(|b| match b {
            ContentBlock::Text(t) => json!({ "type": "text", "text": t }),
            ContentBlock::Thinking(t) => json!({ "type": "thinking", "thinking": t }),
            ContentBlock::ToolUse { id, name, input } => {
                json!({ "type": "tool_use", "id": id, "name": name, "input": input })
            }
            ContentBlock::ToolResult { tool_use_id, content } => {
                json!({ "type": "tool_result", "tool_use_id": tool_use_id, "content": content })
            }
        })
        .collect();
    json!(parts)
}

pub fn response_from_claude(payload: &Value) -> CanonicalResponse {
    let model = str_field(payload, "model");
    let content = payload
        .get("content")
        .and_then(Value::as_array)
        .map(|parts| parts.iter().filter_map(content_block_from_claude_block).collect())
        .unwrap_or_default();
    let usage = payload.get("usage");
    CanonicalResponse {
        model,
        content,
        stop_reason: payload.get("stop_reason").and_then(Value::as_str).map(str::to_string),
        input_tokens: usage.and_then(|u| u.get("input_tokens")).and_then(Value::as_u64),
        output_tokens: usage.and_then(|u| u.get("output_tokens")).and_then(Value::as_u64),
    }
}

pub fn response_to_claude(resp: &CanonicalResponse) -> Value {
    json!({
        "model": resp.model,
        "type": "message",
        "role": "assistant",
        "content": content_blocks_to_claude(&resp.content),
        "stop_reason": resp.stop_reason.clone().unwrap_or_else(|| "end_turn".to_string()),
        "usage": {
            "input_tokens": resp.input_tokens.unwrap_or(0),
            "output_tokens": resp.output_tokens.unwrap_or(0),
        },
    })
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn bool_field(v: &Value, key: &str) -> bool {
    v.get(key).and_then(Value::as_bool).unwrap_or(false)
}
