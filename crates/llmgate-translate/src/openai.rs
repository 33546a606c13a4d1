//! OpenAI Chat/Completions ↔ canonical envelope.

use serde_json::{Map, Value, json};

use crate::envelope::{CanonicalRequest, CanonicalResponse, ContentBlock, Message, Role, ThinkingMode};

pub fn request_from_openai(payload: &Value) -> CanonicalRequest {
    let mut req = CanonicalRequest { model: str_field(payload, "model"), stream: bool_field(payload, "stream"), ..Default::default() };

    if let Some(messages) = payload.get("messages").and_then(Value::as_array) {
        for m in messages {
            if str_field(m, "role") == "system" {
                let text = match m.get("content") {
                    Some(Value::String(text)) => text.clone(),
                    Some(Value::Array(parts)) => parts
                        .iter()
                        .filter_map(content_block_from_openai_part)
                        .filter_map(|b| match b {
                            ContentBlock::Text(t) => Some(t),
                            _ => None,
                        })
                        .collect::<Vec<_>>()
                        .join(""),
                    _ => String::new(),
                };
                req.system = Some(match req.system.take() {
                    Some(existing) => format!("{existing}\n{text}"),
                    None => text,
                });
                continue;
            }
            let role = match str_field(m, "role").as_str() {
                "assistant" => Role::Assistant,
                "tool" => Role::Tool,
                _ => Role::User,
            };
            let content = match m.get("content") {
                Some(Value::String(text)) => vec![ContentBlock::Text(text.clone())],
                Some(Value::Array(parts)) => parts.iter().filter_map(content_block_from_openai_part).collect(),
                _ => Vec::new(),
            };
            req.messages.push(Message { role, content });
        }
    }

    req.tools = payload.get("tools").and_then(Value::as_array).cloned().unwrap_or_default();
    req.max_tokens = payload.get("max_tokens").and_then(Value::as_u64);
    req.temperature = payload.get("temperature").and_then(Value::as_f64);
    req.thinking = payload.get("reasoning_effort").and_then(Value::as_str).map(|level| {
        ThinkingMode::Level(match level {
            "low" => "low",
            "high" => "high",
            _ => "medium",
        })
    });

    if let Some(obj) = payload.as_object() {
        for (k, v) in obj {
            if !matches!(k.as_str(), "model" | "messages" | "tools" | "max_tokens" | "temperature" | "stream" | "reasoning_effort") {
                req.extra.insert(k.clone(), v.clone());
            }
        }
    }
    req
}

fn content_block_from_openai_part(part: &Value) -> Option<ContentBlock> {
    match part.get("type").and_then(Value::as_str) {
        Some("text") => Some(ContentBlock::Text(str_field(part, "text"))),
        _ => None,
    }
}

pub fn request_to_openai(req: &CanonicalRequest) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = &req.system {
        messages.push(json!({ "role": "system", "content": system }));
    }
    for m in &req.messages {
        messages.push(json!({ "role": m.role.as_str(), "content": m.text() }));
    }
    let mut out = Map::new();
    out.insert("model".to_string(), json!(req.model));
    out.insert("messages".to_string(), json!(messages));
    out.insert("stream".to_string(), json!(req.stream));
    if !req.tools.is_empty() {
        out.insert("tools".to_string(), json!(req.tools));
    }
    if let Some(max_tokens) = req.max_tokens {
        out.insert("max_tokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = req.temperature {
        out.insert("temperature".to_string(), json!(temperature));
    }
    for (k, v) in &req.extra {
        out.entry(k.clone()).or_insert_with(|| v.clone());
    }
    Value::Object(out)
}

pub fn response_from_openai(payload: &Value) -> CanonicalResponse {
    let model = str_field(payload, "model");
    let choice = payload.get("choices").and_then(Value::as_array).and_then(|c| c.first());
    let mut content = Vec::new();
    let mut stop_reason = None;
    if let Some(choice) = choice {
        stop_reason = choice.get("finish_reason").and_then(Value::as_str).map(str::to_string);
        if let Some(message) = choice.get("message") {
            if let Some(text) = message.get("content").and_then(Value::as_str) {
                content.push(ContentBlock::Text(text.to_string()));
            }
            if let Some(reasoning) = message.get("reasoning").and_then(Value::as_str) {
                content.push(ContentBlock::Thinking(reasoning.to_string()));
            }
            if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
                for call in tool_calls {
                    let id = str_field(call, "id");
                    let function = call.get("function").cloned().unwrap_or(Value::Null);
                    let name = str_field(&function, "name");
                    let input = function
                        .get("arguments")
                        .and_then(Value::as_str)
                        .and_then(|s| serde_json::from_str(s).ok())
                        .unwrap_or(Value::Null);
                    content.push(ContentBlock::ToolUse { id, name, input });
                }
            }
        }
    }
    let usage = payload.get("usage");
    CanonicalResponse {
        model,
        content,
        stop_reason,
        input_tokens: usage.and_then(|u| u.get("prompt_tokens")).and_then(Value::as_u64),
        output_tokens: usage.and_then(|u| u.get("completion_tokens")).and_then(Value::as_u64),
    }
}

pub fn response_to_openai(resp: &CanonicalResponse) -> Value {
    let mut message = Map::new();
    message.insert("role".to_string(), json!("assistant"));
    let text: String =
        resp.content.iter().filter_map(|b| if let ContentBlock::Text(t) = b { Some(t.clone()) } else { None }).collect();
    message.insert("content".to_string(), json!(text));

    let tool_calls: Vec<Value> = resp
        .content
        .iter()
        .filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } => Some(json!({
                "id": id,
                "type": "function",
                "function": { "name": name, "arguments": input.to_string() },
            })),
            _ => None,
        })
        .collect();
    if !tool_calls.is_empty() {
        message.insert("tool_calls".to_string(), json!(tool_calls));
    }
    if let Some(reasoning) = resp.content.iter().find_map(|b| if let ContentBlock::Thinking(t) = b { Some(t.clone()) } else { None }) {
        message.insert("reasoning".to_string(), json!(reasoning));
    }

    json!({
        "model": resp.model,
        "choices": [{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": resp.stop_reason.clone().unwrap_or_else(|| "stop".to_string()),
        }],
        "usage": {
            "prompt_tokens": resp.input_tokens.unwrap_or(0),
            "completion_tokens": resp.output_tokens.unwrap_or(0),
        },
    })
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn bool_field(v: &Value, key: &str) -> bool {
    v.get(key).and_then(Value::as_bool).unwrap_or(false)
}
