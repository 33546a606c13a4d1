//! Google Gemini GenerateContent ↔ canonical envelope.

use serde_json::{Map, Value, json};

use crate::envelope::{CanonicalRequest, CanonicalResponse, ContentBlock, Message, Role, ThinkingMode};

pub fn request_from_gemini(payload: &Value) -> CanonicalRequest {
    let mut req = CanonicalRequest::default();

    if let Some(system) = payload.get("systemInstruction") {
        req.system = extract_text_parts(system);
    }

    if let Some(contents) = payload.get("contents").and_then(Value::as_array) {
        for c in contents {
            let role = if str_field(c, "role") == "model" { Role::Assistant } else { Role::User };
            let content = c
                .get("parts")
                .and_then(Value::as_array)
                .map(|parts| parts.iter().filter_map(content_block_from_gemini_part).collect())
                .unwrap_or_default();
            req.messages.push(Message { role, content });
        }
    }

    if let Some(tools) = payload.get("tools").and_then(Value::as_array) {
        req.tools = tools.clone();
    }

    if let Some(gen_config) = payload.get("generationConfig") {
        req.max_tokens = gen_config.get("maxOutputTokens").and_then(Value::as_u64);
        req.temperature = gen_config.get("temperature").and_then(Value::as_f64);
        if let Some(budget) = gen_config.get("thinkingConfig").and_then(|t| t.get("thinkingBudget")).and_then(Value::as_u64) {
            req.thinking = Some(ThinkingMode::Budget(budget));
        }
    }

    if let Some(obj) = payload.as_object() {
        for (k, v) in obj {
            if !matches!(k.as_str(), "contents" | "systemInstruction" | "tools" | "generationConfig") {
                req.extra.insert(k.clone(), v.clone());
            }
        }
    }
    req
}

fn extract_text_parts(node: &Value) -> Option<String> {
    node.get("parts")
        .and_then(Value::as_array)
        .map(|parts| parts.iter().filter_map(|p| p.get("text").and_then(Value::as_str)).collect::<Vec<_>>().join(""))
}

fn content_block_from_gemini_part(part: &Value) -> Option<ContentBlock> {
    if let Some(text) = part.get("text").and_then(Value::as_str) {
        return Some(if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
            ContentBlock::Thinking(text.to_string())
        } else {
            ContentBlock::Text(text.to_string())
        });
    }
    if let Some(call) = part.get("functionCall") {
        return Some(ContentBlock::ToolUse {
            id: str_field(call, "name"),
            name: str_field(call, "name"),
            input: call.get("args").cloned().unwrap_or(Value::Null),
        });
    }
    if let Some(response) = part.get("functionResponse") {
        return Some(ContentBlock::ToolResult {
            tool_use_id: str_field(response, "name"),
            content: response.get("response").cloned().unwrap_or(Value::Null),
        });
    }
    None
}

pub fn request_to_gemini(req: &CanonicalRequest, model_for_path: &str) -> Value {
    let contents: Vec<Value> = req
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            json!({
                "role": if m.role == Role::Assistant { "model" } else { "user" },
                "parts": content_blocks_to_gemini_parts(&m.content),
            })
        })
        .collect();

    let mut out = Map::new();
    out.insert("contents".to_string(), json!(contents));
    if let Some(system) = &req.system {
        out.insert("systemInstruction".to_string(), json!({ "parts": [{ "text": system }] }));
    }
    if !req.tools.is_empty() {
        out.insert("tools".to_string(), json!(req.tools));
    }

    let mut gen_config = Map::new();
    if let Some(max_tokens) = req.max_tokens {
        gen_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = req.temperature {
        gen_config.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(ThinkingMode::Budget(budget)) = req.thinking {
        gen_config.insert("thinkingConfig".to_string(), json!({ "thinkingBudget": budget }));
    }
    if !gen_config.is_empty() {
        out.insert("generationConfig".to_string(), Value::Object(gen_config));
    }
    for (k, v) in &req.extra {
        out.entry(k.clone()).or_insert_with(|| v.clone());
    }
    let _ = model_for_path; // the model travels in the URL path for Gemini, not the body
    Value::Object(out)
}

fn content_blocks_to_gemini_parts(blocks: &[ContentBlock]) -> Value {
    let parts: Vec<Value> = blocks
        .iter()
        .map(|b| match b {
            ContentBlock::Text(t) => json!({ "text": t }),
            ContentBlock::Thinking(t) => json!({ "text": t, "thought": true }),
            ContentBlock::ToolUse { name, input, .. } => json!({ "functionCall": { "name": name, "args": input } }),
            ContentBlock::ToolResult { tool_use_id, content } => {
                json!({ "functionResponse": { "name": tool_use_id, "response": content } })
            }
        })
        .collect();
    json!(parts)
}

pub fn response_from_gemini(payload: &Value, model: &str) -> CanonicalResponse {
    let candidate = payload.get("candidates").and_then(Value::as_array).and_then(|c| c.first());
    let content = candidate
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| parts.iter().filter_map(content_block_from_gemini_part).collect())
        .unwrap_or_default();
    let stop_reason = candidate.and_then(|c| c.get("finishReason")).and_then(Value::as_str).map(str::to_string);
    let usage = payload.get("usageMetadata");
    CanonicalResponse {
        model: model.to_string(),
        content,
        stop_reason,
        input_tokens: usage.and_then(|u| u.get("promptTokenCount")).and_then(Value::as_u64),
        output_tokens: usage.and_then(|u| u.get("candidatesTokenCount")).and_then(Value::as_u64),
    }
}

pub fn response_to_gemini(resp: &CanonicalResponse) -> Value {
    json!({
        "candidates": [{
            "content": { "role": "model", "parts": content_blocks_to_gemini_parts(&resp.content) },
            "finishReason": resp.stop_reason.clone().unwrap_or_else(|| "STOP".to_string()),
        }],
        "usageMetadata": {
            "promptTokenCount": resp.input_tokens.unwrap_or(0),
            "candidatesTokenCount": resp.output_tokens.unwrap_or(0),
        },
    })
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}
