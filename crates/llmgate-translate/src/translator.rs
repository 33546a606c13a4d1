//! Dispatch across the three caller formats. A same-format
//! translation is a pass-through with only the `model` field rewritten to
//! the upstream-resolved id — round-tripping it through the canonical
//! envelope would risk losing provider-specific fields the envelope
//! doesn't model, for no benefit when no translation is actually needed.

use llmgate_common::CallerFormat;
use serde_json::{Value, json};

use crate::claude::{request_from_claude, request_to_claude, response_from_claude, response_to_claude};
use crate::envelope::CanonicalRequest;
use crate::gemini::{request_from_gemini, request_to_gemini, response_from_gemini, response_to_gemini};
use crate::openai::{request_from_openai, request_to_openai, response_from_openai, response_to_openai};

fn from_format(format: CallerFormat, payload: &Value) -> CanonicalRequest {
    match format {
        CallerFormat::OpenAI => request_from_openai(payload),
        CallerFormat::Claude => request_from_claude(payload),
        CallerFormat::Gemini => request_from_gemini(payload),
    }
}

fn to_format(format: CallerFormat, req: &CanonicalRequest) -> Value {
    match format {
        CallerFormat::OpenAI => request_to_openai(req),
        CallerFormat::Claude => request_to_claude(req),
        CallerFormat::Gemini => request_to_gemini(req, &req.model),
    }
}

/// Translate a caller's request body into the dialect the selected
/// upstream client speaks, rewriting the model field to `upstream_model`
/// (the resolved, possibly-amp-mapped, id) along the way.
pub fn translate_request(source: CallerFormat, payload: &Value, upstream_model: &str, target: CallerFormat) -> Value {
    if source == target {
        let mut out = payload.clone();
        if let Some(obj) = out.as_object_mut() {
            obj.insert("model".to_string(), json!(upstream_model));
        }
        return out;
    }
    let mut canonical = from_format(source, payload);
    canonical.model = upstream_model.to_string();
    to_format(target, &canonical)
}

/// Translate an upstream response back into the caller's dialect,
/// rewriting the model field to `display_model` (the name the caller
/// originally asked for, not the resolved upstream id).
pub fn translate_response(upstream: CallerFormat, payload: &Value, display_model: &str, caller: CallerFormat) -> Value {
    if upstream == caller {
        let mut out = payload.clone();
        if let Some(obj) = out.as_object_mut() {
            obj.insert("model".to_string(), json!(display_model));
        }
        return out;
    }
    let mut canonical = match upstream {
        CallerFormat::OpenAI => response_from_openai(payload),
        CallerFormat::Claude => response_from_claude(payload),
        CallerFormat::Gemini => response_from_gemini(payload, display_model),
    };
    canonical.model = display_model.to_string();
    match caller {
        CallerFormat::OpenAI => response_to_openai(&canonical),
        CallerFormat::Claude => response_to_claude(&canonical),
        CallerFormat::Gemini => response_to_gemini(&canonical),
    }
}

/// Reshape an upstream error into the envelope the caller's dialect
/// expects, so a caller speaking Claude never sees an OpenAI-shaped
/// `{"error": {"type", "message"}}` pair and vice versa.
pub fn map_error(caller: CallerFormat, kind: &str, message: &str) -> Value {
    match caller {
        CallerFormat::OpenAI => json!({ "error": { "message": message, "type": kind, "code": Value::Null } }),
        CallerFormat::Claude => json!({ "type": "error", "error": { "type": kind, "message": message } }),
        CallerFormat::Gemini => json!({ "error": { "code": 400, "message": message, "status": kind } }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openai_request() -> Value {
        json!({
            "model": "gpt-4o",
            "messages": [
                { "role": "system", "content": "be terse" },
                { "role": "user", "content": "hello" },
            ],
            "tools": [{ "type": "function", "function": { "name": "lookup", "parameters": {} } }],
            "stream": false,
        })
    }

    #[test]
    fn same_format_translation_is_a_pass_through_with_model_rewrite() {
        let req = openai_request();
        let out = translate_request(CallerFormat::OpenAI, &req, "gpt-4o-mini", CallerFormat::OpenAI);
        assert_eq!(out["model"], "gpt-4o-mini");
        assert_eq!(out["messages"], req["messages"]);
    }

    #[test]
    fn openai_to_claude_preserves_system_message_and_moves_it_out_of_the_array() {
        let req = openai_request();
        let out = translate_request(CallerFormat::OpenAI, &req, "claude-sonnet-4-5", CallerFormat::Claude);
        assert_eq!(out["system"], "be terse");
        assert_eq!(out["messages"].as_array().unwrap().len(), 1);
        assert_eq!(out["messages"][0]["role"], "user");
    }

    #[test]
    fn claude_to_openai_reinserts_the_system_message_at_the_front() {
        let req = json!({
            "model": "claude-sonnet-4-5",
            "system": "be terse",
            "messages": [{ "role": "user", "content": "hello" }],
            "stream": false,
        });
        let out = translate_request(CallerFormat::Claude, &req, "gpt-4o", CallerFormat::OpenAI);
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "be terse");
        assert_eq!(messages[1]["role"], "user");
    }

    #[test]
    fn round_trip_through_claude_and_back_preserves_model_and_text_and_tool_name() {
        let original = openai_request();
        let via_claude = translate_request(CallerFormat::OpenAI, &original, "claude-sonnet-4-5", CallerFormat::Claude);
        let back = translate_request(CallerFormat::Claude, &via_claude, "gpt-4o", CallerFormat::OpenAI);
        assert_eq!(back["model"], "gpt-4o");
        let messages = back["messages"].as_array().unwrap();
        assert!(messages.iter().any(|m| m["content"] == "hello"));
    }

    #[test]
    fn response_round_trip_preserves_text_and_requested_model_name() {
        let upstream_response = json!({
            "model": "claude-sonnet-4-5",
            "type": "message",
            "role": "assistant",
            "content": [{ "type": "text", "text": "hi there" }],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 5, "output_tokens": 2 },
        });
        let out = translate_response(CallerFormat::Claude, &upstream_response, "claude-sonnet-4-5", CallerFormat::OpenAI);
        assert_eq!(out["model"], "claude-sonnet-4-5");
        assert_eq!(out["choices"][0]["message"]["content"], "hi there");
        assert_eq!(out["choices"][0]["finish_reason"], "end_turn");
    }

    #[test]
    fn gemini_error_is_shaped_with_a_status_field() {
        let err = map_error(CallerFormat::Gemini, "RESOURCE_EXHAUSTED", "quota exceeded");
        assert_eq!(err["error"]["status"], "RESOURCE_EXHAUSTED");
        assert_eq!(err["error"]["message"], "quota exceeded");
    }
}
