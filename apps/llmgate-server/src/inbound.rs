//! Inbound OpenAI/Claude/Gemini endpoints. Each handler does the
//! same four things: pick the caller format, pull the requested model out
//! of wherever that format puts it, build a `RouteRequest`, and hand it to
//! the Conductor (non-streaming) or the bootstrap driver (streaming).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use axum::routing::{get, post};
use futures_util::stream::{self, Stream};
use llmgate_common::{CallerFormat, GatewayError, Op, RouteRequest};
use llmgate_conductor::{CallerStreamChunk, drive_stream};
use llmgate_translate::{CanonicalStreamEvent, map_error};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::state::SharedState;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/v1/chat/completions", post(openai_chat_completions))
        .route("/v1/completions", post(openai_chat_completions))
        .route("/v1/models", get(openai_models_list))
        .route("/v1/messages", post(claude_messages))
        .route("/v1beta/models", get(gemini_models_list))
        .route("/v1beta/models/{*name}", post(gemini_generate))
}

fn error_to_response(caller_format: CallerFormat, err: GatewayError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let kind = match &err {
        GatewayError::CallerError(_) => "invalid_request_error",
        GatewayError::AuthError(_) => "authentication_error",
        GatewayError::NoCapacity { .. } => "overloaded_error",
        GatewayError::UpstreamTransient(_) => "api_error",
        GatewayError::QuotaExceeded { .. } => "rate_limit_error",
        GatewayError::CredentialExpired { .. } => "authentication_error",
        GatewayError::Suspended { .. } => "overloaded_error",
        GatewayError::InternalBug(_) => "api_error",
    };
    (status, Json(map_error(caller_format, kind, &err.to_string()))).into_response()
}

async fn openai_chat_completions(State(state): State<SharedState>, Json(body): Json<Value>) -> Response {
    let model = body.get("model").and_then(Value::as_str).unwrap_or_default().to_string();
    let streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    handle_request(state, CallerFormat::OpenAI, model, streaming, body).await
}

async fn claude_messages(State(state): State<SharedState>, Json(body): Json<Value>) -> Response {
    let model = body.get("model").and_then(Value::as_str).unwrap_or_default().to_string();
    let streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    handle_request(state, CallerFormat::Claude, model, streaming, body).await
}

/// `{name}` is `<model>:<operation>`; axum's `{*name}` wildcard captures
/// the colon verbatim since it is not a path separator.
async fn gemini_generate(State(state): State<SharedState>, Path(name): Path<String>, Json(body): Json<Value>) -> Response {
    let Some((model, operation)) = name.rsplit_once(':') else {
        return error_to_response(CallerFormat::Gemini, GatewayError::CallerError(format!("malformed path: {name}")));
    };
    let streaming = match operation {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => return error_to_response(CallerFormat::Gemini, GatewayError::CallerError(format!("unsupported operation: {other}"))),
    };
    handle_request(state, CallerFormat::Gemini, model.to_string(), streaming, body).await
}

async fn handle_request(state: SharedState, caller_format: CallerFormat, model: String, streaming: bool, payload: Value) -> Response {
    let route = RouteRequest {
        caller_format,
        requested_model: model.clone(),
        op: if streaming { Op::StreamGenerateContent } else { Op::GenerateContent },
        streaming,
        payload,
    };

    if !streaming {
        let cancel = CancellationToken::new();
        return match state.conductor.handle(&route, &cancel).await {
            Ok(outcome) => Json(outcome.body).into_response(),
            Err(err) => error_to_response(caller_format, err),
        };
    }

    stream_response(state, route).await
}

/// Streaming goes through the same Parse/Resolve steps as
/// `Conductor::handle` before handing off to `drive_stream`, which only
/// knows about an already-resolved canonical model id.
async fn stream_response(state: SharedState, route: RouteRequest) -> Response {
    let conductor = state.conductor.clone();
    let caller_format = route.caller_format;
    let cancel = CancellationToken::new();

    if route.requested_model.is_empty() {
        return error_to_response(caller_format, GatewayError::CallerError("request is missing a model".to_string()));
    }
    let resolved = match llmgate_registry::resolve(&route.requested_model, &conductor.resolver_config, &conductor.registry, &conductor.cooldown).await {
        Ok(resolved) => resolved,
        Err(err) => return error_to_response(caller_format, err),
    };
    let model_id = resolved.canonical_base;
    if !conductor.registry.has_any_provider(&model_id).await {
        return error_to_response(caller_format, GatewayError::CallerError(format!("model_not_found: {model_id}")));
    }

    let payload = route.payload.clone();
    let model_id_for_body = route.requested_model.clone();

    let outcome = drive_stream(
        &conductor.transport,
        &conductor.registry,
        &conductor.cooldown,
        &conductor.selector,
        &conductor.auth_store,
        &conductor.rate_limiter,
        &conductor.in_flight,
        &model_id,
        caller_format,
        move |target| llmgate_translate::translate_request(caller_format, &payload, &model_id_for_body, target),
        &cancel,
    )
    .await;

    let events = match outcome {
        Ok(outcome) => outcome.events,
        Err(err) => vec![CallerStreamChunk::Error(map_error(caller_format, "api_error", &err.to_string()))],
    };

    match caller_format {
        CallerFormat::Gemini => json_lines_response(events),
        _ => sse_response(events, caller_format).into_response(),
    }
}

fn sse_response(events: Vec<CallerStreamChunk>, caller_format: CallerFormat) -> Sse<impl Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let frames: Vec<SseEvent> = events
        .into_iter()
        .flat_map(|chunk| sse_frames_for(chunk, caller_format))
        .collect();
    Sse::new(stream::iter(frames.into_iter().map(Ok)))
}

fn sse_frames_for(chunk: CallerStreamChunk, caller_format: CallerFormat) -> Vec<SseEvent> {
    match chunk {
        CallerStreamChunk::Event(CanonicalStreamEvent::Done) => {
            if caller_format == CallerFormat::OpenAI {
                vec![SseEvent::default().data("[DONE]")]
            } else {
                vec![SseEvent::default().data(json!({ "type": "message_stop" }).to_string())]
            }
        }
        CallerStreamChunk::Event(CanonicalStreamEvent::TextDelta(text)) => {
            vec![SseEvent::default().data(delta_envelope(caller_format, &text, false).to_string())]
        }
        CallerStreamChunk::Event(CanonicalStreamEvent::ThinkingDelta(text)) => {
            vec![SseEvent::default().data(delta_envelope(caller_format, &text, true).to_string())]
        }
        CallerStreamChunk::Event(CanonicalStreamEvent::ToolCallDelta { id, name, arguments_fragment }) => {
            vec![SseEvent::default().data(tool_call_envelope(caller_format, &id, name.as_deref(), &arguments_fragment).to_string())]
        }
        CallerStreamChunk::Error(body) => vec![SseEvent::default().event("error").data(body.to_string())],
    }
}

fn delta_envelope(caller_format: CallerFormat, text: &str, thinking: bool) -> Value {
    match caller_format {
        CallerFormat::OpenAI => json!({
            "choices": [{ "delta": if thinking { json!({ "reasoning": text }) } else { json!({ "content": text }) } }]
        }),
        CallerFormat::Claude if thinking => json!({
            "type": "content_block_delta",
            "delta": { "type": "thinking_delta", "thinking": text }
        }),
        CallerFormat::Claude => json!({
            "type": "content_block_delta",
            "delta": { "type": "text_delta", "text": text }
        }),
        CallerFormat::Gemini => json!({
            "candidates": [{ "content": { "parts": [{ "text": text, "thought": thinking }] } }]
        }),
    }
}

fn tool_call_envelope(caller_format: CallerFormat, id: &str, name: Option<&str>, arguments_fragment: &str) -> Value {
    match caller_format {
        CallerFormat::OpenAI => json!({
            "choices": [{ "delta": { "tool_calls": [{ "id": id, "function": { "name": name, "arguments": arguments_fragment } }] } }]
        }),
        CallerFormat::Claude => json!({
            "type": "content_block_delta",
            "delta": { "type": "input_json_delta", "partial_json": arguments_fragment }
        }),
        CallerFormat::Gemini => json!({
            "candidates": [{ "content": { "parts": [{ "functionCall": { "name": name, "args": arguments_fragment } }] } }]
        }),
    }
}

fn json_lines_response(events: Vec<CallerStreamChunk>) -> Response {
    let lines: Vec<Value> = events
        .into_iter()
        .filter_map(|chunk| match chunk {
            CallerStreamChunk::Event(CanonicalStreamEvent::Done) => None,
            CallerStreamChunk::Event(CanonicalStreamEvent::TextDelta(text)) => Some(delta_envelope(CallerFormat::Gemini, &text, false)),
            CallerStreamChunk::Event(CanonicalStreamEvent::ThinkingDelta(text)) => Some(delta_envelope(CallerFormat::Gemini, &text, true)),
            CallerStreamChunk::Event(CanonicalStreamEvent::ToolCallDelta { id, name, arguments_fragment }) => {
                Some(tool_call_envelope(CallerFormat::Gemini, &id, name.as_deref(), &arguments_fragment))
            }
            CallerStreamChunk::Error(body) => Some(body),
        })
        .collect();
    let body = lines.into_iter().map(|v| v.to_string()).collect::<Vec<_>>().join("\n");
    ([(axum::http::header::CONTENT_TYPE, "application/json-lines")], body).into_response()
}

async fn openai_models_list(State(state): State<SharedState>) -> Response {
    let data = state.conductor.registry.available(CallerFormat::OpenAI, &state.conductor.cooldown).await;
    Json(json!({ "object": "list", "data": data })).into_response()
}

async fn gemini_models_list(State(state): State<SharedState>) -> Response {
    let data = state.conductor.registry.available(CallerFormat::Gemini, &state.conductor.cooldown).await;
    Json(json!({ "models": data })).into_response()
}
