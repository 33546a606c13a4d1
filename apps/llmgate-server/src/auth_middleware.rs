//! Inbound authentication middleware: pull a caller key out of whichever
//! header the calling format used, run it through the Access Manager
//! chain, and reject before the handler ever sees the request.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use llmgate_common::GatewayError;
use serde_json::json;

use crate::state::SharedState;

fn extract_api_key(headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(key) = value.strip_prefix("Bearer ") {
            return Some(key.to_string());
        }
    }
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(value.to_string());
    }
    if let Some(value) = headers.get("x-goog-api-key").and_then(|v| v.to_str().ok()) {
        return Some(value.to_string());
    }
    None
}

pub async fn require_principal(
    State(state): State<SharedState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let api_key = extract_api_key(req.headers());
    match state.access.authenticate(api_key.as_deref()).await {
        Ok(principal) => {
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(err) => auth_error_response(err),
    }
}

fn auth_error_response(err: GatewayError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::UNAUTHORIZED);
    (status, axum::Json(json!({ "error": { "message": err.to_string() } }))).into_response()
}
