//! Management API: `/v0/management/...`. Mutates Cooldown/Suspension
//! state synchronously rather than queuing a command.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use llmgate_auth::ClientSnapshot;
use llmgate_common::CallerFormat;
use llmgate_registry::CooldownState;
use serde::Deserialize;
use serde_json::json;

use crate::state::SharedState;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/v0/management/model-availability", get(model_availability))
        .route("/v0/management/model-availability/{model_id}/reset", post(reset_model_availability))
        .route("/v0/management/clients", get(list_clients))
        .route("/v0/management/quota", get(list_quota))
        .route("/v0/management/usage", get(usage_stats))
}

async fn model_availability(State(state): State<SharedState>) -> Response {
    let data = state.conductor.registry.available(CallerFormat::OpenAI, &state.conductor.cooldown).await;
    Json(json!({ "models": data })).into_response()
}

#[derive(Deserialize)]
struct ResetBody {
    client_id: String,
}

async fn reset_model_availability(
    State(state): State<SharedState>,
    Path(model_id): Path<String>,
    Json(body): Json<ResetBody>,
) -> Response {
    state.conductor.cooldown.resume(&body.client_id, &model_id).await;
    state.conductor.cooldown.clear_quota(&body.client_id, &model_id).await;
    Json(json!({ "ok": true })).into_response()
}

async fn list_clients(State(state): State<SharedState>) -> Response {
    let mut out = Vec::new();
    for record in state.conductor.auth_store.all().await {
        let in_flight = state.conductor.in_flight.count(&record.client.client_id).await;
        out.push(ClientSnapshot::from_client(&record.client, in_flight));
    }
    Json(json!({ "clients": out })).into_response()
}

async fn list_quota(State(state): State<SharedState>) -> Response {
    let models = state.conductor.registry.available(CallerFormat::OpenAI, &state.conductor.cooldown).await;
    let model_ids: Vec<String> = models.iter().filter_map(|m| m.get("id").and_then(|v| v.as_str()).map(str::to_string)).collect();

    let mut out = Vec::new();
    for record in state.conductor.auth_store.all().await {
        for model_id in &model_ids {
            if !state.conductor.registry.candidates(model_id).await.contains(&record.client.client_id) {
                continue;
            }
            let cooldown_state = state.conductor.cooldown.state(&record.client.client_id, model_id).await;
            if cooldown_state == CooldownState::Ready {
                continue;
            }
            out.push(json!({
                "client_id": record.client.client_id,
                "model_id": model_id,
                "state": cooldown_state_label(&cooldown_state),
            }));
        }
    }
    Json(json!({ "quota": out })).into_response()
}

async fn usage_stats(State(state): State<SharedState>) -> Response {
    let mut per_client = Vec::new();
    for record in state.conductor.auth_store.all().await {
        per_client.push(json!({
            "client_id": record.client.client_id,
            "request_count": state.conductor.rate_limiter.request_count(&record.client.client_id).await,
            "in_flight": state.conductor.in_flight.count(&record.client.client_id).await,
        }));
    }
    Json(json!({ "clients": per_client })).into_response()
}

#[allow(dead_code)]
fn cooldown_state_label(state: &CooldownState) -> &'static str {
    match state {
        CooldownState::Ready => "ready",
        CooldownState::Quota { .. } => "quota",
        CooldownState::Suspended { .. } => "suspended",
    }
}
