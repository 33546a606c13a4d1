//! The Conductor: per-request state machine. States: Parsed
//! -> Resolved -> Selected -> Admitted -> InFlight -> ({Completed} |
//! Retrying | Failed). `handle_non_streaming` implements the numbered
//! algorithm in full; `BootstrapDriver` (below) implements the streaming
//! bootstrap-retry invariant as its own
//! small state machine rather than folding it into the same function,
//! since the two have different failure-surfacing rules.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use llmgate_auth::{AuthStore, OAuthRefresher};
use llmgate_common::{GatewayConfig, GatewayError, Op, RouteRequest};
use llmgate_payload::{PayloadRule, apply_rules};
use llmgate_ratelimit::RateLimiter;
use llmgate_registry::{CandidateInfo, CooldownTracker, InFlightTracker, ModelRegistry, ResolverConfig, Selector, resolve};
use llmgate_translate::{translate_request, translate_response};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::upstream::{ResponseClass, UpstreamTransport, classify};

#[derive(Debug)]
pub struct RequestOutcome {
    pub body: Value,
    pub chosen_client_id: String,
    pub chosen_provider: String,
    pub canonical_model: String,
}

pub struct Conductor<T: UpstreamTransport> {
    pub registry: Arc<ModelRegistry>,
    pub cooldown: Arc<CooldownTracker>,
    pub selector: Arc<Selector>,
    pub resolver_config: ResolverConfig,
    pub auth_store: Arc<AuthStore>,
    pub refresher: Arc<OAuthRefresher>,
    pub rate_limiter: Arc<RateLimiter>,
    pub in_flight: Arc<InFlightTracker>,
    pub payload_rules: Vec<PayloadRule>,
    pub transport: T,
    pub config: GatewayConfig,
}

impl<T: UpstreamTransport> Conductor<T> {
    /// Runs the non-streaming per-request algorithm end to end.
    pub async fn handle(&self, route: &RouteRequest, cancel: &CancellationToken) -> Result<RequestOutcome, GatewayError> {
        // 1. Parse.
        let needs_model = matches!(route.op, Op::GenerateContent | Op::StreamGenerateContent);
        if needs_model && route.requested_model.is_empty() {
            return Err(GatewayError::CallerError("request is missing a model".to_string()));
        }

        // 2. Resolve.
        let resolved = resolve(&route.requested_model, &self.resolver_config, &self.registry, &self.cooldown).await?;
        let model_id = resolved.canonical_base.clone();
        if !self.registry.has_any_provider(&model_id).await {
            return Err(GatewayError::CallerError(format!("model_not_found: {model_id}")));
        }

        let mut excluded: HashSet<String> = HashSet::new();
        let mut server_error_retries = 0u32;
        let mut retry_interval = Duration::from_secs(1);
        let mut forced_refreshes: HashMap<String, u32> = HashMap::new();

        loop {
            // 3. Select.
            let client_id = self
                .select_candidate(&model_id, &excluded)
                .await
                .ok_or_else(|| GatewayError::NoCapacity { model: model_id.clone(), retry_after_secs: Some(5) })?;

            let Some(record) = self.auth_store.get(&client_id).await else {
                excluded.insert(client_id);
                continue;
            };
            if !record.client.enabled {
                excluded.insert(client_id);
                continue;
            }

            // 4. Admit.
            if !self.rate_limiter.wait(&client_id, cancel).await {
                return Err(GatewayError::CallerError("request cancelled".to_string()));
            }
            let _in_flight_guard = self.in_flight.begin(&client_id).await;

            // 5. Translate + Payload Rules.
            let target_format = provider_caller_format(&record.client.provider_tag);
            let mut upstream_body = translate_request(route.caller_format, &route.payload, &model_id, target_format);
            apply_rules(&self.payload_rules, &model_id, &mut upstream_body);

            // 6. Issue upstream call.
            let response = match self.transport.call(&record.client, record.oauth_token.as_ref(), &upstream_body, false).await {
                Ok(response) => response,
                Err(_) => {
                    self.rate_limiter.mark_failed(&client_id).await;
                    server_error_retries += 1;
                    if server_error_retries > self.config.request_retry {
                        return Err(GatewayError::UpstreamTransient(format!("client {client_id} unreachable")));
                    }
                    tokio::time::sleep(retry_interval).await;
                    retry_interval = (retry_interval * 2).min(Duration::from_secs(self.config.max_retry_interval_secs));
                    continue;
                }
            };

            match classify(response.status, &response.body) {
                ResponseClass::Success => {
                    self.rate_limiter.mark_success(&client_id).await;
                    let caller_body = translate_response(target_format, &response.body, &route.requested_model, route.caller_format);
                    return Ok(RequestOutcome {
                        body: caller_body,
                        chosen_client_id: client_id,
                        chosen_provider: record.client.provider_tag,
                        canonical_model: model_id,
                    });
                }
                ResponseClass::CredentialExpired => {
                    let attempts = forced_refreshes.entry(client_id.clone()).or_insert(0);
                    if *attempts == 0 {
                        *attempts += 1;
                        let now = now_unix();
                        if self.refresher.force_refresh_one(&client_id, now).await.is_ok() {
                            // Retry the same client once with the refreshed token.
                            continue;
                        }
                    }
                    // Either the forced refresh failed, or credentials expired
                    // again on this client after an already-refreshed token —
                    // stop retrying it for this hour and fail over.
                    self.cooldown.suspend(&client_id, &model_id, "credential").await;
                    excluded.insert(client_id);
                    if excluded.len() >= self.candidate_count(&model_id).await {
                        return Err(GatewayError::CredentialExpired { client_id: "all candidates".to_string() });
                    }
                }
                ResponseClass::QuotaExceeded => {
                    self.cooldown.mark_quota(&client_id, &model_id).await;
                    excluded.insert(client_id.clone());
                    if !self.config.quota_switch_project {
                        return Err(GatewayError::QuotaExceeded { client_id });
                    }
                }
                ResponseClass::Suspended { reason } => {
                    self.cooldown.suspend(&client_id, &model_id, reason.clone()).await;
                    excluded.insert(client_id.clone());
                    if excluded.len() >= self.candidate_count(&model_id).await {
                        return Err(GatewayError::Suspended { client_id, reason });
                    }
                }
                ResponseClass::ServerError => {
                    self.rate_limiter.mark_failed(&client_id).await;
                    server_error_retries += 1;
                    if server_error_retries > self.config.request_retry {
                        return Err(GatewayError::UpstreamTransient(format!("client {client_id} returned {}", response.status)));
                    }
                    tokio::time::sleep(retry_interval).await;
                    retry_interval = (retry_interval * 2).min(Duration::from_secs(self.config.max_retry_interval_secs));
                }
            }
        }
    }

    async fn select_candidate(&self, model_id: &str, excluded: &HashSet<String>) -> Option<String> {
        let candidates = candidates_excluding(&self.registry, &self.auth_store, model_id, excluded).await;
        self.selector.select(model_id, &candidates, &self.cooldown, &self.in_flight).await
    }

    async fn candidate_count(&self, model_id: &str) -> usize {
        self.registry.candidates(model_id).await.len()
    }
}

/// Builds the candidate list the Selector needs (client id + priority),
/// skipping anything already excluded this request. Shared by the
/// non-streaming path here and the bootstrap-retry path in `bootstrap.rs`.
pub(crate) async fn candidates_excluding(
    registry: &ModelRegistry,
    auth_store: &AuthStore,
    model_id: &str,
    excluded: &HashSet<String>,
) -> Vec<CandidateInfo> {
    let candidate_ids = registry.candidates(model_id).await;
    let mut candidates = Vec::with_capacity(candidate_ids.len());
    for id in candidate_ids {
        if excluded.contains(&id) {
            continue;
        }
        let priority = auth_store.get(&id).await.map(|r| r.client.priority).unwrap_or(0);
        candidates.push(CandidateInfo { client_id: id, priority });
    }
    candidates
}

/// Which upstream dialect a provider tag speaks. A real deployment would
/// read this from provider configuration; the gateway ships with
/// OpenAI/Claude/Gemini as the fixed set.
pub(crate) fn provider_caller_format(provider_tag: &str) -> llmgate_common::CallerFormat {
    match provider_tag {
        "anthropic" | "claudecode" => llmgate_common::CallerFormat::Claude,
        "gemini" | "geminicli" | "vertex" | "antigravity" => llmgate_common::CallerFormat::Gemini,
        _ => llmgate_common::CallerFormat::OpenAI,
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use llmgate_auth::{Client, ClientKind, OAuthToken, RefresherConfig};
    use llmgate_common::CallerFormat;
    use llmgate_registry::{ModelInfo, SelectionPolicy, ThinkingSupport};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    use crate::upstream::{TransportError, UpstreamResponse};

    struct ScriptedTransport {
        responses: StdMutex<Vec<Result<UpstreamResponse, TransportError>>>,
        calls: StdMutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<UpstreamResponse, TransportError>>) -> Self {
            Self { responses: StdMutex::new(responses), calls: StdMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl UpstreamTransport for ScriptedTransport {
        async fn call(
            &self,
            client: &Client,
            _token: Option<&OAuthToken>,
            _body: &Value,
            _streaming: bool,
        ) -> Result<UpstreamResponse, TransportError> {
            self.calls.lock().unwrap().push(client.client_id.clone());
            self.responses.lock().unwrap().remove(0)
        }

        async fn call_streaming(
            &self,
            _client: &Client,
            _token: Option<&OAuthToken>,
            _body: &Value,
        ) -> Result<(u16, crate::upstream::ByteStream), TransportError> {
            unimplemented!("non-streaming tests don't exercise this path")
        }
    }

    fn sample_client(id: &str, provider_tag: &str) -> Client {
        Client {
            client_id: id.to_string(),
            provider_tag: provider_tag.to_string(),
            kind: ClientKind::ApiKey,
            label: id.to_string(),
            priority: 0,
            prefix: None,
            proxy_url: None,
            base_url: Some("https://example.invalid".to_string()),
            extra_headers: HashMap::new(),
            enabled: true,
            runtime_only: false,
        }
    }

    fn model_info(id: &str) -> ModelInfo {
        ModelInfo {
            model_id: id.to_string(),
            display_name: id.to_string(),
            provider_family: "anthropic".to_string(),
            context_length: 200_000,
            max_output_tokens: 8192,
            supported_methods: vec!["generateContent".to_string()],
            thinking_support: ThinkingSupport::None,
        }
    }

    async fn build_conductor(transport: ScriptedTransport) -> Conductor<ScriptedTransport> {
        let dir = tempdir().unwrap();
        let auth_store = Arc::new(AuthStore::new(dir.path()));
        let refresher = Arc::new(OAuthRefresher::new(auth_store.clone(), vec![], RefresherConfig::default()));
        Conductor {
            registry: Arc::new(ModelRegistry::new()),
            cooldown: Arc::new(CooldownTracker::new()),
            selector: Arc::new(Selector::new(SelectionPolicy::RoundRobin)),
            resolver_config: ResolverConfig::default(),
            auth_store,
            refresher,
            rate_limiter: Arc::new(RateLimiter::new(Default::default())),
            in_flight: Arc::new(InFlightTracker::new()),
            payload_rules: Vec::new(),
            transport,
            config: GatewayConfig::default(),
        }
    }

    fn openai_route(model: &str) -> RouteRequest {
        RouteRequest {
            caller_format: CallerFormat::OpenAI,
            requested_model: model.to_string(),
            op: Op::GenerateContent,
            streaming: false,
            payload: json!({ "model": model, "messages": [{ "role": "user", "content": "hi" }] }),
        }
    }

    #[tokio::test]
    async fn simple_route_calls_upstream_once_and_translates_the_response() {
        let transport = ScriptedTransport::new(vec![Ok(UpstreamResponse {
            status: 200,
            body: json!({
                "model": "claude-sonnet-4-5",
                "type": "message",
                "role": "assistant",
                "content": [{ "type": "text", "text": "hello back" }],
                "stop_reason": "end_turn",
                "usage": { "input_tokens": 3, "output_tokens": 2 },
            }),
        })]);
        let conductor = build_conductor(transport).await;
        conductor.registry.register("c1", "anthropic", &[model_info("claude-sonnet-4-5")]).await;
        conductor.auth_store.save(sample_client("c1", "anthropic"), None).await.unwrap();

        let route = openai_route("claude-sonnet-4-5");
        let cancel = CancellationToken::new();
        let outcome = conductor.handle(&route, &cancel).await.unwrap();
        assert_eq!(outcome.chosen_client_id, "c1");
        assert_eq!(outcome.body["choices"][0]["message"]["content"], "hello back");
        assert_eq!(conductor.transport.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_model_is_a_caller_error() {
        let conductor = build_conductor(ScriptedTransport::new(vec![])).await;
        let route = openai_route("does-not-exist");
        let cancel = CancellationToken::new();
        let err = conductor.handle(&route, &cancel).await.unwrap_err();
        assert!(matches!(err, GatewayError::CallerError(_)));
    }

    #[tokio::test]
    async fn quota_failover_retries_on_a_sibling_client() {
        let transport = ScriptedTransport::new(vec![
            Ok(UpstreamResponse { status: 429, body: json!({ "error": { "message": "quota exceeded" } }) }),
            Ok(UpstreamResponse {
                status: 200,
                body: json!({
                    "model": "m1", "type": "message", "role": "assistant",
                    "content": [{ "type": "text", "text": "ok" }],
                    "stop_reason": "end_turn", "usage": { "input_tokens": 1, "output_tokens": 1 },
                }),
            }),
        ]);
        let conductor = build_conductor(transport).await;
        conductor.registry.register("c1", "kiro", &[model_info("m1")]).await;
        conductor.registry.register("c2", "kiro", &[model_info("m1")]).await;
        conductor.auth_store.save(sample_client("c1", "anthropic"), None).await.unwrap();
        conductor.auth_store.save(sample_client("c2", "anthropic"), None).await.unwrap();

        let route = openai_route("m1");
        let cancel = CancellationToken::new();
        let outcome = conductor.handle(&route, &cancel).await.unwrap();
        assert!(matches!(conductor.cooldown.state("c1", "m1").await, llmgate_registry::CooldownState::Quota { .. }));
        assert_eq!(conductor.transport.calls.lock().unwrap().len(), 2);
        let _ = outcome;
    }

    struct AlwaysSucceedsFlow;

    #[async_trait]
    impl llmgate_auth::RefreshFlow for AlwaysSucceedsFlow {
        fn provider_tag(&self) -> &str {
            "anthropic"
        }

        async fn refresh(&self, _client: &Client, token: &OAuthToken, now: i64) -> Result<OAuthToken, GatewayError> {
            Ok(OAuthToken { last_verified: now, ..token.clone() })
        }
    }

    #[tokio::test]
    async fn credential_expired_recurring_on_the_same_client_suspends_it_instead_of_looping() {
        let transport = ScriptedTransport::new(vec![
            Ok(UpstreamResponse { status: 401, body: json!({ "error": { "message": "token expired" } }) }),
            Ok(UpstreamResponse { status: 401, body: json!({ "error": { "message": "token expired" } }) }),
        ]);
        let dir = tempdir().unwrap();
        let auth_store = Arc::new(AuthStore::new(dir.path()));
        let refresher = Arc::new(OAuthRefresher::new(auth_store.clone(), vec![Arc::new(AlwaysSucceedsFlow)], RefresherConfig::default()));
        let conductor = Conductor {
            registry: Arc::new(ModelRegistry::new()),
            cooldown: Arc::new(CooldownTracker::new()),
            selector: Arc::new(Selector::new(SelectionPolicy::RoundRobin)),
            resolver_config: ResolverConfig::default(),
            auth_store,
            refresher,
            rate_limiter: Arc::new(RateLimiter::new(Default::default())),
            in_flight: Arc::new(InFlightTracker::new()),
            payload_rules: Vec::new(),
            transport,
            config: GatewayConfig::default(),
        };
        conductor.registry.register("c1", "anthropic", &[model_info("m1")]).await;
        conductor
            .auth_store
            .save(
                sample_client("c1", "anthropic"),
                Some(OAuthToken {
                    access_token: "stale".to_string(),
                    refresh_token: "r".to_string(),
                    expires_at: 0,
                    client_secret: None,
                    start_url: None,
                    region: None,
                    profile_arn: None,
                    last_verified: 0,
                }),
            )
            .await
            .unwrap();

        let route = openai_route("m1");
        let cancel = CancellationToken::new();
        let err = conductor.handle(&route, &cancel).await.unwrap_err();
        assert!(matches!(err, GatewayError::CredentialExpired { .. }));
        assert_eq!(conductor.transport.calls.lock().unwrap().len(), 2);
        assert!(matches!(conductor.cooldown.state("c1", "m1").await, llmgate_registry::CooldownState::Suspended { .. }));
    }

    #[tokio::test]
    async fn no_ready_candidates_surfaces_no_capacity() {
        let conductor = build_conductor(ScriptedTransport::new(vec![])).await;
        conductor.registry.register("c1", "anthropic", &[model_info("m1")]).await;
        conductor.cooldown.suspend("c1", "m1", "banned").await;
        conductor.auth_store.save(sample_client("c1", "anthropic"), None).await.unwrap();

        let route = openai_route("m1");
        let cancel = CancellationToken::new();
        let err = conductor.handle(&route, &cancel).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoCapacity { .. }));
    }
}
