//! Streaming bootstrap retry: until the first byte is flushed to the caller, any upstream
//! failure restarts selection with a different client; once a byte is
//! sent, the stream belongs to that client and later failures become a
//! stream-terminating error event instead of a silent retry.

use std::collections::HashSet;
use std::sync::Arc;

use llmgate_auth::AuthStore;
use llmgate_common::CallerFormat;
use llmgate_registry::{CooldownTracker, InFlightTracker, ModelRegistry, Selector};
use llmgate_translate::{CanonicalStreamEvent, StreamIngester, map_error};
use llmgate_ratelimit::RateLimiter;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::upstream::{ResponseClass, UpstreamTransport, classify};

const MAX_BOOTSTRAP_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub enum CallerStreamChunk {
    Event(CanonicalStreamEvent),
    Error(Value),
}

#[derive(Debug)]
pub struct BootstrapOutcome {
    pub chosen_client_id: String,
    pub events: Vec<CallerStreamChunk>,
}

/// Drives one streaming request through the bootstrap state machine,
/// collecting translated events rather than writing to a live transport
/// — the HTTP layer owns flushing bytes to the actual caller connection.
pub async fn drive_stream<T: UpstreamTransport>(
    transport: &T,
    registry: &ModelRegistry,
    cooldown: &CooldownTracker,
    selector: &Selector,
    auth_store: &AuthStore,
    rate_limiter: &RateLimiter,
    in_flight: &Arc<InFlightTracker>,
    model_id: &str,
    caller_format: CallerFormat,
    upstream_body_for: impl Fn(CallerFormat) -> Value,
    cancel: &CancellationToken,
) -> Result<BootstrapOutcome, llmgate_common::GatewayError> {
    let mut excluded: HashSet<String> = HashSet::new();
    let mut bootstrap_retries = 0u32;
    let mut sent_payload = false;

    loop {
        let candidates = crate::conductor::candidates_excluding(registry, auth_store, model_id, &excluded).await;
        let Some(client_id) = selector.select(model_id, &candidates, cooldown, in_flight.as_ref()).await else {
            return Err(llmgate_common::GatewayError::NoCapacity { model: model_id.to_string(), retry_after_secs: Some(5) });
        };
        let Some(record) = auth_store.get(&client_id).await else {
            excluded.insert(client_id);
            continue;
        };

        if !rate_limiter.wait(&client_id, cancel).await {
            return Err(llmgate_common::GatewayError::CallerError("request cancelled".to_string()));
        }
        let _guard = in_flight.begin(&client_id).await;

        let target_format = crate::conductor::provider_caller_format(&record.client.provider_tag);
        let body = upstream_body_for(target_format);

        let (status, mut bytes) = match transport.call_streaming(&record.client, record.oauth_token.as_ref(), &body).await {
            Ok(pair) => pair,
            Err(_) if !sent_payload && bootstrap_retries < MAX_BOOTSTRAP_RETRIES => {
                bootstrap_retries += 1;
                excluded.insert(client_id);
                continue;
            }
            Err(_) => return Err(llmgate_common::GatewayError::UpstreamTransient("stream connection failed".to_string())),
        };

        if !matches!(classify(status, &Value::Null), ResponseClass::Success) && !sent_payload {
            bootstrap_retries += 1;
            excluded.insert(client_id);
            if bootstrap_retries >= MAX_BOOTSTRAP_RETRIES {
                return Err(llmgate_common::GatewayError::UpstreamTransient(format!("upstream returned {status} before streaming")));
            }
            continue;
        }

        let mut ingester = StreamIngester::new(target_format);
        let mut events = Vec::new();
        while let Some(chunk) = bytes.recv().await {
            let parsed = ingester.ingest(&chunk);
            if parsed.is_empty() {
                continue;
            }
            sent_payload = true;
            for event in parsed {
                let terminal = matches!(event, CanonicalStreamEvent::Done);
                events.push(CallerStreamChunk::Event(event));
                if terminal {
                    return Ok(BootstrapOutcome { chosen_client_id: client_id, events });
                }
            }
        }

        if sent_payload {
            // The channel closed without a Done event ever arriving: the
            // stream already belongs to this client, so the failure is
            // surfaced to the caller as a terminal error chunk rather than
            // retried against a different one.
            events.push(error_chunk(caller_format, "upstream_error", "upstream closed the stream unexpectedly"));
            return Ok(BootstrapOutcome { chosen_client_id: client_id, events });
        }

        // Channel closed with zero bytes ever ingested: treat as a
        // pre-bootstrap failure and retry with another client.
        bootstrap_retries += 1;
        excluded.insert(client_id);
        if bootstrap_retries >= MAX_BOOTSTRAP_RETRIES {
            return Err(llmgate_common::GatewayError::UpstreamTransient("upstream closed before sending any chunk".to_string()));
        }
    }
}

fn error_chunk(caller_format: CallerFormat, kind: &str, message: &str) -> CallerStreamChunk {
    CallerStreamChunk::Error(map_error(caller_format, kind, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use llmgate_auth::{AuthStore, Client, ClientKind, OAuthToken};
    use llmgate_registry::{CooldownTracker, InFlightTracker, ModelInfo, ModelRegistry, Selector, SelectionPolicy, ThinkingSupport};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    use crate::upstream::{ByteStream, TransportError};

    struct ScriptedStreamTransport {
        scripted: StdMutex<Vec<Result<(u16, Vec<&'static [u8]>), TransportError>>>,
    }

    impl ScriptedStreamTransport {
        fn new(scripted: Vec<Result<(u16, Vec<&'static [u8]>), TransportError>>) -> Self {
            Self { scripted: StdMutex::new(scripted) }
        }
    }

    #[async_trait]
    impl UpstreamTransport for ScriptedStreamTransport {
        async fn call(
            &self,
            _client: &Client,
            _token: Option<&OAuthToken>,
            _body: &Value,
            _streaming: bool,
        ) -> Result<crate::upstream::UpstreamResponse, TransportError> {
            unimplemented!("bootstrap tests only exercise the streaming path")
        }

        async fn call_streaming(
            &self,
            _client: &Client,
            _token: Option<&OAuthToken>,
            _body: &Value,
        ) -> Result<(u16, ByteStream), TransportError> {
            let (status, chunks) = self.scripted.lock().unwrap().remove(0)?;
            let (tx, rx) = tokio::sync::mpsc::channel(16);
            for chunk in chunks {
                tx.send(bytes::Bytes::from_static(chunk)).await.unwrap();
            }
            Ok((status, rx))
        }
    }

    fn sample_client(id: &str) -> Client {
        Client {
            client_id: id.to_string(),
            provider_tag: "anthropic".to_string(),
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
            supported_methods: vec!["streamGenerateContent".to_string()],
            thinking_support: ThinkingSupport::None,
        }
    }

    struct Fixture {
        registry: ModelRegistry,
        cooldown: CooldownTracker,
        selector: Selector,
        auth_store: AuthStore,
        rate_limiter: RateLimiter,
        in_flight: Arc<InFlightTracker>,
        _dir: tempfile::TempDir,
    }

    async fn build_fixture() -> Fixture {
        let dir = tempdir().unwrap();
        Fixture {
            registry: ModelRegistry::new(),
            cooldown: CooldownTracker::new(),
            selector: Selector::new(SelectionPolicy::RoundRobin),
            auth_store: AuthStore::new(dir.path()),
            rate_limiter: RateLimiter::new(Default::default()),
            in_flight: Arc::new(InFlightTracker::new()),
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn a_clean_single_client_stream_surfaces_every_event_in_order() {
        let fixture = build_fixture().await;
        fixture.registry.register("c1", "anthropic", &[model_info("m1")]).await;
        fixture.auth_store.save(sample_client("c1"), None).await.unwrap();
        let transport = ScriptedStreamTransport::new(vec![Ok((
            200,
            vec![
                b"data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n",
                b"data: {\"type\":\"message_stop\"}\n",
            ],
        ))]);
        let cancel = CancellationToken::new();

        let outcome = drive_stream(
            &transport,
            &fixture.registry,
            &fixture.cooldown,
            &fixture.selector,
            &fixture.auth_store,
            &fixture.rate_limiter,
            &fixture.in_flight,
            "m1",
            CallerFormat::OpenAI,
            |_target| serde_json::json!({}),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(outcome.chosen_client_id, "c1");
        assert_eq!(outcome.events.len(), 2);
        assert!(matches!(outcome.events[0], CallerStreamChunk::Event(CanonicalStreamEvent::TextDelta(ref t)) if t == "hi"));
        assert!(matches!(outcome.events[1], CallerStreamChunk::Event(CanonicalStreamEvent::Done)));
    }

    #[tokio::test]
    async fn a_pre_bootstrap_connection_failure_silently_retries_a_sibling_client() {
        let fixture = build_fixture().await;
        fixture.registry.register("c1", "anthropic", &[model_info("m1")]).await;
        fixture.registry.register("c2", "anthropic", &[model_info("m1")]).await;
        fixture.auth_store.save(sample_client("c1"), None).await.unwrap();
        fixture.auth_store.save(sample_client("c2"), None).await.unwrap();
        let transport = ScriptedStreamTransport::new(vec![
            Err(TransportError::Connection("refused".to_string())),
            Ok((200, vec![b"data: {\"type\":\"message_stop\"}\n"])),
        ]);
        let cancel = CancellationToken::new();

        let outcome = drive_stream(
            &transport,
            &fixture.registry,
            &fixture.cooldown,
            &fixture.selector,
            &fixture.auth_store,
            &fixture.rate_limiter,
            &fixture.in_flight,
            "m1",
            CallerFormat::OpenAI,
            |_target| serde_json::json!({}),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(outcome.events.len(), 1);
        assert!(matches!(outcome.events[0], CallerStreamChunk::Event(CanonicalStreamEvent::Done)));
    }

    #[tokio::test]
    async fn exhausting_bootstrap_retries_surfaces_an_error_instead_of_retrying_forever() {
        let fixture = build_fixture().await;
        for id in ["c1", "c2", "c3", "c4"] {
            fixture.registry.register(id, "anthropic", &[model_info("m1")]).await;
            fixture.auth_store.save(sample_client(id), None).await.unwrap();
        }
        let transport = ScriptedStreamTransport::new(vec![
            Err(TransportError::Connection("refused".to_string())),
            Err(TransportError::Connection("refused".to_string())),
            Err(TransportError::Connection("refused".to_string())),
            Err(TransportError::Connection("refused".to_string())),
        ]);
        let cancel = CancellationToken::new();

        let err = drive_stream(
            &transport,
            &fixture.registry,
            &fixture.cooldown,
            &fixture.selector,
            &fixture.auth_store,
            &fixture.rate_limiter,
            &fixture.in_flight,
            "m1",
            CallerFormat::OpenAI,
            |_target| serde_json::json!({}),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, llmgate_common::GatewayError::UpstreamTransient(_)));
    }
}
