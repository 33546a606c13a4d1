//! Upstream transport seam. The Conductor only needs one capability from a provider
//! at the HTTP layer — issue the call and hand back a status+body — so
//! that is the entire trait; translate/detect-quota/detect-suspension
//! already live in `llmgate-translate` and `llmgate-ratelimit`.

use async_trait::async_trait;
use bytes::Bytes;
use llmgate_auth::{Client, OAuthToken};
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Value,
}

/// One producer (upstream reader) -> one consumer (caller writer); the
/// bounded channel is the backpressure mechanism — a slow caller writer
/// stalls the upstream reader rather than buffering unboundedly.
pub type ByteStream = mpsc::Receiver<Bytes>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("read timeout")]
    Timeout,
}

#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn call(
        &self,
        client: &Client,
        token: Option<&OAuthToken>,
        body: &Value,
        streaming: bool,
    ) -> Result<UpstreamResponse, TransportError>;

    /// Issues a streaming call. The status is known as soon as headers
    /// arrive; the body is handed back as a channel so the Conductor can
    /// start forwarding bytes to the caller without buffering the whole
    /// response.
    async fn call_streaming(
        &self,
        client: &Client,
        token: Option<&OAuthToken>,
        body: &Value,
    ) -> Result<(u16, ByteStream), TransportError>;
}

/// Real HTTP transport. Every provider's dialect-specific path/headers are
/// already baked into `client.base_url`/`client.extra_headers` by the time
/// the Conductor reaches this layer; this issues one POST and reports back
/// status and parsed body.
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl UpstreamTransport for ReqwestTransport {
    async fn call(
        &self,
        client: &Client,
        token: Option<&OAuthToken>,
        body: &Value,
        _streaming: bool,
    ) -> Result<UpstreamResponse, TransportError> {
        let url = client.base_url.clone().ok_or_else(|| TransportError::Connection("missing base_url".to_string()))?;
        let mut req = self.http.post(url).json(body);
        if let Some(token) = token {
            req = req.bearer_auth(&token.access_token);
        }
        for (name, value) in &client.extra_headers {
            req = req.header(name, value);
        }
        if let Some(proxy_url) = &client.proxy_url {
            tracing::debug!(proxy_url, "request configured to use a proxy");
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() { TransportError::Timeout } else { TransportError::Connection(e.to_string()) }
        })?;
        let status = resp.status().as_u16();
        let body = resp.json::<Value>().await.unwrap_or(Value::Null);
        Ok(UpstreamResponse { status, body })
    }

    async fn call_streaming(
        &self,
        client: &Client,
        token: Option<&OAuthToken>,
        body: &Value,
    ) -> Result<(u16, ByteStream), TransportError> {
        let url = client.base_url.clone().ok_or_else(|| TransportError::Connection("missing base_url".to_string()))?;
        let mut req = self.http.post(url).json(body);
        if let Some(token) = token {
            req = req.bearer_auth(&token.access_token);
        }
        for (name, value) in &client.extra_headers {
            req = req.header(name, value);
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() { TransportError::Timeout } else { TransportError::Connection(e.to_string()) }
        })?;
        let status = resp.status().as_u16();

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut body = resp.bytes_stream();
            use futures_util::StreamExt;
            while let Some(chunk) = body.next().await {
                let Ok(chunk) = chunk else { break };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });
        Ok((status, rx))
    }
}

/// Classification derived from an upstream status/body pair, used by the
/// Conductor's retry state machine independent of
/// which transport produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    CredentialExpired,
    QuotaExceeded,
    Suspended { reason: String },
    ServerError,
}

const SUSPENSION_KEYWORDS: &[&str] = &["suspended", "banned", "account has been disabled"];

pub fn classify(status: u16, body: &Value) -> ResponseClass {
    let message = body.get("error").and_then(|e| e.get("message")).and_then(Value::as_str).unwrap_or_default();
    let lower = message.to_ascii_lowercase();
    if let Some(keyword) = SUSPENSION_KEYWORDS.iter().find(|kw| lower.contains(**kw)) {
        return ResponseClass::Suspended { reason: keyword.to_string() };
    }
    match status {
        200..=299 => ResponseClass::Success,
        401 | 403 => ResponseClass::CredentialExpired,
        429 => ResponseClass::QuotaExceeded,
        500..=599 => ResponseClass::ServerError,
        _ => ResponseClass::ServerError,
    }
}
