//! Per-provider OAuth flows. PKCE/device-code bookkeeping is
//! implemented once and parameterized per provider family, reusing one
//! PKCE + local-callback flow across providers instead of bespoke code
//! per provider.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use llmgate_common::GatewayError;

use crate::client::OAuthToken;

pub const OAUTH_STATE_TTL_SECS: i64 = 600;

#[derive(Debug, Clone)]
pub struct PkceCodes {
    pub code_verifier: String,
    pub code_challenge: String,
}

pub fn generate_pkce() -> PkceCodes {
    let mut verifier_bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut verifier_bytes);
    let code_verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
    let digest = Sha256::digest(code_verifier.as_bytes());
    let code_challenge = URL_SAFE_NO_PAD.encode(digest);
    PkceCodes { code_verifier, code_challenge }
}

#[derive(Debug, Clone)]
struct PendingAuthorization {
    code_verifier: String,
    redirect_uri: String,
    created_at: i64,
}

/// Tracks in-flight interactive authorization-code exchanges (Kiro Social,
/// AWS Builder ID authcode), keyed by the opaque `state` parameter.
pub struct OAuthStateStore {
    pending: RwLock<HashMap<String, PendingAuthorization>>,
}

impl OAuthStateStore {
    pub fn new() -> Self {
        Self { pending: RwLock::new(HashMap::new()) }
    }

    pub async fn begin(&self, state_id: String, code_verifier: String, redirect_uri: String, now: i64) {
        let mut guard = self.pending.write().await;
        guard.retain(|_, p| now - p.created_at < OAUTH_STATE_TTL_SECS);
        guard.insert(state_id, PendingAuthorization { code_verifier, redirect_uri, created_at: now });
    }

    pub async fn take(&self, state_id: &str) -> Option<(String, String)> {
        self.pending.write().await.remove(state_id).map(|p| (p.code_verifier, p.redirect_uri))
    }
}

impl Default for OAuthStateStore {
    fn default() -> Self {
        Self::new()
    }
}

pub fn build_authorize_url(
    authorize_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    code_challenge: &str,
    state_id: &str,
    scope: &str,
) -> String {
    format!(
        "{authorize_endpoint}?response_type=code&client_id={}&redirect_uri={}&code_challenge={}&code_challenge_method=S256&state={}&scope={}",
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(code_challenge),
        urlencoding::encode(state_id),
        urlencoding::encode(scope),
    )
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

fn token_from_response(resp: TokenResponse, now: i64, previous_refresh_token: &str) -> OAuthToken {
    OAuthToken {
        access_token: resp.access_token,
        refresh_token: resp.refresh_token.unwrap_or_else(|| previous_refresh_token.to_string()),
        expires_at: now + resp.expires_in.unwrap_or(3600),
        client_secret: None,
        start_url: None,
        region: None,
        profile_arn: None,
        last_verified: now,
    }
}

/// Derives a stable per-token `User-Agent` fingerprint in the KiroIDE
/// shape, so the same token always presents the same client identity.
fn kiro_user_agent(refresh_token: &str) -> String {
    let digest = Sha256::digest(refresh_token.as_bytes());
    format!("KiroIDE-{:x}", digest.iter().take(4).fold(0u32, |acc, b| (acc << 8) | *b as u32))
}

pub async fn refresh_kiro_social(
    http: &reqwest::Client,
    endpoint: &str,
    token: &OAuthToken,
    now: i64,
) -> Result<OAuthToken, GatewayError> {
    let response = http
        .post(endpoint)
        .header("User-Agent", kiro_user_agent(&token.refresh_token))
        .json(&serde_json::json!({ "refreshToken": token.refresh_token }))
        .send()
        .await
        .map_err(|e| GatewayError::UpstreamTransient(e.to_string()))?;
    if !response.status().is_success() {
        return Err(GatewayError::CredentialExpired { client_id: String::new() });
    }
    let parsed: TokenResponse =
        response.json().await.map_err(|e| GatewayError::UpstreamTransient(e.to_string()))?;
    Ok(token_from_response(parsed, now, &token.refresh_token))
}

#[derive(Debug, Clone)]
pub enum DeviceFlowState {
    Registering,
    Authorizing { device_code: String, interval_secs: u64, expires_at: i64 },
    Exchanged,
}

#[derive(Debug, Deserialize)]
struct DeviceAuthorizationResponse {
    device_code: String,
    verification_uri_complete: Option<String>,
    verification_uri: String,
    user_code: String,
    interval: Option<u64>,
    #[serde(rename = "expiresIn")]
    expires_in: i64,
}

#[derive(Debug)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub verification_url: String,
    pub user_code: String,
    pub interval: Duration,
    pub expires_at: i64,
}

pub async fn start_builder_id_device(
    http: &reqwest::Client,
    register_endpoint: &str,
    client_id: &str,
    scopes: &[&str],
    now: i64,
) -> Result<DeviceAuthorization, GatewayError> {
    let response = http
        .post(register_endpoint)
        .json(&serde_json::json!({ "clientId": client_id, "scopes": scopes }))
        .send()
        .await
        .map_err(|e| GatewayError::UpstreamTransient(e.to_string()))?;
    let parsed: DeviceAuthorizationResponse =
        response.json().await.map_err(|e| GatewayError::UpstreamTransient(e.to_string()))?;
    Ok(DeviceAuthorization {
        device_code: parsed.device_code,
        verification_url: parsed.verification_uri_complete.unwrap_or(parsed.verification_uri),
        user_code: parsed.user_code,
        interval: Duration::from_secs(parsed.interval.unwrap_or(5)),
        expires_at: now + parsed.expires_in,
    })
}

pub enum PollOutcome {
    Pending,
    SlowDown,
    Exchanged(OAuthToken),
}

#[derive(Debug, Deserialize)]
struct DeviceTokenErrorResponse {
    error: String,
}

pub async fn poll_builder_id_device(
    http: &reqwest::Client,
    token_endpoint: &str,
    device_code: &str,
    client_id: &str,
    now: i64,
) -> Result<PollOutcome, GatewayError> {
    let response = http
        .post(token_endpoint)
        .json(&serde_json::json!({
            "grantType": "urn:ietf:params:oauth:grant-type:device_code",
            "deviceCode": device_code,
            "clientId": client_id,
        }))
        .send()
        .await
        .map_err(|e| GatewayError::UpstreamTransient(e.to_string()))?;

    if response.status().is_success() {
        let parsed: TokenResponse =
            response.json().await.map_err(|e| GatewayError::UpstreamTransient(e.to_string()))?;
        return Ok(PollOutcome::Exchanged(token_from_response(parsed, now, "")));
    }

    let err: DeviceTokenErrorResponse =
        response.json().await.map_err(|e| GatewayError::UpstreamTransient(e.to_string()))?;
    match err.error.as_str() {
        "authorization_pending" => Ok(PollOutcome::Pending),
        "slow_down" => Ok(PollOutcome::SlowDown),
        other => Err(GatewayError::CredentialExpired { client_id: other.to_string() }),
    }
}

/// Drives `DeviceFlowState` from `Registering` through `Authorizing` to
/// `Exchanged`, sleeping between polls for the duration the authorization
/// server asked for and giving up once `expires_at` passes.
pub async fn run_builder_id_device_flow(
    http: &reqwest::Client,
    register_endpoint: &str,
    token_endpoint: &str,
    client_id: &str,
    scopes: &[&str],
    now: i64,
) -> Result<(DeviceFlowState, OAuthToken), GatewayError> {
    let mut state = DeviceFlowState::Registering;
    let authorization = start_builder_id_device(http, register_endpoint, client_id, scopes, now).await?;
    let mut interval = authorization.interval;
    state = DeviceFlowState::Authorizing {
        device_code: authorization.device_code,
        interval_secs: interval.as_secs(),
        expires_at: authorization.expires_at,
    };

    loop {
        let DeviceFlowState::Authorizing { device_code, expires_at, .. } = &state else {
            return Err(GatewayError::InternalBug("device flow left the Authorizing state".to_string()));
        };
        tokio::time::sleep(interval).await;
        let poll_now = unix_now();
        if deadline_exceeded(*expires_at, poll_now) {
            return Err(GatewayError::CredentialExpired { client_id: client_id.to_string() });
        }
        match poll_builder_id_device(http, token_endpoint, device_code, client_id, poll_now).await? {
            PollOutcome::Exchanged(token) => {
                state = DeviceFlowState::Exchanged;
                return Ok((state, token));
            }
            PollOutcome::Pending => continue,
            PollOutcome::SlowDown => {
                interval = advance_poll_interval(interval);
                if let DeviceFlowState::Authorizing { interval_secs, .. } = &mut state {
                    *interval_secs = interval.as_secs();
                }
            }
        }
    }
}

fn advance_poll_interval(interval: Duration) -> Duration {
    interval + Duration::from_secs(5)
}

fn deadline_exceeded(expires_at: i64, now: i64) -> bool {
    now >= expires_at
}

fn unix_now() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

pub async fn exchange_authcode(
    http: &reqwest::Client,
    token_endpoint: &str,
    code: &str,
    code_verifier: &str,
    redirect_uri: &str,
    now: i64,
) -> Result<OAuthToken, GatewayError> {
    let response = http
        .post(token_endpoint)
        .json(&serde_json::json!({
            "grant_type": "authorization_code",
            "code": code,
            "code_verifier": code_verifier,
            "redirect_uri": redirect_uri,
        }))
        .send()
        .await
        .map_err(|e| GatewayError::UpstreamTransient(e.to_string()))?;
    let parsed: TokenResponse =
        response.json().await.map_err(|e| GatewayError::UpstreamTransient(e.to_string()))?;
    Ok(token_from_response(parsed, now, ""))
}

/// `ListProfiles` then `ListAvailableCustomizations` fallback, resolving
/// the profile ARN the AWS Builder ID authorization-code flow needs.
pub async fn resolve_profile_arn(
    http: &reqwest::Client,
    codewhisperer_endpoint: &str,
    access_token: &str,
) -> Option<String> {
    #[derive(Deserialize)]
    struct Profile {
        #[serde(rename = "arn")]
        arn: String,
    }
    #[derive(Deserialize)]
    struct ListProfilesResponse {
        profiles: Vec<Profile>,
    }

    let list_profiles_url = format!("{codewhisperer_endpoint}/ListProfiles");
    if let Ok(resp) = http.post(&list_profiles_url).bearer_auth(access_token).send().await
        && let Ok(parsed) = resp.json::<ListProfilesResponse>().await
        && let Some(profile) = parsed.profiles.into_iter().next()
    {
        return Some(profile.arn);
    }

    #[derive(Deserialize)]
    struct Customization {
        arn: String,
    }
    #[derive(Deserialize)]
    struct ListCustomizationsResponse {
        customizations: Vec<Customization>,
    }
    let fallback_url = format!("{codewhisperer_endpoint}/ListAvailableCustomizations");
    let resp = http.post(&fallback_url).bearer_auth(access_token).send().await.ok()?;
    let parsed: ListCustomizationsResponse = resp.json().await.ok()?;
    parsed.customizations.into_iter().next().map(|c| c.arn)
}

/// AWS Identity Center refresh: same device-code bookkeeping as Builder
/// ID, but token refresh carries node-ish `User-Agent`/`x-amz-user-agent`
/// headers and a caller-supplied start URL/region.
pub async fn refresh_idc(
    http: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    client_secret: &str,
    token: &OAuthToken,
    now: i64,
) -> Result<OAuthToken, GatewayError> {
    let response = http
        .post(token_endpoint)
        .header("User-Agent", "aws-sdk-js/3.0.0 node")
        .header("x-amz-user-agent", "aws-sdk-js/3.0.0")
        .json(&serde_json::json!({
            "grantType": "refresh_token",
            "refreshToken": token.refresh_token,
            "clientId": client_id,
            "clientSecret": client_secret,
        }))
        .send()
        .await
        .map_err(|e| GatewayError::UpstreamTransient(e.to_string()))?;
    if !response.status().is_success() {
        return Err(GatewayError::CredentialExpired { client_id: String::new() });
    }
    let parsed: TokenResponse =
        response.json().await.map_err(|e| GatewayError::UpstreamTransient(e.to_string()))?;
    let mut refreshed = token_from_response(parsed, now, &token.refresh_token);
    refreshed.start_url = token.start_url.clone();
    refreshed.region = token.region.clone();
    Ok(refreshed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_challenge_is_derived_from_verifier() {
        let codes = generate_pkce();
        let digest = Sha256::digest(codes.code_verifier.as_bytes());
        assert_eq!(codes.code_challenge, URL_SAFE_NO_PAD.encode(digest));
    }

    #[tokio::test]
    async fn oauth_state_store_roundtrips_pending_authorization() {
        let store = OAuthStateStore::new();
        store.begin("state-1".to_string(), "verifier".to_string(), "http://localhost/cb".to_string(), 0).await;
        let (verifier, redirect) = store.take("state-1").await.unwrap();
        assert_eq!(verifier, "verifier");
        assert_eq!(redirect, "http://localhost/cb");
        assert!(store.take("state-1").await.is_none());
    }

    #[tokio::test]
    async fn oauth_state_store_prunes_expired_entries() {
        let store = OAuthStateStore::new();
        store.begin("old".to_string(), "v".to_string(), "r".to_string(), 0).await;
        store.begin("new".to_string(), "v2".to_string(), "r2".to_string(), OAUTH_STATE_TTL_SECS + 1).await;
        assert!(store.take("old").await.is_none());
    }

    #[test]
    fn slow_down_extends_the_poll_interval_by_five_seconds() {
        assert_eq!(advance_poll_interval(Duration::from_secs(5)), Duration::from_secs(10));
        assert_eq!(advance_poll_interval(Duration::from_secs(10)), Duration::from_secs(15));
    }

    #[test]
    fn deadline_is_exceeded_once_now_reaches_expires_at() {
        assert!(!deadline_exceeded(100, 99));
        assert!(deadline_exceeded(100, 100));
        assert!(deadline_exceeded(100, 101));
    }

    #[tokio::test]
    async fn device_flow_fails_once_the_deadline_has_already_passed() {
        let state = DeviceFlowState::Authorizing {
            device_code: "dc".to_string(),
            interval_secs: 5,
            expires_at: 10,
        };
        let DeviceFlowState::Authorizing { expires_at, .. } = state else { unreachable!() };
        assert!(deadline_exceeded(expires_at, 20));
    }
}
