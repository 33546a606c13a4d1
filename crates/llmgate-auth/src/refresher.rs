//! OAuth Refresher: one background loop per provider family,
//! scanning oldest-`last_verified`-first with bounded concurrency and a
//! stagger between dispatches, a deadline-driven background task that
//! keeps credentials ahead of expiry rather than refreshing on demand.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tracing::{info, warn};

use llmgate_common::GatewayError;

use crate::client::{Client, OAuthToken};
use crate::oauth;
use crate::store::AuthStore;

#[derive(Debug, Clone)]
pub struct RefresherConfig {
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub stagger: Duration,
    pub refresh_lead_secs: i64,
    pub retry_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_concurrency: 10,
            stagger: Duration::from_millis(100),
            refresh_lead_secs: 10 * 60,
            retry_delay: Duration::from_secs(1),
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// One provider-family refresh implementation. Kiro Social, AWS Builder
/// ID (device + authcode), and AWS Identity Center are four instances of
/// this trait rather than four bespoke code paths.
#[async_trait::async_trait]
pub trait RefreshFlow: Send + Sync {
    fn provider_tag(&self) -> &str;
    async fn refresh(&self, client: &Client, token: &OAuthToken, now: i64) -> Result<OAuthToken, GatewayError>;
}

pub struct KiroSocialFlow {
    pub http: reqwest::Client,
    pub endpoint: String,
}

#[async_trait::async_trait]
impl RefreshFlow for KiroSocialFlow {
    fn provider_tag(&self) -> &str {
        "kiro"
    }

    async fn refresh(&self, _client: &Client, token: &OAuthToken, now: i64) -> Result<OAuthToken, GatewayError> {
        oauth::refresh_kiro_social(&self.http, &self.endpoint, token, now).await
    }
}

pub struct IdcFlow {
    pub http: reqwest::Client,
    pub token_endpoint: String,
    pub client_id: String,
    pub client_secret: String,
}

#[async_trait::async_trait]
impl RefreshFlow for IdcFlow {
    fn provider_tag(&self) -> &str {
        "aws-idc"
    }

    async fn refresh(&self, _client: &Client, token: &OAuthToken, now: i64) -> Result<OAuthToken, GatewayError> {
        oauth::refresh_idc(&self.http, &self.token_endpoint, &self.client_id, &self.client_secret, token, now).await
    }
}

pub struct OAuthRefresher {
    store: Arc<AuthStore>,
    flows: Vec<Arc<dyn RefreshFlow>>,
    config: RefresherConfig,
    refreshed: Arc<Notify>,
}

impl OAuthRefresher {
    pub fn new(store: Arc<AuthStore>, flows: Vec<Arc<dyn RefreshFlow>>, config: RefresherConfig) -> Self {
        Self { store, flows, config, refreshed: Arc::new(Notify::new()) }
    }

    /// Readers can await this to observe "a refresh just completed",
    /// rather than polling — the notification itself carries no payload;
    /// the refreshed token lives in the Auth Store.
    pub fn refreshed_signal(&self) -> Arc<Notify> {
        self.refreshed.clone()
    }

    fn flow_for(&self, provider_tag: &str) -> Option<Arc<dyn RefreshFlow>> {
        self.flows.iter().find(|f| f.provider_tag() == provider_tag).cloned()
    }

    pub fn spawn_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                self.run_once(now_unix()).await;
                tokio::time::sleep(self.config.poll_interval).await;
            }
        });
    }

    /// Forces a single immediate refresh for one client, used by the
    /// Conductor's 401/403 handling. Bypasses the `needs_refresh` staleness
    /// check since the caller already observed the token failing.
    pub async fn force_refresh_one(&self, client_id: &str, now: i64) -> Result<(), GatewayError> {
        let Some(record) = self.store.get(client_id).await else {
            return Err(GatewayError::CredentialExpired { client_id: client_id.to_string() });
        };
        let Some(token) = record.oauth_token else {
            return Err(GatewayError::CredentialExpired { client_id: client_id.to_string() });
        };
        let Some(flow) = self.flow_for(&record.client.provider_tag) else {
            return Err(GatewayError::CredentialExpired { client_id: client_id.to_string() });
        };
        let refreshed = flow.refresh(&record.client, &token, now).await.map_err(|_| {
            GatewayError::CredentialExpired { client_id: client_id.to_string() }
        })?;
        self.store
            .update_token(client_id, refreshed)
            .await
            .map_err(|e| GatewayError::InternalBug(e.to_string()))?;
        self.refreshed.notify_waiters();
        Ok(())
    }

    pub async fn run_once(&self, now: i64) {
        let mut records = self.store.all().await;
        records.sort_by_key(|r| r.oauth_token.as_ref().map(|t| t.last_verified).unwrap_or(0));

        for batch in records.chunks(self.config.batch_size) {
            let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
            let mut handles = Vec::new();
            for record in batch {
                let Some(token) = record.oauth_token.clone() else { continue };
                if !token.needs_refresh(now, self.config.refresh_lead_secs) {
                    continue;
                }
                let client = record.client.clone();
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                tokio::time::sleep(self.config.stagger).await;

                let store = self.store.clone();
                let refreshed_signal = self.refreshed.clone();
                let Some(flow) = self.flow_for(&client.provider_tag) else { continue };
                let retry_delay = self.config.retry_delay;

                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    refresh_one(&store, &flow, client, token, now, retry_delay, &refreshed_signal).await;
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }
}

/// Refreshes one client, applying the graceful-degradation contract: a
/// failed refresh is tolerated while the existing token is still valid.
async fn refresh_one(
    store: &AuthStore,
    flow: &Arc<dyn RefreshFlow>,
    client: Client,
    token: OAuthToken,
    now: i64,
    retry_delay: Duration,
    refreshed_signal: &Notify,
) {
    let mut last_err = None;
    for attempt in 0..2 {
        if attempt > 0 {
            tokio::time::sleep(retry_delay).await;
        }
        match flow.refresh(&client, &token, now).await {
            Ok(refreshed) => {
                if store.update_token(&client.client_id, refreshed).await.is_ok() {
                    refreshed_signal.notify_waiters();
                }
                return;
            }
            Err(e) => last_err = Some(e),
        }
    }

    if token.is_expired(now) {
        warn!(client_id = %client.client_id, error = ?last_err, "oauth refresh failed and existing token is expired");
        return;
    }

    info!(client_id = %client.client_id, "oauth refresh failed but existing token is still valid, degrading gracefully");
    let mut bumped = token;
    bumped.last_verified = now;
    let _ = store.update_token(&client.client_id, bumped).await;
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
