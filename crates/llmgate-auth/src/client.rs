//! Client and OAuthToken data model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    OAuth,
    ApiKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub client_id: String,
    pub provider_tag: String,
    pub kind: ClientKind,
    pub label: String,
    pub priority: i32,
    pub prefix: Option<String>,
    pub proxy_url: Option<String>,
    pub base_url: Option<String>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Synthesized from environment at startup; never written to disk
    ///.
    #[serde(default, skip_serializing)]
    pub runtime_only: bool,
}

fn default_enabled() -> bool {
    true
}

/// Unix-second timestamps throughout, to keep the on-disk format a plain
/// JSON number rather than requiring a timestamp-format convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    pub client_secret: Option<String>,
    pub start_url: Option<String>,
    pub region: Option<String>,
    pub profile_arn: Option<String>,
    pub last_verified: i64,
}

pub const DEFAULT_REFRESH_LEAD_SECS: i64 = 10 * 60;

impl OAuthToken {
    pub fn needs_refresh(&self, now: i64, refresh_lead_secs: i64) -> bool {
        now >= self.expires_at - refresh_lead_secs
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

/// Non-owning snapshot used for admin listings: never
/// exposes `access_token`/`refresh_token`/`client_secret`.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub client_id: String,
    pub provider_tag: String,
    pub label: String,
    pub priority: i32,
    pub enabled: bool,
    pub in_flight: usize,
}

impl ClientSnapshot {
    pub fn from_client(client: &Client, in_flight: usize) -> Self {
        Self {
            client_id: client.client_id.clone(),
            provider_tag: client.provider_tag.clone(),
            label: client.label.clone(),
            priority: client.priority,
            enabled: client.enabled,
            in_flight,
        }
    }
}
