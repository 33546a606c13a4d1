//! Access Manager: a chain of providers evaluated in order.
//! `NotHandled`/`NoCredentials`/`InvalidCredential` continue to the next
//! provider; `Authenticated` or a terminal error stop the chain.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use llmgate_common::{GatewayError, Principal};
use serde_json::json;

#[derive(Debug, Clone)]
pub enum AccessOutcome {
    Authenticated(Principal),
    NotHandled,
    NoCredentials,
    InvalidCredential,
    Terminal(GatewayError),
}

#[async_trait]
pub trait AccessProvider: Send + Sync {
    async fn authenticate(&self, api_key: Option<&str>) -> AccessOutcome;
}

/// In-memory API-key principal lookup: a key-then-user lookup against a
/// loaded snapshot of registered keys.
#[derive(Default)]
pub struct MemoryApiKeyProvider {
    keys: RwLock<HashMap<String, Principal>>,
}

impl MemoryApiKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, api_key: impl Into<String>, access_level: impl Into<String>) {
        let api_key = api_key.into();
        self.keys.write().unwrap().insert(
            api_key.clone(),
            Principal { api_key_id: api_key, access_level: access_level.into(), metadata: json!({}) },
        );
    }

    pub fn remove(&self, api_key: &str) {
        self.keys.write().unwrap().remove(api_key);
    }
}

#[async_trait]
impl AccessProvider for MemoryApiKeyProvider {
    async fn authenticate(&self, api_key: Option<&str>) -> AccessOutcome {
        let Some(key) = api_key else {
            return AccessOutcome::NoCredentials;
        };
        match self.keys.read().unwrap().get(key) {
            Some(principal) => AccessOutcome::Authenticated(principal.clone()),
            None => AccessOutcome::InvalidCredential,
        }
    }
}

pub struct AccessManager {
    providers: Vec<Box<dyn AccessProvider>>,
}

impl AccessManager {
    pub fn new(providers: Vec<Box<dyn AccessProvider>>) -> Self {
        Self { providers }
    }

    /// Runs the chain; on exhaustion without an `Authenticated` result,
    /// reports the most severe of `NoCredentials`/`InvalidCredential` seen
    /// (an invalid credential is more informative than an absent one).
    pub async fn authenticate(&self, api_key: Option<&str>) -> Result<Principal, GatewayError> {
        let mut most_severe_invalid = false;
        for provider in &self.providers {
            match provider.authenticate(api_key).await {
                AccessOutcome::Authenticated(principal) => return Ok(principal),
                AccessOutcome::Terminal(err) => return Err(err),
                AccessOutcome::NotHandled => continue,
                AccessOutcome::NoCredentials => continue,
                AccessOutcome::InvalidCredential => {
                    most_severe_invalid = true;
                    continue;
                }
            }
        }
        if most_severe_invalid {
            Err(GatewayError::AuthError("invalid API key".to_string()))
        } else {
            Err(GatewayError::AuthError("missing API key".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn valid_key_authenticates() {
        let provider = MemoryApiKeyProvider::new();
        provider.insert("sk-1", "admin");
        let manager = AccessManager::new(vec![Box::new(provider)]);
        let principal = manager.authenticate(Some("sk-1")).await.unwrap();
        assert_eq!(principal.api_key_id, "sk-1");
    }

    #[tokio::test]
    async fn missing_key_reports_no_credentials() {
        let manager = AccessManager::new(vec![Box::new(MemoryApiKeyProvider::new())]);
        let err = manager.authenticate(None).await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthError(_)));
    }

    #[tokio::test]
    async fn invalid_key_is_reported_as_the_more_severe_outcome() {
        let provider = MemoryApiKeyProvider::new();
        provider.insert("sk-1", "admin");
        let manager = AccessManager::new(vec![Box::new(provider)]);
        let err = manager.authenticate(Some("wrong-key")).await.unwrap_err();
        match err {
            GatewayError::AuthError(msg) => assert!(msg.contains("invalid")),
            other => panic!("expected AuthError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn a_second_provider_in_the_chain_is_tried_after_not_handled() {
        struct AlwaysNotHandled;
        #[async_trait]
        impl AccessProvider for AlwaysNotHandled {
            async fn authenticate(&self, _api_key: Option<&str>) -> AccessOutcome {
                AccessOutcome::NotHandled
            }
        }
        let fallback = MemoryApiKeyProvider::new();
        fallback.insert("sk-2", "user");
        let manager = AccessManager::new(vec![Box::new(AlwaysNotHandled), Box::new(fallback)]);
        let principal = manager.authenticate(Some("sk-2")).await.unwrap();
        assert_eq!(principal.access_level, "user");
    }
}
