//! Model Registry: which clients serve which models, and the
//! availability view shaped per caller format.

use std::collections::HashMap;

use llmgate_common::CallerFormat;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{RwLock, broadcast};

use crate::cooldown::CooldownTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThinkingSupport {
    None,
    FixedBudget,
    Auto,
    Levels,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub display_name: String,
    pub provider_family: String,
    pub context_length: u64,
    pub max_output_tokens: u64,
    pub supported_methods: Vec<String>,
    pub thinking_support: ThinkingSupport,
}

#[derive(Debug, Clone)]
struct ModelRegistration {
    info: ModelInfo,
    /// client_id -> the provider_tag it last registered under, so
    /// `unregister` can find the right counter in `providers` to decrement.
    clients: HashMap<String, String>,
    providers: HashMap<String, u32>,
}

fn decrement_provider(providers: &mut HashMap<String, u32>, tag: &str) {
    if let Some(count) = providers.get_mut(tag) {
        if *count <= 1 {
            providers.remove(tag);
        } else {
            *count -= 1;
        }
    }
}

/// A change to any registration. Carries no payload beyond the model id —
/// listeners re-read through the registry, using the change as an
/// invalidation signal rather than broadcasting state.
#[derive(Debug, Clone)]
pub struct RegistryChanged {
    pub model_id: String,
}

pub struct ModelRegistry {
    registrations: RwLock<HashMap<String, ModelRegistration>>,
    changed: broadcast::Sender<RegistryChanged>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        let (changed, _) = broadcast::channel(64);
        Self { registrations: RwLock::new(HashMap::new()), changed }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryChanged> {
        self.changed.subscribe()
    }

    pub async fn register(&self, client_id: &str, provider_tag: &str, models: &[ModelInfo]) {
        let mut changed_ids = Vec::new();
        {
            let mut guard = self.registrations.write().await;
            for info in models {
                let reg = guard.entry(info.model_id.clone()).or_insert_with(|| ModelRegistration {
                    info: info.clone(),
                    clients: HashMap::new(),
                    providers: HashMap::new(),
                });
                reg.info = info.clone();
                match reg.clients.insert(client_id.to_string(), provider_tag.to_string()) {
                    Some(previous_tag) if previous_tag == provider_tag => {}
                    Some(previous_tag) => {
                        decrement_provider(&mut reg.providers, &previous_tag);
                        *reg.providers.entry(provider_tag.to_string()).or_insert(0) += 1;
                    }
                    None => {
                        *reg.providers.entry(provider_tag.to_string()).or_insert(0) += 1;
                    }
                }
                changed_ids.push(info.model_id.clone());
            }
        }
        for model_id in changed_ids {
            let _ = self.changed.send(RegistryChanged { model_id });
        }
    }

    /// Decrements this client's contribution to every model it serves;
    /// drops a model's registration entirely once no clients remain.
    pub async fn unregister(&self, client_id: &str) {
        let mut changed_ids = Vec::new();
        {
            let mut guard = self.registrations.write().await;
            guard.retain(|model_id, reg| {
                if let Some(tag) = reg.clients.remove(client_id) {
                    decrement_provider(&mut reg.providers, &tag);
                    changed_ids.push(model_id.clone());
                }
                !reg.clients.is_empty()
            });
        }
        for model_id in changed_ids {
            let _ = self.changed.send(RegistryChanged { model_id });
        }
    }

    pub async fn get(&self, model_id: &str) -> Option<ModelInfo> {
        self.registrations.read().await.get(model_id).map(|r| r.info.clone())
    }

    pub async fn providers(&self, model_id: &str) -> Vec<String> {
        self.registrations
            .read()
            .await
            .get(model_id)
            .map(|r| r.providers.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn candidates(&self, model_id: &str) -> Vec<String> {
        self.registrations
            .read()
            .await
            .get(model_id)
            .map(|r| r.clients.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn has_any_provider(&self, model_id: &str) -> bool {
        self.registrations.read().await.get(model_id).is_some_and(|r| !r.clients.is_empty())
    }

    /// Availability view for the given caller format, using `cooldown` to
    /// classify each candidate into the quota/suspended buckets the
    /// inclusion formula needs.
    pub async fn available(&self, caller_format: CallerFormat, cooldown: &CooldownTracker) -> Vec<Value> {
        let snapshot: Vec<(String, ModelInfo, Vec<String>)> = {
            let guard = self.registrations.read().await;
            guard
                .iter()
                .map(|(id, reg)| (id.clone(), reg.info.clone(), reg.clients.keys().cloned().collect()))
                .collect()
        };

        let mut out = Vec::new();
        for (model_id, info, clients) in snapshot {
            let n_total = clients.len();
            let mut n_expired = 0usize;
            let mut n_cooldown = 0usize;
            let mut n_other_suspended = 0usize;
            for client in &clients {
                let c = cooldown.classify(client, &model_id).await;
                if c.quota_active {
                    n_expired += 1;
                }
                if c.is_quota_reason_suspended() {
                    n_cooldown += 1;
                }
                if c.is_other_suspended() {
                    n_other_suspended += 1;
                }
            }
            let effective = n_total.saturating_sub(n_expired).saturating_sub(n_other_suspended);
            let include = effective > 0
                || (n_total > 0 && (n_expired > 0 || n_cooldown > 0) && n_other_suspended == 0);
            if include {
                out.push(shape_model(caller_format, &info));
            }
        }
        out
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn shape_model(caller_format: CallerFormat, info: &ModelInfo) -> Value {
    match caller_format {
        CallerFormat::OpenAI => json!({
            "id": info.model_id,
            "object": "model",
            "owned_by": info.provider_family,
            "created": 0,
            "type": info.provider_family,
            "context_length": info.context_length,
        }),
        CallerFormat::Claude => json!({
            "id": info.model_id,
            "object": "model",
            "owned_by": info.provider_family,
            "context_length": info.context_length,
            "thinking": !matches!(info.thinking_support, ThinkingSupport::None),
            "extended_thinking": matches!(info.thinking_support, ThinkingSupport::Auto | ThinkingSupport::Levels),
        }),
        CallerFormat::Gemini => json!({
            "name": format!("models/{}", info.model_id),
            "displayName": info.display_name,
            "inputTokenLimit": info.context_length,
            "outputTokenLimit": info.max_output_tokens,
            "supportedGenerationMethods": info.supported_methods,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(id: &str) -> ModelInfo {
        ModelInfo {
            model_id: id.to_string(),
            display_name: id.to_string(),
            provider_family: "gemini".to_string(),
            context_length: 1_000_000,
            max_output_tokens: 8192,
            supported_methods: vec!["generateContent".to_string()],
            thinking_support: ThinkingSupport::FixedBudget,
        }
    }

    #[tokio::test]
    async fn registration_is_reference_counted() {
        let registry = ModelRegistry::new();
        registry.register("c1", "gemini", &[model("gemini-2.5-pro")]).await;
        registry.register("c2", "gemini", &[model("gemini-2.5-pro")]).await;
        assert_eq!(registry.candidates("gemini-2.5-pro").await.len(), 2);

        registry.unregister("c1").await;
        assert_eq!(registry.candidates("gemini-2.5-pro").await, vec!["c2".to_string()]);

        registry.unregister("c2").await;
        assert!(registry.candidates("gemini-2.5-pro").await.is_empty());
        assert!(registry.get("gemini-2.5-pro").await.is_none());
    }

    #[tokio::test]
    async fn unregister_drops_only_the_departing_clients_provider_tag() {
        let registry = ModelRegistry::new();
        registry.register("c1", "gemini", &[model("m1")]).await;
        registry.register("c2", "vertex", &[model("m1")]).await;
        assert_eq!(registry.providers("m1").await.len(), 2);

        registry.unregister("c1").await;
        assert_eq!(registry.providers("m1").await, vec!["vertex".to_string()]);
    }

    #[tokio::test]
    async fn unregister_is_observed_immediately_by_candidates() {
        let registry = ModelRegistry::new();
        registry.register("c1", "gemini", &[model("m1")]).await;
        registry.unregister("c1").await;
        assert!(!registry.candidates("m1").await.contains(&"c1".to_string()));
    }

    #[tokio::test]
    async fn availability_hides_model_with_only_other_suspended_clients() {
        let registry = ModelRegistry::new();
        let cooldown = CooldownTracker::new();
        registry.register("c1", "gemini", &[model("m1")]).await;
        cooldown.suspend("c1", "m1", "credential").await;
        let avail = registry.available(CallerFormat::OpenAI, &cooldown).await;
        assert!(avail.is_empty());
    }

    #[tokio::test]
    async fn availability_keeps_model_with_only_quota_or_quota_reason_clients() {
        let registry = ModelRegistry::new();
        let cooldown = CooldownTracker::new();
        registry.register("c1", "gemini", &[model("m1")]).await;
        cooldown.mark_quota("c1", "m1").await;
        let avail = registry.available(CallerFormat::OpenAI, &cooldown).await;
        assert_eq!(avail.len(), 1);

        let registry2 = ModelRegistry::new();
        registry2.register("c2", "gemini", &[model("m2")]).await;
        cooldown.suspend("c2", "m2", "quota").await;
        let avail2 = registry2.available(CallerFormat::OpenAI, &cooldown).await;
        assert_eq!(avail2.len(), 1);
    }
}
