//! Auth Store: one JSON file per credential under
//! `<data_dir>/credentials/<client_id>.json`, atomic write via
//! write-to-temp-then-rename rather than a generic database layer — this
//! gateway owns only the simple per-file credential format, not
//! object/Git/Postgres persistence of configs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::client::{Client, OAuthToken};

/// On-disk shape for one credential file. `extra` retains any field the
/// gateway doesn't know about.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedCredential {
    #[serde(flatten)]
    client: Client,
    oauth_token: Option<OAuthToken>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub client: Client,
    pub oauth_token: Option<OAuthToken>,
}

pub struct AuthStore {
    credentials_dir: PathBuf,
    records: RwLock<HashMap<String, Arc<RwLock<ClientRecord>>>>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl AuthStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            credentials_dir: data_dir.as_ref().join("credentials"),
            records: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(&self, client_id: &str) -> PathBuf {
        self.credentials_dir.join(format!("{client_id}.json"))
    }

    /// Loads every persisted credential from disk into the in-memory
    /// mirror, returning the loaded `Client`s. Runtime-only clients added
    /// later via [`AuthStore::register_runtime_client`] are never part of
    /// this set.
    pub async fn load_all(&self) -> Result<Vec<Client>, AuthStoreError> {
        tokio::fs::create_dir_all(&self.credentials_dir).await?;
        let mut entries = tokio::fs::read_dir(&self.credentials_dir).await?;
        let mut loaded = Vec::new();
        let mut guard = self.records.write().await;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let persisted: PersistedCredential = serde_json::from_slice(&bytes)?;
            loaded.push(persisted.client.clone());
            guard.insert(
                persisted.client.client_id.clone(),
                Arc::new(RwLock::new(ClientRecord {
                    client: persisted.client,
                    oauth_token: persisted.oauth_token,
                })),
            );
        }
        Ok(loaded)
    }

    /// Registers a client synthesized from the environment; it is kept in
    /// the in-memory mirror but `save` never writes it to disk.
    pub async fn register_runtime_client(&self, mut client: Client, oauth_token: Option<OAuthToken>) {
        client.runtime_only = true;
        let client_id = client.client_id.clone();
        self.records
            .write()
            .await
            .insert(client_id, Arc::new(RwLock::new(ClientRecord { client, oauth_token })));
    }

    pub async fn get(&self, client_id: &str) -> Option<ClientRecord> {
        let guard = self.records.read().await;
        let record = guard.get(client_id)?;
        Some(record.read().await.clone())
    }

    pub async fn all(&self) -> Vec<ClientRecord> {
        let guard = self.records.read().await;
        let mut out = Vec::with_capacity(guard.len());
        for record in guard.values() {
            out.push(record.read().await.clone());
        }
        out
    }

    /// Atomically writes `client`'s credential file, preserving any
    /// unrecognized top-level field already on disk. Runtime-only clients
    /// are mirrored into memory but never written.
    pub async fn save(&self, client: Client, oauth_token: Option<OAuthToken>) -> Result<(), AuthStoreError> {
        let client_id = client.client_id.clone();
        let runtime_only = client.runtime_only;

        {
            let mut guard = self.records.write().await;
            match guard.get(&client_id) {
                Some(existing) => {
                    let mut record = existing.write().await;
                    record.client = client.clone();
                    record.oauth_token = oauth_token.clone();
                }
                None => {
                    guard.insert(
                        client_id.clone(),
                        Arc::new(RwLock::new(ClientRecord { client: client.clone(), oauth_token: oauth_token.clone() })),
                    );
                }
            }
        }

        if runtime_only {
            return Ok(());
        }

        let path = self.path_for(&client_id);
        let extra = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<PersistedCredential>(&bytes).map(|p| p.extra).unwrap_or_default(),
            Err(_) => Map::new(),
        };
        let persisted = PersistedCredential { client, oauth_token, extra };
        write_atomic(&path, &serde_json::to_vec_pretty(&persisted)?).await?;
        Ok(())
    }

    /// `disabled` survives a process restart (spec testable property 6):
    /// this mutates the persisted file directly, not just the in-memory
    /// mirror.
    pub async fn set_enabled(&self, client_id: &str, enabled: bool) -> Result<(), AuthStoreError> {
        let Some(mut record) = self.get(client_id).await else {
            return Ok(());
        };
        record.client.enabled = enabled;
        self.save(record.client, record.oauth_token).await
    }

    pub async fn delete(&self, client_id: &str) -> Result<(), AuthStoreError> {
        self.records.write().await.remove(client_id);
        let path = self.path_for(client_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically swaps in a refreshed token, so concurrent readers always
    /// see either the pre- or post-refresh pair, never a torn one.
    pub async fn update_token(&self, client_id: &str, token: OAuthToken) -> Result<(), AuthStoreError> {
        let Some(record) = self.get(client_id).await else {
            return Ok(());
        };
        self.save(record.client, Some(token)).await
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, bytes).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientKind;

    fn sample_client(id: &str) -> Client {
        Client {
            client_id: id.to_string(),
            provider_tag: "kiro".to_string(),
            kind: ClientKind::OAuth,
            label: "user@example.com".to_string(),
            priority: 0,
            prefix: None,
            proxy_url: None,
            base_url: None,
            extra_headers: HashMap::new(),
            enabled: true,
            runtime_only: false,
        }
    }

    #[tokio::test]
    async fn disabled_flag_survives_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStore::new(dir.path());
        store.save(sample_client("c1"), None).await.unwrap();
        store.set_enabled("c1", false).await.unwrap();

        let reloaded = AuthStore::new(dir.path());
        let loaded = reloaded.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(!loaded[0].enabled);
    }

    #[tokio::test]
    async fn runtime_only_clients_are_never_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStore::new(dir.path());
        store.register_runtime_client(sample_client("env-c1"), None).await;
        assert!(store.get("env-c1").await.is_some());

        let reloaded = AuthStore::new(dir.path());
        let loaded = reloaded.load_all().await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn save_preserves_unknown_fields_written_by_external_tools() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("credentials")).await.unwrap();
        let mut raw = serde_json::to_value(sample_client("c1")).unwrap();
        raw.as_object_mut().unwrap().insert("imported_by".to_string(), Value::String("external-tool".to_string()));
        tokio::fs::write(
            dir.path().join("credentials/c1.json"),
            serde_json::to_vec(&raw).unwrap(),
        )
        .await
        .unwrap();

        let store = AuthStore::new(dir.path());
        store.load_all().await.unwrap();
        store.set_enabled("c1", false).await.unwrap();

        let bytes = tokio::fs::read(dir.path().join("credentials/c1.json")).await.unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["imported_by"], Value::String("external-tool".to_string()));
    }

    #[tokio::test]
    async fn delete_removes_both_memory_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStore::new(dir.path());
        store.save(sample_client("c1"), None).await.unwrap();
        store.delete("c1").await.unwrap();
        assert!(store.get("c1").await.is_none());
        assert!(!dir.path().join("credentials/c1.json").exists());
    }
}
