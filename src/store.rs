//! Durable record of the DNS records version each agent has applied.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::types::AgentId;

#[async_trait]
pub trait DnsVersionStore: Send + Sync {
    /// Creates the record for `agent_id` if missing, then sets its version.
    async fn upsert(&self, agent_id: &AgentId, version: u64) -> Result<(), StoreError>;

    async fn get(&self, agent_id: &AgentId) -> Result<Option<u64>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryDnsVersionStore {
    versions: RwLock<HashMap<AgentId, u64>>,
}

impl MemoryDnsVersionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DnsVersionStore for MemoryDnsVersionStore {
    async fn upsert(&self, agent_id: &AgentId, version: u64) -> Result<(), StoreError> {
        self.versions.write().await.insert(agent_id.clone(), version);
        Ok(())
    }

    async fn get(&self, agent_id: &AgentId) -> Result<Option<u64>, StoreError> {
        Ok(self.versions.read().await.get(agent_id).copied())
    }
}

/// Keeps versions in a JSON object on disk, `{"agent-id": version}`.
///
/// The whole file is rewritten on every upsert through a temporary file
/// and a rename, so readers never observe a half written file.
#[derive(Debug)]
pub struct FileDnsVersionStore {
    path: PathBuf,
    versions: RwLock<HashMap<AgentId, u64>>,
}

impl FileDnsVersionStore {
    /// Opens the store, starting empty if the file does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let versions = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Codec {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self {
            path,
            versions: RwLock::new(versions),
        })
    }

    async fn persist(&self, versions: &HashMap<AgentId, u64>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(versions).map_err(|source| StoreError::Codec {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        let io = |source: std::io::Error| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        tokio::fs::write(&tmp, bytes).await.map_err(io)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io)?;
        Ok(())
    }
}

#[async_trait]
impl DnsVersionStore for FileDnsVersionStore {
    async fn upsert(&self, agent_id: &AgentId, version: u64) -> Result<(), StoreError> {
        let mut versions = self.versions.write().await;
        versions.insert(agent_id.clone(), version);
        self.persist(&versions).await?;
        debug!("Recorded DNS version {} for agent {}", version, agent_id);
        Ok(())
    }

    async fn get(&self, agent_id: &AgentId) -> Result<Option<u64>, StoreError> {
        Ok(self.versions.read().await.get(agent_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_upsert() {
        let store = MemoryDnsVersionStore::new();
        let id = AgentId::from("agent-1");
        assert_eq!(store.get(&id).await.unwrap(), None);
        store.upsert(&id, 3).await.unwrap();
        store.upsert(&id, 4).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dns_versions.json");
        let id = AgentId::from("agent-1");

        let store = FileDnsVersionStore::open(&path).await.unwrap();
        store.upsert(&id, 9).await.unwrap();
        drop(store);

        let reopened = FileDnsVersionStore::open(&path).await.unwrap();
        assert_eq!(reopened.get(&id).await.unwrap(), Some(9));
        assert!(!dir.path().join("dns_versions.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dns_versions.json");
        std::fs::write(&path, b"not json").unwrap();
        let err = FileDnsVersionStore::open(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Codec { .. }));
    }
}
