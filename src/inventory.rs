//! Instance inventory.

use std::path::Path;

use anyhow::Context;

use crate::types::Instance;

/// Source of the instances an ARP cleanup is sent to.
pub trait InstanceSource: Send + Sync {
    /// Every non-compilation instance with an active VM whose VM cid is
    /// not `excluded_vm_cid`.
    fn instances_excluding_vm(&self, excluded_vm_cid: &str) -> Vec<Instance>;
}

/// Flat list of instances, usually read from a JSON file.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    instances: Vec<Instance>,
}

impl Inventory {
    pub fn new(instances: Vec<Instance>) -> Self {
        Self { instances }
    }

    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read inventory {}", path.display()))?;
        let instances = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse inventory {}", path.display()))?;
        Ok(Self { instances })
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }
}

impl InstanceSource for Inventory {
    fn instances_excluding_vm(&self, excluded_vm_cid: &str) -> Vec<Instance> {
        self.instances
            .iter()
            .filter(|i| !i.compilation)
            .filter(|i| matches!(i.vm_cid(), Some(cid) if cid != excluded_vm_cid))
            .cloned()
            .collect()
    }
}
