//! Domain Ports - Boundaries between the stack engine and the domain model
//!
//! The engine never holds a database handle. It computes sizes and device
//! state, then hands them to these ports; adapters own persistence and key
//! material.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::tree::node::{LayerNode, ResourceRef};
use crate::tree::transaction::TreeChangeSet;
use crate::tree::volume::VolumeLayerData;

// =============================================================================
// Layer Data Store
// =============================================================================

/// Setter contract of the domain model for layer data
#[async_trait]
pub trait LayerDataStore: Send + Sync {
    /// Record sizes, device path and size state of one volume
    async fn persist_volume(&self, node: &LayerNode, volume: &VolumeLayerData) -> Result<()>;

    /// Provider-specific cleanup for a volume whose node is being removed.
    ///
    /// Called before the removal itself is persisted.
    async fn delete_volume_hook(&self, node: &LayerNode, volume: &VolumeLayerData) -> Result<()>;

    /// Record structural changes of a tree
    async fn persist_tree_changes(
        &self,
        resource: &ResourceRef,
        changes: &TreeChangeSet,
    ) -> Result<()>;
}

// =============================================================================
// Key Provider
// =============================================================================

/// Resolves encryption key references to key material
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn resolve_key(&self, key_ref: &str) -> Result<Vec<u8>>;
}

/// Key provider backed by a fixed map
#[derive(Debug, Default, Clone)]
pub struct StaticKeyProvider {
    keys: BTreeMap<String, Vec<u8>>,
}

impl StaticKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key_ref: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        self.keys.insert(key_ref.into(), key.into());
        self
    }
}

#[async_trait]
impl KeyProvider for StaticKeyProvider {
    async fn resolve_key(&self, key_ref: &str) -> Result<Vec<u8>> {
        self.keys
            .get(key_ref)
            .cloned()
            .ok_or_else(|| Error::AccessDenied {
                object: format!("key {}", key_ref),
                reason: "unknown key reference".to_string(),
            })
    }
}

// =============================================================================
// Type Aliases for Arc-wrapped traits
// =============================================================================

pub type LayerDataStoreRef = Arc<dyn LayerDataStore>;
pub type KeyProviderRef = Arc<dyn KeyProvider>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_key_provider() {
        let keys = StaticKeyProvider::new().with_key("master", b"secret".to_vec());
        assert_eq!(keys.resolve_key("master").await.unwrap(), b"secret".to_vec());
        assert!(matches!(
            keys.resolve_key("other").await,
            Err(Error::AccessDenied { .. })
        ));
    }
}
