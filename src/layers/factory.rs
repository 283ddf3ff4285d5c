//! Layer Factory
//!
//! Builds one implementation per layer kind at startup and hands them out
//! by kind. The set is fixed for the lifetime of the process.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::kinds::DeviceLayerKind;
use crate::layers::bcache::BCacheLayer;
use crate::layers::cache::CacheLayer;
use crate::layers::drbd::DrbdLayer;
use crate::layers::luks::LuksLayer;
use crate::layers::nvme::NvmeLayer;
use crate::layers::storage::StorageLayer;
use crate::layers::writecache::WritecacheLayer;
use crate::layers::{DeviceLayerRef, LayerServices};

/// Registry of the layer implementations of this node
pub struct LayerRegistry {
    services: LayerServices,
    layers: BTreeMap<DeviceLayerKind, DeviceLayerRef>,
    storage: Arc<StorageLayer>,
}

impl LayerRegistry {
    /// Build every layer implementation from the shared services
    pub fn new(services: LayerServices) -> Self {
        let storage = Arc::new(StorageLayer::new(&services));
        let mut layers: BTreeMap<DeviceLayerKind, DeviceLayerRef> = BTreeMap::new();
        layers.insert(DeviceLayerKind::Drbd, Arc::new(DrbdLayer::new(&services)));
        layers.insert(DeviceLayerKind::Luks, Arc::new(LuksLayer::new(&services)));
        layers.insert(DeviceLayerKind::Nvme, Arc::new(NvmeLayer::new(&services)));
        layers.insert(
            DeviceLayerKind::Writecache,
            Arc::new(WritecacheLayer::new(&services)),
        );
        layers.insert(DeviceLayerKind::Cache, Arc::new(CacheLayer::new(&services)));
        layers.insert(DeviceLayerKind::BCache, Arc::new(BCacheLayer::new(&services)));
        layers.insert(DeviceLayerKind::Storage, storage.clone());

        info!(
            layers = layers.len(),
            node = %services.config.node_name,
            dry_run = services.dry_run,
            "Layer registry initialized"
        );
        Self {
            services,
            layers,
            storage,
        }
    }

    /// Implementation of a kind.
    ///
    /// # Panics
    ///
    /// Every kind is registered in `new`; a missing kind is a build defect.
    pub fn layer(&self, kind: DeviceLayerKind) -> &DeviceLayerRef {
        match self.layers.get(&kind) {
            Some(layer) => layer,
            None => panic!("no layer implementation registered for {}", kind),
        }
    }

    pub fn try_layer(&self, kind: DeviceLayerKind) -> Option<&DeviceLayerRef> {
        self.layers.get(&kind)
    }

    /// All implementations, outermost kind first
    pub fn all(&self) -> impl Iterator<Item = &DeviceLayerRef> {
        self.layers.values()
    }

    /// The storage layer, for capacity refreshes
    pub fn storage(&self) -> &Arc<StorageLayer> {
        &self.storage
    }

    pub fn services(&self) -> &LayerServices {
        &self.services
    }

    /// Drop every layer's transient cache
    pub fn clear_caches(&self) {
        for layer in self.layers.values() {
            layer.clear_cache();
        }
    }
}

impl std::fmt::Debug for LayerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerRegistry")
            .field("kinds", &self.layers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SatelliteConfig;
    use crate::exec::scripted::ScriptedRunner;
    use crate::layers::testing::services;

    fn registry() -> LayerRegistry {
        LayerRegistry::new(services(
            Arc::new(ScriptedRunner::new()),
            SatelliteConfig::default(),
        ))
    }

    #[test]
    fn test_every_kind_is_registered() {
        let registry = registry();
        for kind in DeviceLayerKind::ALL {
            assert_eq!(registry.layer(kind).kind(), kind);
        }
    }

    #[test]
    fn test_all_is_in_stack_order() {
        let kinds: Vec<_> = registry().all().map(|l| l.kind()).collect();
        assert_eq!(kinds, DeviceLayerKind::ALL.to_vec());
    }

    #[test]
    fn test_suspend_support_follows_capabilities() {
        let registry = registry();
        assert!(registry.layer(DeviceLayerKind::Drbd).supports_suspend_io());
        assert!(registry.layer(DeviceLayerKind::Cache).supports_suspend_io());
        assert!(!registry.layer(DeviceLayerKind::Storage).supports_suspend_io());
    }
}
