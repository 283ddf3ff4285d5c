//! Storage Layer
//!
//! Leaf of every stack. Delegates each volume to the provider of the pool it
//! draws from, keeps the pool's free-capacity counter current and records
//! the size the provider actually reports.

pub mod lvm;
pub mod zfs;

pub use lvm::LvmProvider;
pub use zfs::ZfsProvider;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::StoragePoolRegistry;
use crate::error::{Error, Result};
use crate::kinds::{DeviceLayerKind, DeviceProviderKind};
use crate::layers::{volume_identifier, DeviceLayer, LayerProcessResult, LayerServices};
use crate::tree::layer_tree::LayerTree;
use crate::tree::node::{LayerNode, LayerNodeId};
use crate::tree::volume::{BackingRef, SizeState, VolumeNumber};

// =============================================================================
// Provider Port
// =============================================================================

/// One volume (or snapshot of a volume) as a provider sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderVolume {
    /// Volume name without the backing prefix, e.g. `r0_00000`
    pub name: String,
    pub backing: BackingRef,
    pub snapshot: Option<String>,
}

/// What a provider reported about an existing volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderVolumeInfo {
    pub path: String,
    pub size_kib: u64,
}

/// Raw-storage backend of one or more provider kinds
#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn kind(&self) -> DeviceProviderKind;

    /// Bulk query of the given volumes' backing names
    async fn prepare(&self, volumes: &[ProviderVolume]) -> Result<()>;

    /// Cached state of a volume or snapshot, `None` if it does not exist
    fn lookup(&self, volume: &ProviderVolume) -> Option<ProviderVolumeInfo>;

    /// Create a volume, returning its device path
    async fn create(&self, volume: &ProviderVolume, size_kib: u64) -> Result<String>;

    async fn resize(&self, volume: &ProviderVolume, size_kib: u64) -> Result<()>;

    /// Delete a volume or snapshot
    async fn delete(&self, volume: &ProviderVolume) -> Result<()>;

    async fn create_snapshot(&self, volume: &ProviderVolume) -> Result<()>;

    /// Total and free capacity of a backing name in KiB
    async fn query_capacity(&self, backing_name: &str) -> Result<(u64, u64)>;

    fn clear_cache(&self);
}

pub type StorageProviderRef = Arc<dyn StorageProvider>;

/// Parse a size printed by lvm or zfs, rounding fractions up
pub(crate) fn parse_kib(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(kib) = value.parse::<u64>() {
        return Some(kib);
    }
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v.ceil() as u64)
}

// =============================================================================
// Storage Layer
// =============================================================================

pub struct StorageLayer {
    pools: Arc<StoragePoolRegistry>,
    providers: BTreeMap<DeviceProviderKind, StorageProviderRef>,
}

impl StorageLayer {
    pub fn new(services: &LayerServices) -> Self {
        let runner = &services.runner;
        let mut providers: BTreeMap<DeviceProviderKind, StorageProviderRef> = BTreeMap::new();
        providers.insert(
            DeviceProviderKind::Lvm,
            Arc::new(LvmProvider::thick(runner.clone())),
        );
        providers.insert(
            DeviceProviderKind::LvmThin,
            Arc::new(LvmProvider::thin(runner.clone())),
        );
        providers.insert(
            DeviceProviderKind::Zfs,
            Arc::new(ZfsProvider::new(runner.clone(), false)),
        );
        providers.insert(
            DeviceProviderKind::ZfsThin,
            Arc::new(ZfsProvider::new(runner.clone(), true)),
        );
        Self {
            pools: services.pools.clone(),
            providers,
        }
    }

    fn provider(&self, kind: DeviceProviderKind) -> Result<&StorageProviderRef> {
        self.providers
            .get(&kind)
            .ok_or_else(|| Error::UnsupportedProvider {
                provider: kind.to_string(),
            })
    }

    /// Refresh the capacity counters of every locally backed pool
    pub async fn refresh_capacity(&self) -> Result<()> {
        for pool in self.pools.list() {
            if !pool.provider.capabilities().has_backing_device {
                continue;
            }
            let Ok(provider) = self.provider(pool.provider) else {
                debug!(pool = %pool.name, provider = %pool.provider, "No local provider, skipping capacity refresh");
                continue;
            };
            let (total_kib, free_kib) = provider.query_capacity(&pool.backing_name).await?;
            self.pools.update_capacity(&pool.name, total_kib, free_kib)?;
            debug!(pool = %pool.name, total_kib, free_kib, "Refreshed pool capacity");
        }
        Ok(())
    }

    fn provider_volumes(node: &LayerNode) -> Result<Vec<(VolumeNumber, ProviderVolume)>> {
        node.volumes()
            .map(|vlm| {
                let backing = vlm.backing().cloned().ok_or_else(|| {
                    Error::Implementation(format!(
                        "storage volume {} of {} has no backing pool",
                        vlm.volume_number(),
                        node
                    ))
                })?;
                Ok((
                    vlm.volume_number(),
                    ProviderVolume {
                        name: volume_identifier(node, vlm.volume_number()),
                        backing,
                        snapshot: node.resource().snapshot.clone(),
                    },
                ))
            })
            .collect()
    }

    async fn ensure_volume(
        &self,
        provider: &StorageProviderRef,
        tree: &mut LayerTree,
        node: LayerNodeId,
        vlm: VolumeNumber,
        pvol: &ProviderVolume,
    ) -> Result<()> {
        let allocated = tree.allocated_kib(node, vlm)?;
        let pool = &pvol.backing.pool;

        let Some(existing) = provider.lookup(pvol) else {
            self.pools.reserve(pool, allocated)?;
            let path = match provider.create(pvol, allocated).await {
                Ok(path) => path,
                Err(e) => {
                    self.pools.release(pool, allocated)?;
                    return Err(e);
                }
            };
            info!(volume = %pvol.name, pool = %pool, size_kib = allocated, "Created storage volume");
            let data = tree.volume_mut(node, vlm)?;
            data.set_device(Some(path), true);
            data.observe_usable_size(allocated);
            return Ok(());
        };

        let data = tree.volume_mut(node, vlm)?;
        data.set_device(Some(existing.path.clone()), true);
        data.observe_usable_size(existing.size_kib);
        match data.size_state() {
            SizeState::AsExpected => {}
            SizeState::TooSmall if pvol.backing.provider.capabilities().resize => {
                let grow = allocated.saturating_sub(existing.size_kib);
                self.pools.reserve(pool, grow)?;
                if let Err(e) = provider.resize(pvol, allocated).await {
                    self.pools.release(pool, grow)?;
                    return Err(e);
                }
                info!(
                    volume = %pvol.name,
                    from_kib = existing.size_kib,
                    to_kib = allocated,
                    "Resized storage volume"
                );
                let data = tree.volume_mut(node, vlm)?;
                data.set_usable_size(allocated);
                data.reset_size_state();
            }
            state => {
                warn!(
                    volume = %pvol.name,
                    expected_kib = allocated,
                    actual_kib = existing.size_kib,
                    ?state,
                    "Storage volume size differs from the negotiated size"
                );
            }
        }
        Ok(())
    }

    async fn remove_volume(
        &self,
        provider: &StorageProviderRef,
        tree: &mut LayerTree,
        node: LayerNodeId,
        vlm: VolumeNumber,
        pvol: &ProviderVolume,
    ) -> Result<()> {
        if let Some(existing) = provider.lookup(pvol) {
            provider.delete(pvol).await?;
            if pvol.snapshot.is_none() {
                self.pools.release(&pvol.backing.pool, existing.size_kib)?;
            }
            info!(volume = %pvol.name, snapshot = ?pvol.snapshot, "Deleted storage volume");
        }
        tree.volume_mut(node, vlm)?.set_device(None, false);
        Ok(())
    }

    async fn ensure_snapshot(
        &self,
        provider: &StorageProviderRef,
        tree: &mut LayerTree,
        node: LayerNodeId,
        vlm: VolumeNumber,
        pvol: &ProviderVolume,
    ) -> Result<()> {
        if !pvol.backing.provider.capabilities().snapshots {
            return Err(Error::Storage {
                layer: DeviceLayerKind::Storage.tag().to_string(),
                reason: format!(
                    "provider {} of pool {} does not support snapshots",
                    pvol.backing.provider, pvol.backing.pool
                ),
            });
        }
        if provider.lookup(pvol).is_none() {
            provider.create_snapshot(pvol).await?;
            info!(volume = %pvol.name, snapshot = ?pvol.snapshot, "Created snapshot");
        }
        tree.volume_mut(node, vlm)?.set_device(None, true);
        Ok(())
    }
}

#[async_trait]
impl DeviceLayer for StorageLayer {
    fn kind(&self) -> DeviceLayerKind {
        DeviceLayerKind::Storage
    }

    async fn prepare(&self, nodes: &[&LayerNode]) -> Result<()> {
        let mut by_provider: BTreeMap<DeviceProviderKind, Vec<ProviderVolume>> = BTreeMap::new();
        for node in nodes {
            for (_, pvol) in Self::provider_volumes(node)? {
                by_provider
                    .entry(pvol.backing.provider)
                    .or_default()
                    .push(pvol);
            }
        }
        for (kind, volumes) in by_provider {
            // kinds without a local provider fail later, per resource
            let Some(provider) = self.providers.get(&kind) else {
                continue;
            };
            provider.prepare(&volumes).await?;
        }
        Ok(())
    }

    async fn process(&self, tree: &mut LayerTree, node: LayerNodeId) -> Result<LayerProcessResult> {
        let volumes = Self::provider_volumes(tree.node(node)?)?;
        let deleting = tree.is_deleting();
        let mut provided = false;

        for (vlm, pvol) in volumes {
            if !pvol.backing.provider.capabilities().has_backing_device {
                continue;
            }
            let provider = self.provider(pvol.backing.provider)?.clone();
            match (pvol.snapshot.is_some(), deleting) {
                (_, true) => self.remove_volume(&provider, tree, node, vlm, &pvol).await?,
                (true, false) => self.ensure_snapshot(&provider, tree, node, vlm, &pvol).await?,
                (false, false) => self.ensure_volume(&provider, tree, node, vlm, &pvol).await?,
            }
            provided = true;
        }

        Ok(if provided {
            LayerProcessResult::Success
        } else {
            LayerProcessResult::NoDevicesProvided
        })
    }

    fn clear_cache(&self) {
        for provider in self.providers.values() {
            provider.clear_cache();
        }
    }
}
