//! Layer Tree Builder
//!
//! Turns a [`LayerStackSpec`] into a [`LayerTree`]: one node per requested
//! kind, outermost first, with side children where a layer needs a
//! physically separate backing device.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use crate::config::{SatelliteConfig, SizingConfig};
use crate::domain::{StoragePoolRegistry, DEFAULT_DISKLESS_POOL};
use crate::error::{Error, Result};
use crate::kinds::{
    DeviceLayerKind, SUFFIX_BCACHE_CACHE, SUFFIX_CACHE_CACHE, SUFFIX_CACHE_META, SUFFIX_DATA,
    SUFFIX_DRBD_META, SUFFIX_WRITECACHE_CACHE,
};
use crate::tree::layer_tree::LayerTree;
use crate::tree::node::{
    BCacheParams, CacheParams, DrbdParams, LayerNodeId, LayerPayload, LuksParams, NvmeParams,
    ResourceRef, WritecacheParams,
};
use crate::tree::spec::{CacheSize, LayerStackSpec, NvmeRole, NvmeTransport};
use crate::tree::volume::VolumeLayerData;

/// Builds layer trees from stack descriptions
pub struct LayerTreeBuilder {
    pools: Arc<StoragePoolRegistry>,
    sizing: SizingConfig,
    nvme_transport: NvmeTransport,
    nvme_port: u16,
}

impl LayerTreeBuilder {
    pub fn new(pools: Arc<StoragePoolRegistry>, config: &SatelliteConfig) -> Self {
        Self {
            pools,
            sizing: config.sizing.clone(),
            nvme_transport: config.nvme_transport,
            nvme_port: config.nvme_port,
        }
    }

    /// Build the tree of one resource or snapshot
    pub fn build(&self, spec: &LayerStackSpec) -> Result<LayerTree> {
        Self::validate_layers(&spec.layers)?;
        Self::validate_volumes(spec)?;

        let resource = match &spec.snapshot {
            Some(snap) => ResourceRef::snapshot(&spec.resource, snap),
            None => ResourceRef::resource(&spec.resource),
        };

        let root_kind = spec.layers[0];
        let mut tree = LayerTree::new(
            resource,
            self.payload(root_kind, spec)?,
            self.volumes(root_kind, spec)?,
        );
        tree.set_deleting(spec.delete);
        tree.set_suspend_requested(spec.suspend_io);

        let root = tree.root();
        for vlm in &spec.volumes {
            tree.set_usable(root, vlm.number, vlm.size_kib)?;
        }
        self.build_below(&mut tree, root, &spec.layers, spec)?;

        debug!(
            resource = %tree.resource(),
            nodes = tree.len(),
            "Built layer tree"
        );
        Ok(tree)
    }

    fn validate_layers(layers: &[DeviceLayerKind]) -> Result<()> {
        let last = layers
            .last()
            .ok_or_else(|| Error::InvalidLayerStack("layer list is empty".into()))?;
        if *last != DeviceLayerKind::Storage {
            return Err(Error::InvalidLayerStack(format!(
                "layer list must end with storage, ends with {}",
                last
            )));
        }
        let mut seen = BTreeSet::new();
        for (idx, kind) in layers.iter().enumerate() {
            if !seen.insert(*kind) {
                return Err(Error::InvalidLayerStack(format!(
                    "layer {} is requested more than once",
                    kind
                )));
            }
            if *kind == DeviceLayerKind::Storage && idx != layers.len() - 1 {
                return Err(Error::InvalidLayerStack(
                    "storage must be the last layer".into(),
                ));
            }
        }
        Ok(())
    }

    fn validate_volumes(spec: &LayerStackSpec) -> Result<()> {
        let mut numbers = BTreeSet::new();
        for vlm in &spec.volumes {
            if !numbers.insert(vlm.number) {
                return Err(Error::InvalidLayerStack(format!(
                    "volume {} is defined more than once",
                    vlm.number
                )));
            }
        }
        if spec.layers.contains(&DeviceLayerKind::Drbd) {
            let with_meta = spec.volumes.iter().filter(|v| v.meta_pool.is_some()).count();
            if with_meta != 0 && with_meta != spec.volumes.len() {
                return Err(Error::InvalidLayerStack(
                    "either all or no volumes may use external DRBD metadata".into(),
                ));
            }
        }
        Ok(())
    }

    fn build_below(
        &self,
        tree: &mut LayerTree,
        node: LayerNodeId,
        layers: &[DeviceLayerKind],
        spec: &LayerStackSpec,
    ) -> Result<()> {
        let kind = layers[0];
        let below = &layers[1..];
        if kind == DeviceLayerKind::Storage {
            return Ok(());
        }

        if Self::is_diskless_here(kind, spec) {
            let pool = self.pools.backing_ref(DEFAULT_DISKLESS_POOL)?;
            let volumes = spec
                .volumes
                .iter()
                .map(|v| VolumeLayerData::new(v.number, Some(pool.clone())))
                .collect();
            tree.insert_child(node, SUFFIX_DATA, LayerPayload::Storage, volumes)?;
            return Ok(());
        }

        let data_kind = below[0];
        let data = tree.insert_child(
            node,
            SUFFIX_DATA,
            self.payload(data_kind, spec)?,
            self.volumes(data_kind, spec)?,
        )?;
        self.build_below(tree, data, below, spec)?;

        for (suffix, pools) in self.side_children(kind, spec) {
            let mut volumes = Vec::with_capacity(spec.volumes.len());
            for vlm in &spec.volumes {
                let pool = pools.get(&vlm.number).ok_or_else(|| {
                    Error::InvalidLayerStack(format!(
                        "volume {} has no pool for the {} child",
                        vlm.number, suffix
                    ))
                })?;
                volumes.push(VolumeLayerData::new(
                    vlm.number,
                    Some(self.pools.backing_ref(pool)?),
                ));
            }
            tree.insert_child(node, suffix, LayerPayload::Storage, volumes)?;
        }
        Ok(())
    }

    fn is_diskless_here(kind: DeviceLayerKind, spec: &LayerStackSpec) -> bool {
        match kind {
            DeviceLayerKind::Drbd => spec.drbd.diskless || spec.drbd.skip_disk,
            DeviceLayerKind::Nvme => spec.nvme.role == NvmeRole::Initiator,
            _ => false,
        }
    }

    /// Side children of a fanning-out layer with the pool of each volume
    fn side_children(
        &self,
        kind: DeviceLayerKind,
        spec: &LayerStackSpec,
    ) -> Vec<(&'static str, BTreeMap<u32, String>)> {
        let uniform = |pool: &String| -> BTreeMap<u32, String> {
            spec.volumes.iter().map(|v| (v.number, pool.clone())).collect()
        };
        match kind {
            DeviceLayerKind::Drbd => {
                let meta: BTreeMap<_, _> = spec
                    .volumes
                    .iter()
                    .filter_map(|v| v.meta_pool.clone().map(|p| (v.number, p)))
                    .collect();
                if meta.is_empty() {
                    vec![]
                } else {
                    vec![(SUFFIX_DRBD_META, meta)]
                }
            }
            DeviceLayerKind::Writecache => match &spec.writecache.cache_pool {
                Some(pool) => vec![(SUFFIX_WRITECACHE_CACHE, uniform(pool))],
                None => vec![],
            },
            DeviceLayerKind::Cache => match &spec.cache.cache_pool {
                Some(pool) => {
                    let meta_pool = spec.cache.meta_pool.as_ref().unwrap_or(pool);
                    vec![
                        (SUFFIX_CACHE_CACHE, uniform(pool)),
                        (SUFFIX_CACHE_META, uniform(meta_pool)),
                    ]
                }
                None => vec![],
            },
            DeviceLayerKind::BCache => match &spec.bcache.cache_pool {
                Some(pool) => vec![(SUFFIX_BCACHE_CACHE, uniform(pool))],
                None => vec![],
            },
            _ => vec![],
        }
    }

    fn volumes(
        &self,
        kind: DeviceLayerKind,
        spec: &LayerStackSpec,
    ) -> Result<Vec<VolumeLayerData>> {
        spec.volumes
            .iter()
            .map(|vlm| {
                let backing = if kind == DeviceLayerKind::Storage {
                    Some(self.pools.backing_ref(&vlm.storage_pool)?)
                } else {
                    None
                };
                Ok(VolumeLayerData::new(vlm.number, backing))
            })
            .collect()
    }

    /// Resolve the payload of a kind, filling in configured defaults
    fn payload(&self, kind: DeviceLayerKind, spec: &LayerStackSpec) -> Result<LayerPayload> {
        let sizing = &self.sizing;
        let payload = match kind {
            DeviceLayerKind::Drbd => {
                let mut minors = BTreeMap::new();
                for vlm in &spec.volumes {
                    let minor = vlm.minor.ok_or_else(|| Error::InvalidLayerParameter {
                        layer: kind.to_string(),
                        reason: format!("volume {} has no minor number", vlm.number),
                    })?;
                    minors.insert(vlm.number, minor);
                }
                LayerPayload::Drbd(DrbdParams {
                    peer_slots: spec.drbd.peer_slots.unwrap_or(sizing.peer_slots),
                    al_stripes: spec.drbd.al_stripes.unwrap_or(sizing.al_stripes),
                    al_stripe_size_kib: spec
                        .drbd
                        .al_stripe_size_kib
                        .unwrap_or(sizing.al_stripe_size_kib),
                    diskless: spec.drbd.diskless,
                    skip_disk: spec.drbd.skip_disk,
                    node_id: spec.drbd.node_id,
                    port: spec.drbd.port,
                    peers: spec.drbd.peers.clone(),
                    minors,
                })
            }
            DeviceLayerKind::Luks => LayerPayload::Luks(LuksParams {
                key_ref: spec.luks.key_ref.clone().ok_or_else(|| {
                    Error::InvalidLayerParameter {
                        layer: kind.to_string(),
                        reason: "no key reference given".to_string(),
                    }
                })?,
            }),
            DeviceLayerKind::Nvme => {
                let address = match (spec.nvme.role, &spec.nvme.address) {
                    (_, Some(address)) => address.clone(),
                    (NvmeRole::Target, None) => "0.0.0.0".to_string(),
                    (NvmeRole::Initiator, None) => {
                        return Err(Error::InvalidLayerParameter {
                            layer: kind.to_string(),
                            reason: "initiator needs a target address".to_string(),
                        })
                    }
                };
                LayerPayload::Nvme(NvmeParams {
                    role: spec.nvme.role,
                    transport: spec.nvme.transport.unwrap_or(self.nvme_transport),
                    address,
                    port: spec.nvme.port.unwrap_or(self.nvme_port),
                })
            }
            DeviceLayerKind::Writecache => LayerPayload::Writecache(WritecacheParams {
                cache_size: spec
                    .writecache
                    .cache_size
                    .unwrap_or(CacheSize::Percent(sizing.cache_percent)),
                block_size_bytes: spec
                    .writecache
                    .block_size_bytes
                    .unwrap_or(sizing.writecache_block_size_bytes),
                pmem: spec.writecache.pmem,
            }),
            DeviceLayerKind::Cache => LayerPayload::Cache(CacheParams {
                cache_size: spec
                    .cache
                    .cache_size
                    .unwrap_or(CacheSize::Percent(sizing.cache_percent)),
                meta_size_kib: spec.cache.meta_size_kib.unwrap_or(sizing.dm_cache_meta_kib),
                block_size_kib: spec.cache.block_size_kib.unwrap_or(sizing.dm_cache_block_kib),
                feature: spec
                    .cache
                    .feature
                    .clone()
                    .unwrap_or_else(|| sizing.dm_cache_feature.clone()),
                policy: spec
                    .cache
                    .policy
                    .clone()
                    .unwrap_or_else(|| sizing.dm_cache_policy.clone()),
            }),
            DeviceLayerKind::BCache => LayerPayload::BCache(BCacheParams {
                cache_size: spec
                    .bcache
                    .cache_size
                    .unwrap_or(CacheSize::Percent(sizing.cache_percent)),
            }),
            DeviceLayerKind::Storage => LayerPayload::Storage,
        };
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StoragePool;
    use crate::kinds::DeviceProviderKind;
    use crate::tree::spec::VolumeSpec;

    fn pools() -> Arc<StoragePoolRegistry> {
        let pool = |name: &str, provider| StoragePool {
            name: name.into(),
            provider,
            backing_name: name.into(),
            granularity_kib: None,
            total_kib: 1 << 30,
            free_kib: 1 << 30,
        };
        Arc::new(StoragePoolRegistry::with_pools([
            pool("hdd", DeviceProviderKind::Lvm),
            pool("ssd", DeviceProviderKind::LvmThin),
            pool("nvme", DeviceProviderKind::Zfs),
        ]))
    }

    fn builder() -> LayerTreeBuilder {
        LayerTreeBuilder::new(pools(), &SatelliteConfig::default())
    }

    fn spec(layers: Vec<DeviceLayerKind>) -> LayerStackSpec {
        LayerStackSpec {
            resource: "r0".into(),
            snapshot: None,
            layers,
            volumes: vec![VolumeSpec {
                number: 0,
                size_kib: 1 << 20,
                storage_pool: "hdd".into(),
                meta_pool: None,
                minor: Some(1000),
            }],
            drbd: Default::default(),
            luks: Default::default(),
            nvme: Default::default(),
            writecache: Default::default(),
            cache: Default::default(),
            bcache: Default::default(),
            delete: false,
            suspend_io: false,
        }
    }

    #[test]
    fn test_linear_stack() {
        let mut s = spec(vec![
            DeviceLayerKind::Drbd,
            DeviceLayerKind::Luks,
            DeviceLayerKind::Storage,
        ]);
        s.luks.key_ref = Some("master".into());
        let tree = builder().build(&s).unwrap();
        assert_eq!(tree.len(), 3);
        let root = tree.node(tree.root()).unwrap();
        assert_eq!(root.kind(), DeviceLayerKind::Drbd);
        assert_eq!(root.drbd().unwrap().peer_slots, 7);
        assert_eq!(root.drbd().unwrap().minors[&0], 1000);
        assert_eq!(tree.usable_kib(tree.root(), 0).unwrap(), 1 << 20);

        let storage = tree.iter_kind(DeviceLayerKind::Storage)[0];
        let vlm = tree.volume(storage, 0).unwrap();
        assert_eq!(vlm.storage_pool(), Some("hdd"));
        assert_eq!(vlm.backing().unwrap().granularity_kib, 4096);
    }

    #[test]
    fn test_invalid_layer_lists() {
        let b = builder();
        for layers in [
            vec![],
            vec![DeviceLayerKind::Drbd],
            vec![DeviceLayerKind::Storage, DeviceLayerKind::Drbd, DeviceLayerKind::Storage],
            vec![DeviceLayerKind::Luks, DeviceLayerKind::Luks, DeviceLayerKind::Storage],
        ] {
            let err = b.build(&spec(layers)).unwrap_err();
            assert!(matches!(err, Error::InvalidLayerStack(_)), "{:?}", err);
        }
    }

    #[test]
    fn test_drbd_external_metadata_child() {
        let mut s = spec(vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage]);
        s.volumes[0].meta_pool = Some("ssd".into());
        let tree = builder().build(&s).unwrap();
        let meta = tree.child_by_suffix(tree.root(), SUFFIX_DRBD_META).unwrap();
        let node = tree.node(meta).unwrap();
        assert_eq!(node.kind(), DeviceLayerKind::Storage);
        assert_eq!(node.suffixed_name(), "r0.meta");
        assert_eq!(node.volume(0).unwrap().storage_pool(), Some("ssd"));
    }

    #[test]
    fn test_mixed_external_metadata_rejected() {
        let mut s = spec(vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage]);
        s.volumes[0].meta_pool = Some("ssd".into());
        s.volumes.push(VolumeSpec {
            number: 1,
            size_kib: 1024,
            storage_pool: "hdd".into(),
            meta_pool: None,
            minor: Some(1001),
        });
        assert!(matches!(
            builder().build(&s),
            Err(Error::InvalidLayerStack(_))
        ));
    }

    #[test]
    fn test_diskless_drbd_skips_lower_layers() {
        let mut s = spec(vec![
            DeviceLayerKind::Drbd,
            DeviceLayerKind::Luks,
            DeviceLayerKind::Storage,
        ]);
        s.drbd.diskless = true;
        s.luks.key_ref = Some("k".into());
        let tree = builder().build(&s).unwrap();
        assert_eq!(tree.len(), 2);
        let storage = tree.data_child(tree.root()).unwrap();
        let backing = tree.volume(storage, 0).unwrap().backing().unwrap().clone();
        assert_eq!(backing.provider, DeviceProviderKind::Diskless);
        assert_eq!(backing.pool, DEFAULT_DISKLESS_POOL);
    }

    #[test]
    fn test_skip_disk_drbd_gets_diskless_child_only() {
        let mut s = spec(vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage]);
        s.volumes[0].meta_pool = Some("ssd".into());
        s.drbd.skip_disk = true;
        let tree = builder().build(&s).unwrap();
        assert_eq!(tree.len(), 2);
        assert!(tree.child_by_suffix(tree.root(), SUFFIX_DRBD_META).is_none());
        let storage = tree.data_child(tree.root()).unwrap();
        let backing = tree.volume(storage, 0).unwrap().backing().unwrap().clone();
        assert_eq!(backing.provider, DeviceProviderKind::Diskless);
        assert!(tree.node(tree.root()).unwrap().drbd().unwrap().skip_disk);
    }

    #[test]
    fn test_cache_fan_out() {
        let mut s = spec(vec![DeviceLayerKind::Cache, DeviceLayerKind::Storage]);
        s.cache.cache_pool = Some("nvme".into());
        let tree = builder().build(&s).unwrap();
        assert_eq!(tree.len(), 4);
        let dmeta = tree.child_by_suffix(tree.root(), SUFFIX_CACHE_META).unwrap();
        assert_eq!(tree.volume(dmeta, 0).unwrap().storage_pool(), Some("nvme"));
        match tree.node(tree.root()).unwrap().payload() {
            LayerPayload::Cache(params) => {
                assert_eq!(params.cache_size, CacheSize::Percent(5));
                assert_eq!(params.policy, "smq");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_writecache_without_pool_does_not_fan_out() {
        let s = spec(vec![DeviceLayerKind::Writecache, DeviceLayerKind::Storage]);
        let tree = builder().build(&s).unwrap();
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_unknown_pool_and_missing_parameters() {
        let mut s = spec(vec![DeviceLayerKind::Storage]);
        s.volumes[0].storage_pool = "missing".into();
        assert!(matches!(
            builder().build(&s),
            Err(Error::StoragePoolNotFound { .. })
        ));

        let s = spec(vec![DeviceLayerKind::Luks, DeviceLayerKind::Storage]);
        assert!(matches!(
            builder().build(&s),
            Err(Error::InvalidLayerParameter { .. })
        ));

        let mut s = spec(vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage]);
        s.volumes[0].minor = None;
        assert!(builder().build(&s).is_err());
    }
}
