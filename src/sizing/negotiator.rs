//! Size Negotiation
//!
//! Reconciles usable sizes (what the layer above asked for) with allocated
//! sizes (what the layers below consume) across a whole layer tree.
//!
//! `descend` starts from a usable size and works towards the storage leaves;
//! `ascend` starts from an allocated size and derives usable sizes back up.
//! Both are pure computations over the tree.

use tracing::trace;

use crate::config::SizingConfig;
use crate::error::{Error, Result};
use crate::kinds::{
    SUFFIX_BCACHE_CACHE, SUFFIX_CACHE_CACHE, SUFFIX_CACHE_META, SUFFIX_DRBD_META,
    SUFFIX_WRITECACHE_CACHE,
};
use crate::sizing::drbd_md::{align_up, MdLayout};
use crate::tree::node::{DrbdParams, LayerNodeId, LayerPayload};
use crate::tree::spec::{CacheSize, NvmeRole};
use crate::tree::volume::{VolumeNumber, UNBOUNDED_KIB};
use crate::tree::LayerTree;

/// How a layer relates its own usable size to its data child
#[derive(Debug, Clone, Copy)]
enum Overhead {
    /// Data child gets the same size
    PassThrough,
    /// Fixed amount in front of the data
    Fixed(u64),
    /// DRBD metadata folded into the data child
    InternalMd(MdLayout),
}

/// A side child sized from the data child's actual size
#[derive(Debug, Clone, Copy)]
enum SideSize {
    ExternalMd(MdLayout),
    Cache(CacheSize),
    Absolute(u64),
}

/// Everything a non-storage layer needs to size itself and its children
struct LayerRule {
    overhead: Overhead,
    sides: Vec<(&'static str, SideSize)>,
}

/// Size negotiator over layer trees
#[derive(Debug, Clone, Default)]
pub struct SizeNegotiator {
    sizing: SizingConfig,
}

impl SizeNegotiator {
    pub fn new(sizing: SizingConfig) -> Self {
        Self { sizing }
    }

    /// Descend every volume of the tree from its root.
    ///
    /// The root volumes' usable sizes must already be set.
    pub fn negotiate(&self, tree: &mut LayerTree) -> Result<()> {
        let root = tree.root();
        for vlm in tree.volume_numbers() {
            self.descend(tree, root, vlm)?;
        }
        Ok(())
    }

    /// Top-down pass: the usable size of `node` is set, compute everything below
    pub fn descend(&self, tree: &mut LayerTree, node: LayerNodeId, vlm: VolumeNumber) -> Result<()> {
        let payload = tree.node(node)?.payload().clone();
        if self.short_circuit(tree, node, vlm, &payload)? {
            return Ok(());
        }
        let usable = tree.usable_kib(node, vlm)?;

        if let LayerPayload::Storage = payload {
            return Self::descend_storage(tree, node, vlm, usable);
        }

        // rejected parameters never reach a child
        let rule = self.rule(tree, node, &payload)?;
        let data = Self::data_child(tree, node)?;

        let request = match rule.overhead {
            Overhead::PassThrough => usable,
            Overhead::Fixed(kib) => usable
                .checked_add(kib)
                .ok_or(Error::MaxSize { size_kib: usable })?,
            Overhead::InternalMd(md) => md.gross_size(usable)?,
        };
        tree.set_usable(data, vlm, request)?;
        self.descend(tree, data, vlm)?;

        // side children are sized from what the data child actually provides,
        // which may exceed the request after rounding
        let actual = match tree.usable_kib(data, vlm)? {
            UNBOUNDED_KIB => request,
            kib => kib,
        };
        let mut allocated = actual;
        for (suffix, side) in rule.sides {
            let Some(child) = tree.child_by_suffix(node, suffix) else {
                continue;
            };
            tree.set_usable(child, vlm, Self::side_size(side, actual)?)?;
            self.descend(tree, child, vlm)?;
            allocated = allocated.saturating_add(bounded(tree.usable_kib(child, vlm)?));
        }
        tree.set_allocated(node, vlm, allocated)?;

        trace!(node = %node, volume = vlm, usable, allocated, "Descended");
        Ok(())
    }

    /// Bottom-up pass: the allocated size of `node` is set, derive usable sizes
    pub fn ascend(&self, tree: &mut LayerTree, node: LayerNodeId, vlm: VolumeNumber) -> Result<()> {
        let payload = tree.node(node)?.payload().clone();
        if self.short_circuit(tree, node, vlm, &payload)? {
            return Ok(());
        }
        let allocated = tree.allocated_kib(node, vlm)?;

        if let LayerPayload::Storage = payload {
            return tree.set_usable(node, vlm, allocated);
        }

        let rule = self.rule(tree, node, &payload)?;
        let data = Self::data_child(tree, node)?;

        // side children take their share of the allocation first
        let data_allocated = if rule.sides.is_empty() {
            allocated
        } else {
            Self::data_share(tree, node, vlm, &rule.sides, allocated)?
        };
        tree.set_allocated(data, vlm, data_allocated)?;
        self.ascend(tree, data, vlm)?;

        let data_usable = tree.usable_kib(data, vlm)?;
        let usable = match rule.overhead {
            Overhead::PassThrough => data_usable,
            Overhead::Fixed(kib) => data_usable
                .checked_sub(kib)
                .filter(|u| *u > 0)
                .ok_or(Error::MinSize {
                    size_kib: data_usable,
                })?,
            Overhead::InternalMd(md) => md.net_size(data_usable)?,
        };
        tree.set_usable(node, vlm, usable)?;

        if !rule.sides.is_empty() {
            let mut total = data_usable;
            for (suffix, side) in rule.sides {
                let Some(child) = tree.child_by_suffix(node, suffix) else {
                    continue;
                };
                let kib = Self::side_size(side, data_usable)?;
                tree.set_allocated(child, vlm, Self::side_allocation(tree, child, vlm, kib)?)?;
                self.ascend(tree, child, vlm)?;
                total = total.saturating_add(bounded(tree.usable_kib(child, vlm)?));
            }
            tree.set_allocated(node, vlm, total)?;
        }

        trace!(node = %node, volume = vlm, allocated, usable, "Ascended");
        Ok(())
    }

    // =========================================================================
    // Per-Kind Rules
    // =========================================================================

    /// Diskless variants report unbounded usable and zero allocated sizes
    fn short_circuit(
        &self,
        tree: &mut LayerTree,
        node: LayerNodeId,
        vlm: VolumeNumber,
        payload: &LayerPayload,
    ) -> Result<bool> {
        let diskless = match payload {
            LayerPayload::Drbd(params) => params.diskless || params.skip_disk,
            LayerPayload::Nvme(params) => params.role == NvmeRole::Initiator,
            LayerPayload::Storage => tree
                .volume(node, vlm)?
                .backing()
                .map_or(false, |b| b.provider.is_diskless()),
            _ => false,
        };
        if diskless {
            tree.set_usable(node, vlm, UNBOUNDED_KIB)?;
            tree.set_allocated(node, vlm, 0)?;
        }
        Ok(diskless)
    }

    fn descend_storage(
        tree: &mut LayerTree,
        node: LayerNodeId,
        vlm: VolumeNumber,
        usable: u64,
    ) -> Result<()> {
        let backing = tree.volume(node, vlm)?.backing().cloned().ok_or_else(|| {
            Error::Implementation(format!(
                "storage volume {} of layer node {} has no backing pool",
                vlm, node
            ))
        })?;
        let rounded = align_up(usable, backing.granularity_kib.max(1));
        tree.set_usable(node, vlm, rounded)?;
        tree.set_allocated(node, vlm, rounded)?;
        Ok(())
    }

    fn data_child(tree: &LayerTree, node: LayerNodeId) -> Result<LayerNodeId> {
        tree.data_child(node).ok_or_else(|| {
            Error::Implementation(format!("layer node {} has no data child", node))
        })
    }

    fn md_layout(params: &DrbdParams) -> Result<MdLayout> {
        let md = MdLayout::new(params.peer_slots, params.al_stripes, params.al_stripe_size_kib);
        md.validate()?;
        Ok(md)
    }

    /// Overhead and side children of a non-storage layer
    fn rule(&self, tree: &LayerTree, node: LayerNodeId, payload: &LayerPayload) -> Result<LayerRule> {
        let present = |suffix: &str| tree.child_by_suffix(node, suffix).is_some();
        let rule = match payload {
            LayerPayload::Drbd(params) => {
                let md = Self::md_layout(params)?;
                if present(SUFFIX_DRBD_META) {
                    LayerRule {
                        overhead: Overhead::PassThrough,
                        sides: vec![(SUFFIX_DRBD_META, SideSize::ExternalMd(md))],
                    }
                } else {
                    LayerRule {
                        overhead: Overhead::InternalMd(md),
                        sides: vec![],
                    }
                }
            }
            LayerPayload::Luks(_) => LayerRule {
                overhead: Overhead::Fixed(self.sizing.luks_header_kib),
                sides: vec![],
            },
            LayerPayload::Nvme(_) => LayerRule {
                overhead: Overhead::PassThrough,
                sides: vec![],
            },
            LayerPayload::Writecache(params) => {
                check_cache_size(&params.cache_size)?;
                LayerRule {
                    overhead: Overhead::PassThrough,
                    sides: vec![(SUFFIX_WRITECACHE_CACHE, SideSize::Cache(params.cache_size))],
                }
            }
            LayerPayload::Cache(params) => {
                check_cache_size(&params.cache_size)?;
                LayerRule {
                    overhead: Overhead::PassThrough,
                    sides: vec![
                        (SUFFIX_CACHE_CACHE, SideSize::Cache(params.cache_size)),
                        (SUFFIX_CACHE_META, SideSize::Absolute(params.meta_size_kib)),
                    ],
                }
            }
            LayerPayload::BCache(params) => {
                check_cache_size(&params.cache_size)?;
                LayerRule {
                    overhead: Overhead::Fixed(self.sizing.bcache_superblock_kib),
                    sides: vec![(SUFFIX_BCACHE_CACHE, SideSize::Cache(params.cache_size))],
                }
            }
            LayerPayload::Storage => {
                return Err(Error::Implementation(
                    "storage layers have no layer rule".to_string(),
                ))
            }
        };
        Ok(rule)
    }

    /// Largest data size that fits into `allocated` together with the side
    /// children sized from it.
    ///
    /// The total grows strictly with the data size, so a binary search over
    /// `[1, allocated]` finds the exact inverse of `descend`.
    fn data_share(
        tree: &LayerTree,
        node: LayerNodeId,
        vlm: VolumeNumber,
        sides: &[(&'static str, SideSize)],
        allocated: u64,
    ) -> Result<u64> {
        let fits = |data_kib: u64| -> bool {
            let mut total = data_kib;
            for (suffix, side) in sides {
                let Some(child) = tree.child_by_suffix(node, suffix) else {
                    continue;
                };
                let consumed = Self::side_size(*side, data_kib)
                    .and_then(|kib| Self::side_allocation(tree, child, vlm, kib));
                match consumed.ok().and_then(|kib| total.checked_add(kib)) {
                    Some(sum) => total = sum,
                    None => return false,
                }
            }
            total <= allocated
        };

        if allocated == 0 || !fits(1) {
            return Err(Error::MinSize {
                size_kib: allocated,
            });
        }
        let (mut low, mut high) = (1u64, allocated);
        while low < high {
            let mid = low + (high - low).div_ceil(2);
            if fits(mid) {
                low = mid;
            } else {
                high = mid - 1;
            }
        }
        Ok(low)
    }

    /// What a side child consumes to provide `kib`
    fn side_allocation(
        tree: &LayerTree,
        child: LayerNodeId,
        vlm: VolumeNumber,
        kib: u64,
    ) -> Result<u64> {
        if !matches!(tree.node(child)?.payload(), LayerPayload::Storage) {
            return Ok(kib);
        }
        Ok(match tree.volume(child, vlm)?.backing() {
            Some(backing) if backing.provider.is_diskless() => 0,
            Some(backing) => align_up(kib, backing.granularity_kib.max(1)),
            None => kib,
        })
    }

    fn side_size(side: SideSize, data_kib: u64) -> Result<u64> {
        match side {
            SideSize::ExternalMd(md) => md.external_md_size(data_kib),
            SideSize::Cache(CacheSize::Percent(pct)) => {
                let kib = (data_kib as u128 * pct as u128).div_ceil(100);
                Ok((kib as u64).max(1))
            }
            SideSize::Cache(CacheSize::Kib(kib)) | SideSize::Absolute(kib) => Ok(kib),
        }
    }
}

/// Unbounded sizes of diskless children consume nothing locally
fn bounded(kib: u64) -> u64 {
    if kib == UNBOUNDED_KIB {
        0
    } else {
        kib
    }
}

fn check_cache_size(size: &CacheSize) -> Result<()> {
    match size {
        CacheSize::Percent(pct) if *pct == 0 || *pct > 100 => Err(Error::InvalidLayerParameter {
            layer: "cache".to_string(),
            reason: format!("cache size {}% outside of (0, 100]", pct),
        }),
        CacheSize::Kib(0) => Err(Error::InvalidLayerParameter {
            layer: "cache".to_string(),
            reason: "cache size must not be zero".to_string(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SatelliteConfig;
    use crate::domain::{StoragePool, StoragePoolRegistry};
    use crate::kinds::{DeviceLayerKind, DeviceProviderKind};
    use crate::tree::spec::{LayerStackSpec, VolumeSpec};
    use crate::tree::volume::Size;
    use crate::tree::LayerTreeBuilder;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    const GIB: u64 = 1 << 20;

    fn pool(name: &str, granularity_kib: u64) -> StoragePool {
        StoragePool {
            name: name.into(),
            provider: DeviceProviderKind::Lvm,
            backing_name: name.into(),
            granularity_kib: Some(granularity_kib),
            total_kib: 1 << 40,
            free_kib: 1 << 40,
        }
    }

    fn build(spec: &LayerStackSpec) -> LayerTree {
        let pools = Arc::new(StoragePoolRegistry::with_pools([
            pool("fine", 1),
            pool("lvm", 4096),
            pool("coarse", 64 * GIB),
            pool("meta", 4),
        ]));
        LayerTreeBuilder::new(pools, &SatelliteConfig::default())
            .build(spec)
            .unwrap()
    }

    fn spec(layers: Vec<DeviceLayerKind>, size_kib: u64, pool: &str) -> LayerStackSpec {
        let mut spec: LayerStackSpec =
            serde_yaml::from_str("resource: r0\nlayers: []\nvolumes: []\n").unwrap();
        spec.layers = layers;
        spec.volumes = vec![VolumeSpec {
            number: 0,
            size_kib,
            storage_pool: pool.into(),
            meta_pool: None,
            minor: Some(1000),
        }];
        spec.luks.key_ref = Some("k".into());
        spec
    }

    fn negotiator() -> SizeNegotiator {
        SizeNegotiator::new(SizingConfig::default())
    }

    fn drbd_params_mut(tree: &mut LayerTree) -> &mut DrbdParams {
        let root = tree.root();
        match &mut tree.node_mut(root).unwrap().payload {
            LayerPayload::Drbd(params) => params,
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_internal_metadata_reference_value() {
        let mut s = spec(vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage], 2048, "fine");
        s.drbd.peer_slots = Some(5);
        let mut tree = build(&s);
        negotiator().negotiate(&mut tree).unwrap();

        let root = tree.root();
        let data = tree.data_child(root).unwrap();
        assert_eq!(tree.usable_kib(data, 0).unwrap(), 2088);
        assert_eq!(tree.allocated_kib(root, 0).unwrap(), 2088);
        assert_eq!(tree.usable_kib(root, 0).unwrap(), 2048);
    }

    #[test]
    fn test_round_trip_within_one_granularity_step() {
        let n = negotiator();
        for size in [4096u64, 10_000, GIB, 3 * GIB + 17] {
            let s = spec(vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage], size, "lvm");
            let mut tree = build(&s);
            n.negotiate(&mut tree).unwrap();
            let root = tree.root();
            n.ascend(&mut tree, root, 0).unwrap();
            let usable = tree.usable_kib(root, 0).unwrap();
            assert!(usable >= size, "size={} usable={}", size, usable);
            assert!(usable < size + 4096, "size={} usable={}", size, usable);

            // a second round trip is stable
            n.descend(&mut tree, root, 0).unwrap();
            let allocated = tree.allocated_kib(root, 0).unwrap();
            n.ascend(&mut tree, root, 0).unwrap();
            assert_eq!(tree.usable_kib(root, 0).unwrap(), usable);
            assert_eq!(tree.allocated_kib(root, 0).unwrap(), allocated);
        }
    }

    fn fan_out(kind: DeviceLayerKind, size_kib: u64) -> LayerStackSpec {
        let mut s = spec(vec![kind, DeviceLayerKind::Storage], size_kib, "lvm");
        match kind {
            DeviceLayerKind::Drbd => s.volumes[0].meta_pool = Some("meta".into()),
            DeviceLayerKind::Writecache => s.writecache.cache_pool = Some("meta".into()),
            DeviceLayerKind::Cache => s.cache.cache_pool = Some("meta".into()),
            DeviceLayerKind::BCache => s.bcache.cache_pool = Some("meta".into()),
            _ => {}
        }
        s
    }

    #[test]
    fn test_round_trip_with_side_children() {
        let n = negotiator();
        let kinds = [
            DeviceLayerKind::Drbd,
            DeviceLayerKind::Writecache,
            DeviceLayerKind::Cache,
            DeviceLayerKind::BCache,
        ];
        for kind in kinds {
            for size in [10_000u64, GIB, 3 * GIB + 17] {
                let mut tree = build(&fan_out(kind, size));
                n.negotiate(&mut tree).unwrap();
                let root = tree.root();
                let data = tree.data_child(root).unwrap();
                let allocated = tree.allocated_kib(root, 0).unwrap();
                let data_kib = tree.usable_kib(data, 0).unwrap();

                n.ascend(&mut tree, root, 0).unwrap();
                let usable = tree.usable_kib(root, 0).unwrap();
                assert!(usable >= size, "{} size={} usable={}", kind, size, usable);
                assert!(usable < size + 4096, "{} size={} usable={}", kind, size, usable);
                assert_eq!(tree.allocated_kib(root, 0).unwrap(), allocated, "{}", kind);
                assert_eq!(tree.usable_kib(data, 0).unwrap(), data_kib, "{}", kind);

                // a second round trip is stable
                n.descend(&mut tree, root, 0).unwrap();
                assert_eq!(tree.allocated_kib(root, 0).unwrap(), allocated, "{}", kind);
                n.ascend(&mut tree, root, 0).unwrap();
                assert_eq!(tree.usable_kib(root, 0).unwrap(), usable, "{}", kind);
                assert_eq!(tree.allocated_kib(root, 0).unwrap(), allocated, "{}", kind);
            }
        }
    }

    #[test]
    fn test_ascend_leaves_room_for_external_metadata() {
        let n = negotiator();
        let mut tree = build(&fan_out(DeviceLayerKind::Drbd, GIB));
        n.negotiate(&mut tree).unwrap();
        let root = tree.root();
        let meta = tree.child_by_suffix(root, SUFFIX_DRBD_META).unwrap();
        let meta_kib = tree.usable_kib(meta, 0).unwrap();
        assert_eq!(tree.allocated_kib(root, 0).unwrap(), GIB + meta_kib);

        n.ascend(&mut tree, root, 0).unwrap();
        assert_eq!(tree.usable_kib(root, 0).unwrap(), GIB);
        assert_eq!(tree.usable_kib(meta, 0).unwrap(), meta_kib);
    }

    #[test]
    fn test_ascend_rejects_allocation_without_room_for_cache() {
        let mut tree = build(&fan_out(DeviceLayerKind::Writecache, GIB));
        let root = tree.root();
        tree.set_allocated(root, 0, 1).unwrap();
        let data = tree.data_child(root).unwrap();
        assert_matches!(
            negotiator().ascend(&mut tree, root, 0),
            Err(Error::MinSize { size_kib: 1 })
        );
        assert_eq!(tree.allocated_size(data, 0).unwrap(), Size::Uninitialized);
    }

    #[test]
    fn test_invalid_peers_rejected_before_children() {
        for peers in [0u16, 32] {
            let s = spec(vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage], GIB, "fine");
            let mut tree = build(&s);
            drbd_params_mut(&mut tree).peer_slots = peers;
            let root = tree.root();
            let data = tree.data_child(root).unwrap();

            let err = negotiator().descend(&mut tree, root, 0).unwrap_err();
            assert_matches!(err, Error::PeerCount { .. });
            assert_eq!(tree.usable_size(data, 0).unwrap(), Size::Uninitialized);

            tree.set_allocated(root, 0, GIB).unwrap();
            let err = negotiator().ascend(&mut tree, root, 0).unwrap_err();
            assert_matches!(err, Error::PeerCount { .. });
            assert_eq!(tree.allocated_size(data, 0).unwrap(), Size::Uninitialized);
        }
    }

    #[test]
    fn test_al_stripes_rejected() {
        let mut s = spec(vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage], GIB, "fine");
        s.drbd.al_stripes = Some(0);
        let mut tree = build(&s);
        assert_matches!(
            negotiator().negotiate(&mut tree),
            Err(Error::AlStripes { stripes: 0 })
        );
    }

    #[test]
    fn test_diskless_short_circuit() {
        for requested in [1u64, GIB, 1 << 39] {
            let mut s = spec(vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage], requested, "fine");
            s.drbd.diskless = true;
            let mut tree = build(&s);
            negotiator().negotiate(&mut tree).unwrap();
            let root = tree.root();
            assert_eq!(tree.usable_kib(root, 0).unwrap(), UNBOUNDED_KIB);
            assert_eq!(tree.allocated_kib(root, 0).unwrap(), 0);
            let child = tree.data_child(root).unwrap();
            assert_eq!(tree.usable_size(child, 0).unwrap(), Size::Uninitialized);
        }
    }

    #[test]
    fn test_skip_disk_short_circuit_ignores_bad_parameters() {
        let mut s = spec(vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage], GIB, "fine");
        s.drbd.skip_disk = true;
        let mut tree = build(&s);
        drbd_params_mut(&mut tree).peer_slots = 0;
        negotiator().negotiate(&mut tree).unwrap();
        assert_eq!(tree.usable_kib(tree.root(), 0).unwrap(), UNBOUNDED_KIB);
    }

    #[test]
    fn test_external_metadata_follows_rounded_data_size() {
        let size = 100 * GIB;
        let meta_size = |pool: &str| {
            let mut s = spec(vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage], size, pool);
            s.volumes[0].meta_pool = Some("meta".into());
            let mut tree = build(&s);
            negotiator().negotiate(&mut tree).unwrap();
            let root = tree.root();
            let data = tree.data_child(root).unwrap();
            let meta = tree.child_by_suffix(root, SUFFIX_DRBD_META).unwrap();
            let data_kib = tree.usable_kib(data, 0).unwrap();
            let meta_kib = tree.usable_kib(meta, 0).unwrap();
            assert_eq!(tree.allocated_kib(root, 0).unwrap(), data_kib + meta_kib);
            (data_kib, meta_kib)
        };

        let (exact_data, exact_meta) = meta_size("fine");
        let (rounded_data, rounded_meta) = meta_size("coarse");
        assert_eq!(exact_data, size);
        assert_eq!(rounded_data, 128 * GIB);
        assert!(rounded_meta > exact_meta);

        let md = MdLayout::new(7, 1, 32);
        assert_eq!(rounded_meta, md.external_md_size(rounded_data).unwrap());
        assert_ne!(rounded_meta, md.external_md_size(size).unwrap());
    }

    #[test]
    fn test_luks_header_and_inverse() {
        let n = negotiator();
        let s = spec(vec![DeviceLayerKind::Luks, DeviceLayerKind::Storage], GIB, "fine");
        let mut tree = build(&s);
        n.negotiate(&mut tree).unwrap();
        let root = tree.root();
        assert_eq!(tree.allocated_kib(root, 0).unwrap(), GIB + 16384);

        n.ascend(&mut tree, root, 0).unwrap();
        assert_eq!(tree.usable_kib(root, 0).unwrap(), GIB);

        tree.set_allocated(root, 0, 16384).unwrap();
        assert_matches!(n.ascend(&mut tree, root, 0), Err(Error::MinSize { .. }));
    }

    #[test]
    fn test_writecache_percentage() {
        let mut s = spec(vec![DeviceLayerKind::Writecache, DeviceLayerKind::Storage], GIB, "fine");
        s.writecache.cache_pool = Some("meta".into());
        let mut tree = build(&s);
        negotiator().negotiate(&mut tree).unwrap();
        let root = tree.root();
        let cache = tree.child_by_suffix(root, SUFFIX_WRITECACHE_CACHE).unwrap();
        // 5% of 1 GiB rounded up to the 4 KiB meta pool granularity
        assert_eq!(tree.usable_kib(cache, 0).unwrap(), 52432);
        assert_eq!(tree.allocated_kib(root, 0).unwrap(), GIB + 52432);
    }

    #[test]
    fn test_invalid_cache_percentage_rejected() {
        for pct in [0u32, 101] {
            let mut s = spec(vec![DeviceLayerKind::Cache, DeviceLayerKind::Storage], GIB, "fine");
            s.cache.cache_pool = Some("meta".into());
            s.cache.cache_size = Some(CacheSize::Percent(pct));
            let mut tree = build(&s);
            assert_matches!(
                negotiator().negotiate(&mut tree),
                Err(Error::InvalidLayerParameter { .. })
            );
            let data = tree.data_child(tree.root()).unwrap();
            assert_eq!(tree.usable_size(data, 0).unwrap(), Size::Uninitialized);
        }
    }

    #[test]
    fn test_cache_metadata_child() {
        let mut s = spec(vec![DeviceLayerKind::Cache, DeviceLayerKind::Storage], GIB, "fine");
        s.cache.cache_pool = Some("fine".into());
        s.cache.cache_size = Some(CacheSize::Kib(4096));
        let mut tree = build(&s);
        negotiator().negotiate(&mut tree).unwrap();
        let root = tree.root();
        let meta = tree.child_by_suffix(root, SUFFIX_CACHE_META).unwrap();
        assert_eq!(tree.usable_kib(meta, 0).unwrap(), 12288);
        assert_eq!(tree.allocated_kib(root, 0).unwrap(), GIB + 4096 + 12288);
    }

    #[test]
    fn test_bcache_superblock() {
        let s = spec(vec![DeviceLayerKind::BCache, DeviceLayerKind::Storage], GIB, "fine");
        let mut tree = build(&s);
        negotiator().negotiate(&mut tree).unwrap();
        assert_eq!(tree.allocated_kib(tree.root(), 0).unwrap(), GIB + 8);
    }

    #[test]
    fn test_nvme_target_and_initiator() {
        let n = negotiator();
        let s = spec(vec![DeviceLayerKind::Nvme, DeviceLayerKind::Storage], GIB + 1, "lvm");
        let mut tree = build(&s);
        n.negotiate(&mut tree).unwrap();
        assert_eq!(tree.allocated_kib(tree.root(), 0).unwrap(), GIB + 4096);

        let mut s = spec(vec![DeviceLayerKind::Nvme, DeviceLayerKind::Storage], GIB, "lvm");
        s.nvme.role = NvmeRole::Initiator;
        s.nvme.address = Some("10.0.0.1".into());
        let mut tree = build(&s);
        n.negotiate(&mut tree).unwrap();
        assert_eq!(tree.usable_kib(tree.root(), 0).unwrap(), UNBOUNDED_KIB);
        assert_eq!(tree.allocated_kib(tree.root(), 0).unwrap(), 0);
    }

    #[test]
    fn test_missing_root_size_is_reported() {
        let s = spec(vec![DeviceLayerKind::Luks, DeviceLayerKind::Storage], GIB, "fine");
        let mut tree = build(&s);
        let data = tree.data_child(tree.root()).unwrap();
        assert_matches!(
            negotiator().descend(&mut tree, data, 0),
            Err(Error::UninitializedSize { field: "usable", .. })
        );
    }
}
