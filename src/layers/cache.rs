//! Cache Layer
//!
//! dm-cache with its cache device on the `.dcache` child and its metadata
//! device on the `.dmeta` child.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use tracing::info;

use crate::error::{Error, Result};
use crate::exec::CommandRunnerRef;
use crate::kinds::{DeviceLayerKind, SUFFIX_CACHE_CACHE, SUFFIX_CACHE_META, SUFFIX_DATA};
use crate::layers::{
    child_device, dmsetup, is_snapshot, volume_identifier, DeviceLayer, LayerProcessResult,
    LayerServices,
};
use crate::tree::layer_tree::LayerTree;
use crate::tree::node::{CacheParams, LayerNode, LayerNodeId, LayerPayload};

const TARGET: &str = "cache";

pub struct CacheLayer {
    runner: CommandRunnerRef,
    existing: Mutex<BTreeSet<String>>,
}

impl CacheLayer {
    pub fn new(services: &LayerServices) -> Self {
        Self {
            runner: services.runner.clone(),
            existing: Mutex::new(BTreeSet::new()),
        }
    }

    fn params(tree: &LayerTree, node: LayerNodeId) -> Result<CacheParams> {
        match tree.node(node)?.payload() {
            LayerPayload::Cache(params) => Ok(params.clone()),
            other => Err(Error::Implementation(format!(
                "cache layer asked to process a {} node",
                other.kind()
            ))),
        }
    }

    /// `0 <sectors> cache <meta> <cache> <data> <block sectors> 1 <feature> <policy> 0`
    fn table(
        params: &CacheParams,
        data_kib: u64,
        data_dev: &str,
        cache_dev: &str,
        meta_dev: &str,
    ) -> String {
        format!(
            "0 {} cache {} {} {} {} 1 {} {} 0",
            dmsetup::sectors(data_kib),
            meta_dev,
            cache_dev,
            data_dev,
            dmsetup::sectors(params.block_size_kib),
            params.feature,
            params.policy
        )
    }
}

#[async_trait]
impl DeviceLayer for CacheLayer {
    fn kind(&self) -> DeviceLayerKind {
        DeviceLayerKind::Cache
    }

    async fn prepare(&self, nodes: &[&LayerNode]) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let found = dmsetup::list(self.runner.as_ref(), TARGET).await?;
        *self.existing.lock() = found;
        Ok(())
    }

    async fn process(&self, tree: &mut LayerTree, node: LayerNodeId) -> Result<LayerProcessResult> {
        if is_snapshot(tree) {
            return Ok(LayerProcessResult::NoDevicesProvided);
        }
        let params = Self::params(tree, node)?;
        let volumes = tree.node(node)?.volume_numbers();

        for vlm in volumes {
            let name = volume_identifier(tree.node(node)?, vlm);
            let exists = self.existing.lock().contains(&name);

            if tree.is_deleting() {
                if exists {
                    dmsetup::remove(self.runner.as_ref(), &name).await?;
                    self.existing.lock().remove(&name);
                    info!(device = %name, "Removed cache device");
                }
                tree.volume_mut(node, vlm)?.set_device(None, false);
                continue;
            }

            if !exists {
                let data_dev = child_device(tree, node, SUFFIX_DATA, vlm)?;
                let cache_dev = child_device(tree, node, SUFFIX_CACHE_CACHE, vlm)?;
                let meta_dev = child_device(tree, node, SUFFIX_CACHE_META, vlm)?;
                let data_child = tree.data_child(node).ok_or_else(|| {
                    Error::Implementation(format!("cache node {} has no data child", node))
                })?;
                let data_kib = tree.usable_kib(data_child, vlm)?;
                let table = Self::table(&params, data_kib, &data_dev, &cache_dev, &meta_dev);
                dmsetup::create(self.runner.as_ref(), &name, &table).await?;
                self.existing.lock().insert(name.clone());
                info!(device = %name, policy = %params.policy, "Created cache device");
            }
            tree.volume_mut(node, vlm)?
                .set_device(Some(dmsetup::device_path(&name)), true);
        }
        Ok(LayerProcessResult::Success)
    }

    fn clear_cache(&self) {
        self.existing.lock().clear();
    }

    async fn suspend_io(&self, tree: &LayerTree, node: LayerNodeId) -> Result<()> {
        for vlm in tree.node(node)?.volumes() {
            if let Some(device) = vlm.device_path() {
                dmsetup::suspend(self.runner.as_ref(), device).await?;
            }
        }
        Ok(())
    }

    async fn resume_io(&self, tree: &LayerTree, node: LayerNodeId) -> Result<()> {
        for vlm in tree.node(node)?.volumes() {
            if let Some(device) = vlm.device_path() {
                dmsetup::resume(self.runner.as_ref(), device).await?;
            }
        }
        Ok(())
    }
}
