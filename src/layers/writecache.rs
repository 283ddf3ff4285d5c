//! Writecache Layer
//!
//! dm-writecache in front of the data device, with the cache device
//! provided by the `.wcache` child.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use tracing::info;

use crate::error::{Error, Result};
use crate::exec::CommandRunnerRef;
use crate::kinds::{DeviceLayerKind, SUFFIX_DATA, SUFFIX_WRITECACHE_CACHE};
use crate::layers::{
    child_device, dmsetup, is_snapshot, volume_identifier, DeviceLayer, LayerProcessResult,
    LayerServices,
};
use crate::tree::layer_tree::LayerTree;
use crate::tree::node::{LayerNode, LayerNodeId, LayerPayload, WritecacheParams};

const TARGET: &str = "writecache";

pub struct WritecacheLayer {
    runner: CommandRunnerRef,
    existing: Mutex<BTreeSet<String>>,
}

impl WritecacheLayer {
    pub fn new(services: &LayerServices) -> Self {
        Self {
            runner: services.runner.clone(),
            existing: Mutex::new(BTreeSet::new()),
        }
    }

    fn params(tree: &LayerTree, node: LayerNodeId) -> Result<WritecacheParams> {
        match tree.node(node)?.payload() {
            LayerPayload::Writecache(params) => Ok(params.clone()),
            other => Err(Error::Implementation(format!(
                "writecache layer asked to process a {} node",
                other.kind()
            ))),
        }
    }

    /// `0 <sectors> writecache <p|s> <data> <cache> <block size> 0`
    fn table(
        params: &WritecacheParams,
        data_kib: u64,
        data_dev: &str,
        cache_dev: &str,
    ) -> String {
        format!(
            "0 {} writecache {} {} {} {} 0",
            dmsetup::sectors(data_kib),
            if params.pmem { "p" } else { "s" },
            data_dev,
            cache_dev,
            params.block_size_bytes
        )
    }
}

#[async_trait]
impl DeviceLayer for WritecacheLayer {
    fn kind(&self) -> DeviceLayerKind {
        DeviceLayerKind::Writecache
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
        let data_child = tree.data_child(node);
        let volumes = tree.node(node)?.volume_numbers();

        for vlm in volumes {
            let name = volume_identifier(tree.node(node)?, vlm);
            let exists = self.existing.lock().contains(&name);

            if tree.is_deleting() {
                if exists {
                    // write back dirty blocks before the table goes away
                    dmsetup::message(self.runner.as_ref(), &name, "flush").await?;
                    dmsetup::remove(self.runner.as_ref(), &name).await?;
                    self.existing.lock().remove(&name);
                    info!(device = %name, "Removed writecache device");
                }
                tree.volume_mut(node, vlm)?.set_device(None, false);
                continue;
            }

            if !exists {
                let data_dev = child_device(tree, node, SUFFIX_DATA, vlm)?;
                let cache_dev = child_device(tree, node, SUFFIX_WRITECACHE_CACHE, vlm)?;
                let data_child = data_child.ok_or_else(|| {
                    Error::Implementation(format!("writecache node {} has no data child", node))
                })?;
                let data_kib = tree.usable_kib(data_child, vlm)?;
                let table = Self::table(&params, data_kib, &data_dev, &cache_dev);
                dmsetup::create(self.runner.as_ref(), &name, &table).await?;
                self.existing.lock().insert(name.clone());
                info!(device = %name, data = %data_dev, cache = %cache_dev, "Created writecache device");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SatelliteConfig;
    use crate::exec::scripted::ScriptedRunner;
    use crate::layers::testing::services;
    use crate::tree::node::ResourceRef;
    use crate::tree::spec::CacheSize;
    use crate::tree::volume::VolumeLayerData;
    use std::sync::Arc;

    fn writecache_tree() -> LayerTree {
        let mut tree = LayerTree::new(
            ResourceRef::resource("r0"),
            LayerPayload::Writecache(WritecacheParams {
                cache_size: CacheSize::Percent(5),
                block_size_bytes: 4096,
                pmem: false,
            }),
            vec![VolumeLayerData::new(0, None)],
        );
        let root = tree.root();
        let data = tree
            .insert_child(root, SUFFIX_DATA, LayerPayload::Storage, vec![VolumeLayerData::new(0, None)])
            .unwrap();
        let cache = tree
            .insert_child(
                root,
                SUFFIX_WRITECACHE_CACHE,
                LayerPayload::Storage,
                vec![VolumeLayerData::new(0, None)],
            )
            .unwrap();
        tree.set_usable(data, 0, 1048576).unwrap();
        tree.volume_mut(data, 0)
            .unwrap()
            .set_device(Some("/dev/vg0/r0_00000".into()), true);
        tree.volume_mut(cache, 0)
            .unwrap()
            .set_device(Some("/dev/nvme/r0.wcache_00000".into()), true);
        tree
    }

    #[tokio::test]
    async fn test_creates_writecache_table() {
        let runner = Arc::new(ScriptedRunner::new());
        let layer = WritecacheLayer::new(&services(runner.clone(), SatelliteConfig::default()));
        let mut tree = writecache_tree();
        let root = tree.root();
        layer.prepare(&[tree.node(root).unwrap()]).await.unwrap();

        let result = layer.process(&mut tree, root).await.unwrap();
        assert_eq!(result, LayerProcessResult::Success);
        assert_eq!(
            runner.commands()[1],
            "dmsetup create r0_00000 --table \"0 2097152 writecache s /dev/vg0/r0_00000 /dev/nvme/r0.wcache_00000 4096 0\""
        );
        assert_eq!(tree.device_path(root, 0).as_deref(), Some("/dev/mapper/r0_00000"));
    }

    #[tokio::test]
    async fn test_existing_device_is_not_recreated() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("dmsetup ls", "r0_00000\t(253:7)\n");
        let layer = WritecacheLayer::new(&services(runner.clone(), SatelliteConfig::default()));
        let mut tree = writecache_tree();
        let root = tree.root();
        layer.prepare(&[tree.node(root).unwrap()]).await.unwrap();

        layer.process(&mut tree, root).await.unwrap();
        assert_eq!(runner.count("dmsetup create"), 0);
        assert!(tree.volume(root, 0).unwrap().exists());
    }

    #[tokio::test]
    async fn test_delete_flushes_then_removes() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("dmsetup ls", "r0_00000\t(253:7)\n");
        let layer = WritecacheLayer::new(&services(runner.clone(), SatelliteConfig::default()));
        let mut tree = writecache_tree();
        tree.set_deleting(true);
        let root = tree.root();
        layer.prepare(&[tree.node(root).unwrap()]).await.unwrap();

        layer.process(&mut tree, root).await.unwrap();
        assert_eq!(
            &runner.commands()[1..],
            &[
                "dmsetup message r0_00000 0 flush".to_string(),
                "dmsetup remove --retry r0_00000".to_string(),
            ]
        );
        assert!(!tree.volume(root, 0).unwrap().exists());
    }

    #[tokio::test]
    async fn test_missing_cache_device_aborts() {
        let runner = Arc::new(ScriptedRunner::new());
        let layer = WritecacheLayer::new(&services(runner.clone(), SatelliteConfig::default()));
        let mut tree = writecache_tree();
        let root = tree.root();
        let cache = tree.child_by_suffix(root, SUFFIX_WRITECACHE_CACHE).unwrap();
        tree.volume_mut(cache, 0).unwrap().set_device(None, false);

        let err = layer.process(&mut tree, root).await.unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
        assert_eq!(runner.count("dmsetup create"), 0);
    }

    #[tokio::test]
    async fn test_suspend_and_resume() {
        let runner = Arc::new(ScriptedRunner::new());
        let layer = WritecacheLayer::new(&services(runner.clone(), SatelliteConfig::default()));
        let mut tree = writecache_tree();
        let root = tree.root();
        layer.process(&mut tree, root).await.unwrap();

        assert!(layer.supports_suspend_io());
        layer.suspend_io(&tree, root).await.unwrap();
        layer.resume_io(&tree, root).await.unwrap();
        assert_eq!(runner.count("dmsetup suspend /dev/mapper/r0_00000"), 1);
        assert_eq!(runner.count("dmsetup resume /dev/mapper/r0_00000"), 1);
    }
}
