//! LUKS Layer
//!
//! dm-crypt on top of the data child. The volume is formatted once, then
//! opened under its volume identifier; key material comes from the key
//! provider and is only ever passed on stdin.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::domain::KeyProviderRef;
use crate::error::{Error, Result};
use crate::exec::{CommandRunnerRef, ExtCommand};
use crate::kinds::{DeviceLayerKind, SUFFIX_DATA};
use crate::layers::{
    child_device, dmsetup, is_snapshot, volume_identifier, DeviceLayer, LayerProcessResult,
    LayerServices,
};
use crate::tree::layer_tree::LayerTree;
use crate::tree::node::{LayerNode, LayerNodeId, LayerPayload};

const TARGET: &str = "crypt";

pub struct LuksLayer {
    runner: CommandRunnerRef,
    keys: KeyProviderRef,
    /// Open crypt devices, filled by prepare
    open: Mutex<BTreeSet<String>>,
}

impl LuksLayer {
    pub fn new(services: &LayerServices) -> Self {
        Self {
            runner: services.runner.clone(),
            keys: services.keys.clone(),
            open: Mutex::new(BTreeSet::new()),
        }
    }

    fn key_ref(tree: &LayerTree, node: LayerNodeId) -> Result<String> {
        match tree.node(node)?.payload() {
            LayerPayload::Luks(params) => Ok(params.key_ref.clone()),
            other => Err(Error::Implementation(format!(
                "luks layer asked to process a {} node",
                other.kind()
            ))),
        }
    }

    async fn is_formatted(&self, data_dev: &str) -> Result<bool> {
        let output = self
            .runner
            .run(&ExtCommand::new("cryptsetup").args(["isLuks", data_dev]))
            .await?;
        Ok(output.success())
    }

    async fn format(&self, data_dev: &str, key: &[u8]) -> Result<()> {
        self.runner
            .run_checked(
                &ExtCommand::new("cryptsetup")
                    .args(["luksFormat", "--batch-mode", "--key-file", "-", data_dev])
                    .stdin(key.to_vec()),
            )
            .await?;
        Ok(())
    }

    async fn open_device(&self, data_dev: &str, name: &str, key: &[u8]) -> Result<()> {
        self.runner
            .run_checked(
                &ExtCommand::new("cryptsetup")
                    .args(["open", "--type", "luks", "--key-file", "-", data_dev, name])
                    .stdin(key.to_vec()),
            )
            .await?;
        Ok(())
    }

    async fn close_device(&self, name: &str) -> Result<()> {
        self.runner
            .run_checked(&ExtCommand::new("cryptsetup").args(["close", name]))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceLayer for LuksLayer {
    fn kind(&self) -> DeviceLayerKind {
        DeviceLayerKind::Luks
    }

    async fn prepare(&self, nodes: &[&LayerNode]) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let found = dmsetup::list(self.runner.as_ref(), TARGET).await?;
        debug!(devices = found.len(), "Listed open crypt devices");
        *self.open.lock() = found;
        Ok(())
    }

    async fn process(&self, tree: &mut LayerTree, node: LayerNodeId) -> Result<LayerProcessResult> {
        if is_snapshot(tree) {
            return Ok(LayerProcessResult::NoDevicesProvided);
        }
        let key_ref = Self::key_ref(tree, node)?;
        let volumes = tree.node(node)?.volume_numbers();

        for vlm in volumes {
            let name = volume_identifier(tree.node(node)?, vlm);
            let is_open = self.open.lock().contains(&name);

            if tree.is_deleting() {
                if is_open {
                    self.close_device(&name).await?;
                    self.open.lock().remove(&name);
                    info!(device = %name, "Closed crypt device");
                }
                tree.volume_mut(node, vlm)?.set_device(None, false);
                continue;
            }

            if !is_open {
                let data_dev = child_device(tree, node, SUFFIX_DATA, vlm)?;
                let key = self.keys.resolve_key(&key_ref).await?;
                if !self.is_formatted(&data_dev).await? {
                    self.format(&data_dev, &key).await?;
                    info!(device = %data_dev, "Formatted LUKS volume");
                }
                self.open_device(&data_dev, &name, &key).await?;
                self.open.lock().insert(name.clone());
                info!(device = %name, "Opened crypt device");
            }
            tree.volume_mut(node, vlm)?
                .set_device(Some(dmsetup::device_path(&name)), true);
        }
        Ok(LayerProcessResult::Success)
    }

    fn clear_cache(&self) {
        self.open.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SatelliteConfig;
    use crate::exec::scripted::ScriptedRunner;
    use crate::layers::testing::services;
    use crate::tree::node::{LuksParams, ResourceRef};
    use crate::tree::volume::VolumeLayerData;
    use std::sync::Arc;

    fn luks_tree(key_ref: &str) -> LayerTree {
        let mut tree = LayerTree::new(
            ResourceRef::resource("r0"),
            LayerPayload::Luks(LuksParams {
                key_ref: key_ref.into(),
            }),
            vec![VolumeLayerData::new(0, None)],
        );
        let root = tree.root();
        let data = tree
            .insert_child(root, SUFFIX_DATA, LayerPayload::Storage, vec![VolumeLayerData::new(0, None)])
            .unwrap();
        tree.volume_mut(data, 0)
            .unwrap()
            .set_device(Some("/dev/vg0/r0_00000".into()), true);
        tree
    }

    #[tokio::test]
    async fn test_formats_unformatted_volume() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("cryptsetup isLuks", 1, "");
        let layer = LuksLayer::new(&services(runner.clone(), SatelliteConfig::default()));
        let mut tree = luks_tree("master");
        let root = tree.root();
        layer.prepare(&[tree.node(root).unwrap()]).await.unwrap();
        layer.process(&mut tree, root).await.unwrap();

        assert_eq!(
            runner.commands(),
            vec![
                "dmsetup ls --target crypt",
                "cryptsetup isLuks /dev/vg0/r0_00000",
                "cryptsetup luksFormat --batch-mode --key-file - /dev/vg0/r0_00000",
                "cryptsetup open --type luks --key-file - /dev/vg0/r0_00000 r0_00000",
            ]
        );
        let issued = runner.issued();
        assert_eq!(issued[3].stdin.as_deref(), Some(&b"0123456789abcdef"[..]));
        assert_eq!(tree.device_path(root, 0).as_deref(), Some("/dev/mapper/r0_00000"));
    }

    #[tokio::test]
    async fn test_formatted_volume_is_only_opened() {
        let runner = Arc::new(ScriptedRunner::new());
        let layer = LuksLayer::new(&services(runner.clone(), SatelliteConfig::default()));
        let mut tree = luks_tree("master");
        let root = tree.root();
        layer.process(&mut tree, root).await.unwrap();
        assert_eq!(runner.count("cryptsetup luksFormat"), 0);
        assert_eq!(runner.count("cryptsetup open"), 1);
    }

    #[tokio::test]
    async fn test_unknown_key_is_access_denied() {
        let runner = Arc::new(ScriptedRunner::new());
        let layer = LuksLayer::new(&services(runner.clone(), SatelliteConfig::default()));
        let mut tree = luks_tree("missing");
        let root = tree.root();
        let err = layer.process(&mut tree, root).await.unwrap_err();
        assert!(matches!(err, Error::AccessDenied { .. }));
        assert_eq!(runner.count("cryptsetup"), 0);
    }

    #[tokio::test]
    async fn test_delete_closes_open_device() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("dmsetup ls", "r0_00000\t(253:3)\n");
        let layer = LuksLayer::new(&services(runner.clone(), SatelliteConfig::default()));
        let mut tree = luks_tree("master");
        tree.set_deleting(true);
        let root = tree.root();
        layer.prepare(&[tree.node(root).unwrap()]).await.unwrap();
        layer.process(&mut tree, root).await.unwrap();

        assert_eq!(runner.count("cryptsetup close r0_00000"), 1);
        assert!(tree.device_path(root, 0).is_none());
    }

    #[tokio::test]
    async fn test_suspend_is_unsupported() {
        let runner = Arc::new(ScriptedRunner::new());
        let layer = LuksLayer::new(&services(runner, SatelliteConfig::default()));
        let tree = luks_tree("master");
        assert!(!layer.supports_suspend_io());
        let err = layer.suspend_io(&tree, tree.root()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidLayerParameter { .. }));
    }
}
