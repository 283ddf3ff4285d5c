//! BCache Layer
//!
//! bcache backing device on the data child, optionally attached to a cache
//! set on the `.bcache` child. Devices are controlled through sysfs and
//! found again by the label written after registration.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::exec::{CommandRunnerRef, ExtCommand};
use crate::kinds::{DeviceLayerKind, SUFFIX_BCACHE_CACHE, SUFFIX_DATA};
use crate::layers::{
    child_device, is_snapshot, volume_identifier, write_control, DeviceLayer,
    LayerProcessResult, LayerServices,
};
use crate::tree::layer_tree::LayerTree;
use crate::tree::node::{LayerNode, LayerNodeId};
use crate::tree::volume::VolumeNumber;

const REGISTER_POLL_ATTEMPTS: u32 = 5;
const REGISTER_POLL_INTERVAL: Duration = Duration::from_millis(100);
const NULL_UUID: &str = "00000000-0000-0000-0000-000000000000";

/// Identity read from a bcache superblock
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Superblock {
    dev_uuid: Option<String>,
    cset_uuid: Option<String>,
}

/// Registered bcache devices found in sysfs
#[derive(Debug, Default)]
struct Registered {
    /// label -> `bcacheN`
    by_label: HashMap<String, String>,
    /// backing device uuid -> `bcacheN`
    by_uuid: HashMap<String, String>,
}

pub struct BCacheLayer {
    runner: CommandRunnerRef,
    sysfs_root: PathBuf,
    dry_run: bool,
    registered: Mutex<Registered>,
}

impl BCacheLayer {
    pub fn new(services: &LayerServices) -> Self {
        Self {
            runner: services.runner.clone(),
            sysfs_root: services.config.sysfs_root.clone(),
            dry_run: services.dry_run,
            registered: Mutex::new(Registered::default()),
        }
    }

    fn storage_err(reason: String) -> Error {
        Error::Storage {
            layer: DeviceLayerKind::BCache.tag().to_string(),
            reason,
        }
    }

    fn control_dir(&self, ident: &str) -> PathBuf {
        self.sysfs_root.join("block").join(ident).join("bcache")
    }

    fn register_file(&self) -> PathBuf {
        self.sysfs_root.join("fs/bcache/register")
    }

    fn cache_set_dir(&self, cset: &str) -> PathBuf {
        self.sysfs_root.join("fs/bcache").join(cset)
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    async fn read_trimmed(path: &Path) -> Option<String> {
        tokio::fs::read_to_string(path)
            .await
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Scan `<sysfs>/block/bcache*` for registered backing devices
    async fn scan(&self) -> Result<Registered> {
        let mut found = Registered::default();
        let block = self.sysfs_root.join("block");
        let mut entries = match tokio::fs::read_dir(&block).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let ident = entry.file_name().to_string_lossy().to_string();
            if !ident.starts_with("bcache") {
                continue;
            }
            let control = self.control_dir(&ident);
            if let Some(label) = Self::read_trimmed(&control.join("label")).await {
                found.by_label.insert(label, ident.clone());
            }
            if let Some(uuid) = Self::read_trimmed(&control.join("backing_dev_uuid")).await {
                found.by_uuid.insert(uuid, ident);
            }
        }
        Ok(found)
    }

    /// Parse `bcache-super-show` or `make-bcache` output
    fn parse_superblock(stdout: &str) -> Superblock {
        let mut sb = Superblock::default();
        for line in stdout.lines() {
            let line = line.trim();
            let (key, value) = match line.split_once(|c: char| c == ':' || c.is_whitespace()) {
                Some((key, value)) => (key.trim(), value.trim_start_matches(':').trim()),
                None => continue,
            };
            let value = value.to_string();
            match key {
                "dev.uuid" | "UUID" => sb.dev_uuid = Some(value),
                "cset.uuid" => sb.cset_uuid = Some(value),
                "Set" => {
                    if let Some(uuid) = value.strip_prefix("UUID:") {
                        sb.cset_uuid = Some(uuid.trim().to_string());
                    }
                }
                _ => {}
            }
        }
        sb
    }

    async fn read_superblock(&self, device: &str) -> Result<Option<Superblock>> {
        let output = self
            .runner
            .run(&ExtCommand::new("bcache-super-show").arg(device))
            .await?;
        if !output.success() {
            return Ok(None);
        }
        let sb = Self::parse_superblock(&output.stdout);
        Ok(sb.dev_uuid.is_some().then_some(sb))
    }

    async fn make_bcache(&self, flag: &str, device: &str) -> Result<Superblock> {
        let output = self
            .runner
            .run_checked(&ExtCommand::new("make-bcache").args([flag, device]))
            .await?;
        info!(device, flag, "Created bcache superblock");
        Ok(Self::parse_superblock(&output.stdout))
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Register the backing device if needed and return its `bcacheN`
    async fn register_backing(&self, data_dev: &str, dev_uuid: &str) -> Result<String> {
        let rescanned = self.scan().await?;
        if let Some(ident) = rescanned.by_uuid.get(dev_uuid) {
            return Ok(ident.clone());
        }
        write_control(self.dry_run, &self.register_file(), data_dev).await?;
        for _ in 0..REGISTER_POLL_ATTEMPTS {
            tokio::time::sleep(REGISTER_POLL_INTERVAL).await;
            if let Some(ident) = self.scan().await?.by_uuid.remove(dev_uuid) {
                return Ok(ident);
            }
        }
        Err(Self::storage_err(format!(
            "backing device {} was not registered within {:?}",
            data_dev,
            REGISTER_POLL_INTERVAL * REGISTER_POLL_ATTEMPTS
        )))
    }

    /// Format and register the cache device if needed, returning its set uuid
    async fn ensure_cache_set(&self, cache_dev: &str) -> Result<String> {
        let sb = match self.read_superblock(cache_dev).await? {
            Some(sb) => sb,
            None => self.make_bcache("-C", cache_dev).await?,
        };
        let cset = sb.cset_uuid.ok_or_else(|| {
            Self::storage_err(format!("no cache set uuid found on {}", cache_dev))
        })?;
        if !tokio::fs::try_exists(self.cache_set_dir(&cset)).await? {
            write_control(self.dry_run, &self.register_file(), cache_dev).await?;
        }
        Ok(cset)
    }

    async fn create(
        &self,
        tree: &LayerTree,
        node: LayerNodeId,
        vlm: VolumeNumber,
        name: &str,
    ) -> Result<String> {
        let data_dev = child_device(tree, node, SUFFIX_DATA, vlm)?;
        let backing = match self.read_superblock(&data_dev).await? {
            Some(sb) => sb,
            None => self.make_bcache("-B", &data_dev).await?,
        };
        let dev_uuid = backing.dev_uuid.clone().ok_or_else(|| {
            Self::storage_err(format!("no backing device uuid found on {}", data_dev))
        })?;
        let ident = self.register_backing(&data_dev, &dev_uuid).await?;

        if tree.child_by_suffix(node, SUFFIX_BCACHE_CACHE).is_some() {
            let cache_dev = child_device(tree, node, SUFFIX_BCACHE_CACHE, vlm)?;
            let cset = self.ensure_cache_set(&cache_dev).await?;
            let attached = backing
                .cset_uuid
                .as_deref()
                .is_some_and(|c| c == cset && c != NULL_UUID);
            if !attached {
                write_control(self.dry_run, &self.control_dir(&ident).join("attach"), &cset)
                    .await?;
                debug!(device = %ident, cache_set = %cset, "Attached cache set");
            }
        }

        write_control(self.dry_run, &self.control_dir(&ident).join("label"), name).await?;
        info!(device = %ident, data = %data_dev, "Created bcache device");
        Ok(ident)
    }

    // =========================================================================
    // Removal
    // =========================================================================

    async fn stop(&self, ident: &str) -> Result<()> {
        let control = self.control_dir(ident);
        let cache_set = tokio::fs::read_link(control.join("cache"))
            .await
            .ok()
            .and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()));

        write_control(self.dry_run, &control.join("stop"), "1").await?;
        if let Some(cset) = cache_set {
            write_control(self.dry_run, &self.cache_set_dir(&cset).join("stop"), "1").await?;
        }
        info!(device = %ident, "Stopped bcache device");
        Ok(())
    }
}

#[async_trait]
impl DeviceLayer for BCacheLayer {
    fn kind(&self) -> DeviceLayerKind {
        DeviceLayerKind::BCache
    }

    async fn prepare(&self, nodes: &[&LayerNode]) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let found = self.scan().await?;
        debug!(devices = found.by_uuid.len(), "Scanned bcache devices");
        *self.registered.lock() = found;
        Ok(())
    }

    async fn process(&self, tree: &mut LayerTree, node: LayerNodeId) -> Result<LayerProcessResult> {
        if is_snapshot(tree) {
            return Ok(LayerProcessResult::NoDevicesProvided);
        }
        let volumes = tree.node(node)?.volume_numbers();

        for vlm in volumes {
            let name = volume_identifier(tree.node(node)?, vlm);
            let existing = self.registered.lock().by_label.get(&name).cloned();

            if tree.is_deleting() {
                match existing {
                    Some(ident) => {
                        self.stop(&ident).await?;
                        self.registered.lock().by_label.remove(&name);
                    }
                    None => warn!(device = %name, "No registered bcache device to remove"),
                }
                tree.volume_mut(node, vlm)?.set_device(None, false);
                continue;
            }

            let ident = match existing {
                Some(ident) => ident,
                None => {
                    let ident = self.create(tree, node, vlm, &name).await?;
                    self.registered
                        .lock()
                        .by_label
                        .insert(name.clone(), ident.clone());
                    ident
                }
            };
            tree.volume_mut(node, vlm)?
                .set_device(Some(format!("/dev/{}", ident)), true);
        }
        Ok(LayerProcessResult::Success)
    }

    fn clear_cache(&self) {
        *self.registered.lock() = Registered::default();
    }
}
