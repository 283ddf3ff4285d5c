//! NVMe-oF Layer
//!
//! A target exports its data child through the nvmet configfs tree; an
//! initiator connects to the remote subsystem with `nvme connect` and finds
//! its namespaces through the fabrics controllers in sysfs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::exec::{CommandRunnerRef, ExtCommand};
use crate::kinds::{DeviceLayerKind, SUFFIX_DATA};
use crate::layers::{
    child_device, is_snapshot, write_control, DeviceLayer, LayerProcessResult, LayerServices,
};
use crate::tree::layer_tree::LayerTree;
use crate::tree::node::{LayerNode, LayerNodeId, LayerPayload, NvmeParams};
use crate::tree::spec::NvmeRole;
use crate::tree::volume::VolumeNumber;

/// Prefix of every subsystem name
pub const NQN_PREFIX: &str = "nqn.2018-02.io.layerstack:";

const CONNECT_POLL_ATTEMPTS: u32 = 5;
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct NvmeLayer {
    runner: CommandRunnerRef,
    nvmet_root: PathBuf,
    sysfs_root: PathBuf,
    host_nqn: String,
    dry_run: bool,
    /// subsystem nqn -> fabrics controller (`nvmeN`), filled by prepare
    controllers: Mutex<HashMap<String, String>>,
}

impl NvmeLayer {
    pub fn new(services: &LayerServices) -> Self {
        Self {
            runner: services.runner.clone(),
            nvmet_root: services.config.nvmet_root.clone(),
            sysfs_root: services.config.sysfs_root.clone(),
            host_nqn: services.config.node_name.clone(),
            dry_run: services.dry_run,
            controllers: Mutex::new(HashMap::new()),
        }
    }

    pub fn subsystem_nqn(node: &LayerNode) -> String {
        format!("{}{}", NQN_PREFIX, node.suffixed_name())
    }

    fn params(tree: &LayerTree, node: LayerNodeId) -> Result<NvmeParams> {
        match tree.node(node)?.payload() {
            LayerPayload::Nvme(params) => Ok(params.clone()),
            other => Err(Error::Implementation(format!(
                "nvme layer asked to process a {} node",
                other.kind()
            ))),
        }
    }

    fn storage_err(reason: String) -> Error {
        Error::Storage {
            layer: DeviceLayerKind::Nvme.tag().to_string(),
            reason,
        }
    }

    fn io_err(action: &str, path: &Path, e: std::io::Error) -> Error {
        Self::storage_err(format!("cannot {} {}: {}", action, path.display(), e))
    }

    fn namespace_id(vlm: VolumeNumber) -> u32 {
        vlm + 1
    }

    // =========================================================================
    // configfs helpers
    // =========================================================================

    async fn exists(path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn mkdir(&self, path: &Path) -> Result<()> {
        if self.dry_run {
            info!(path = %path.display(), "[dry-run] mkdir");
            return Ok(());
        }
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| Self::io_err("create", path, e))
    }

    async fn rmdir(&self, path: &Path) -> Result<()> {
        if self.dry_run {
            info!(path = %path.display(), "[dry-run] rmdir");
            return Ok(());
        }
        tokio::fs::remove_dir(path)
            .await
            .map_err(|e| Self::io_err("remove", path, e))
    }

    async fn read_attr(path: &Path) -> Option<String> {
        tokio::fs::read_to_string(path)
            .await
            .ok()
            .map(|s| s.trim().to_string())
    }

    // =========================================================================
    // Target
    // =========================================================================

    fn subsystem_dir(&self, nqn: &str) -> PathBuf {
        self.nvmet_root.join("subsystems").join(nqn)
    }

    fn ports_dir(&self) -> PathBuf {
        self.nvmet_root.join("ports")
    }

    /// Port indices present in configfs
    async fn port_indices(&self) -> Result<Vec<u32>> {
        let mut indices = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.ports_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(indices),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(idx) = entry.file_name().to_string_lossy().parse::<u32>() {
                indices.push(idx);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// Reuse the port listening on the same address, or create the next one
    async fn ensure_port(&self, params: &NvmeParams) -> Result<PathBuf> {
        let indices = self.port_indices().await?;
        let service = params.port.to_string();
        for idx in &indices {
            let dir = self.ports_dir().join(idx.to_string());
            let addr = Self::read_attr(&dir.join("addr_traddr")).await;
            let svc = Self::read_attr(&dir.join("addr_trsvcid")).await;
            if addr.as_deref() == Some(params.address.as_str()) && svc.as_deref() == Some(&service) {
                return Ok(dir);
            }
        }

        let idx = indices.last().map_or(1, |last| last + 1);
        let dir = self.ports_dir().join(idx.to_string());
        self.mkdir(&dir.join("subsystems")).await?;
        let family = if params.address.contains(':') { "ipv6" } else { "ipv4" };
        write_control(self.dry_run, &dir.join("addr_traddr"), &params.address).await?;
        write_control(self.dry_run, &dir.join("addr_trtype"), &params.transport.to_string()).await?;
        write_control(self.dry_run, &dir.join("addr_trsvcid"), &service).await?;
        write_control(self.dry_run, &dir.join("addr_adrfam"), family).await?;
        info!(port = idx, address = %params.address, service = %service, "Created nvmet port");
        Ok(dir)
    }

    async fn configure_target(
        &self,
        tree: &mut LayerTree,
        node: LayerNodeId,
        params: &NvmeParams,
    ) -> Result<()> {
        let nqn = Self::subsystem_nqn(tree.node(node)?);
        let subsystem = self.subsystem_dir(&nqn);
        if !Self::exists(&subsystem).await {
            self.mkdir(&subsystem).await?;
            write_control(self.dry_run, &subsystem.join("attr_allow_any_host"), "1").await?;
            info!(nqn = %nqn, "Created nvmet subsystem");
        }

        let volumes = tree.node(node)?.volume_numbers();
        for vlm in volumes {
            let data_dev = child_device(tree, node, SUFFIX_DATA, vlm)?;
            let namespace = subsystem
                .join("namespaces")
                .join(Self::namespace_id(vlm).to_string());
            if !Self::exists(&namespace).await {
                self.mkdir(&namespace).await?;
                write_control(self.dry_run, &namespace.join("device_path"), &data_dev).await?;
                write_control(self.dry_run, &namespace.join("enable"), "1").await?;
                debug!(nqn = %nqn, namespace = %namespace.display(), "Enabled namespace");
            }
            tree.volume_mut(node, vlm)?.set_device(Some(data_dev), true);
        }

        let port = self.ensure_port(params).await?;
        let link = port.join("subsystems").join(&nqn);
        if !Self::exists(&link).await {
            if self.dry_run {
                info!(link = %link.display(), "[dry-run] symlink");
            } else {
                tokio::fs::symlink(&subsystem, &link)
                    .await
                    .map_err(|e| Self::io_err("link", &link, e))?;
            }
        }
        Ok(())
    }

    async fn remove_target(&self, tree: &mut LayerTree, node: LayerNodeId) -> Result<()> {
        let nqn = Self::subsystem_nqn(tree.node(node)?);
        let subsystem = self.subsystem_dir(&nqn);
        let volumes = tree.node(node)?.volume_numbers();

        if Self::exists(&subsystem).await {
            for idx in self.port_indices().await? {
                let link = self.ports_dir().join(idx.to_string()).join("subsystems").join(&nqn);
                if tokio::fs::symlink_metadata(&link).await.is_ok() {
                    if self.dry_run {
                        info!(link = %link.display(), "[dry-run] unlink");
                    } else {
                        tokio::fs::remove_file(&link)
                            .await
                            .map_err(|e| Self::io_err("unlink", &link, e))?;
                    }
                }
            }
            for vlm in &volumes {
                let namespace = subsystem
                    .join("namespaces")
                    .join(Self::namespace_id(*vlm).to_string());
                if Self::exists(&namespace).await {
                    write_control(self.dry_run, &namespace.join("enable"), "0").await?;
                    self.rmdir(&namespace).await?;
                }
            }
            self.rmdir(&subsystem).await?;
            info!(nqn = %nqn, "Removed nvmet subsystem");
        }
        for vlm in volumes {
            tree.volume_mut(node, vlm)?.set_device(None, false);
        }
        Ok(())
    }

    // =========================================================================
    // Initiator
    // =========================================================================

    /// Map subsystem nqn -> controller from `<sysfs>/class/nvme-fabrics/ctl`
    async fn scan_controllers(&self) -> Result<HashMap<String, String>> {
        let mut found = HashMap::new();
        let ctl_dir = self.sysfs_root.join("class/nvme-fabrics/ctl");
        let mut entries = match tokio::fs::read_dir(&ctl_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let ctl = entry.file_name().to_string_lossy().to_string();
            if let Some(nqn) = Self::read_attr(&ctl_dir.join(&ctl).join("subsysnqn")).await {
                found.insert(nqn, ctl);
            }
        }
        Ok(found)
    }

    async fn connect(&self, nqn: &str, params: &NvmeParams) -> Result<String> {
        self.runner
            .run_checked(&ExtCommand::new("nvme").args([
                "connect".to_string(),
                format!("--transport={}", params.transport),
                format!("--nqn={}", nqn),
                format!("--traddr={}", params.address),
                format!("--trsvcid={}", params.port),
                format!("--hostnqn={}", self.host_nqn),
            ]))
            .await?;
        for _ in 0..CONNECT_POLL_ATTEMPTS {
            if let Some(ctl) = self.scan_controllers().await?.remove(nqn) {
                info!(nqn, controller = %ctl, "Connected to nvme target");
                return Ok(ctl);
            }
            tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
        }
        Err(Self::storage_err(format!(
            "no fabrics controller showed up for {} after connecting",
            nqn
        )))
    }

    async fn connect_initiator(
        &self,
        tree: &mut LayerTree,
        node: LayerNodeId,
        params: &NvmeParams,
    ) -> Result<()> {
        let nqn = Self::subsystem_nqn(tree.node(node)?);
        let known = self.controllers.lock().get(&nqn).cloned();
        let ctl = match known {
            Some(ctl) => ctl,
            None => {
                let ctl = self.connect(&nqn, params).await?;
                self.controllers.lock().insert(nqn.clone(), ctl.clone());
                ctl
            }
        };
        let volumes = tree.node(node)?.volume_numbers();
        for vlm in volumes {
            let device = format!("/dev/{}n{}", ctl, Self::namespace_id(vlm));
            tree.volume_mut(node, vlm)?.set_device(Some(device), true);
        }
        Ok(())
    }

    async fn disconnect_initiator(&self, tree: &mut LayerTree, node: LayerNodeId) -> Result<()> {
        let nqn = Self::subsystem_nqn(tree.node(node)?);
        let connected = self.controllers.lock().contains_key(&nqn);
        if connected {
            self.runner
                .run_checked(&ExtCommand::new("nvme").args(["disconnect".to_string(), format!("--nqn={}", nqn)]))
                .await?;
            self.controllers.lock().remove(&nqn);
            info!(nqn = %nqn, "Disconnected from nvme target");
        }
        let volumes = tree.node(node)?.volume_numbers();
        for vlm in volumes {
            tree.volume_mut(node, vlm)?.set_device(None, false);
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceLayer for NvmeLayer {
    fn kind(&self) -> DeviceLayerKind {
        DeviceLayerKind::Nvme
    }

    async fn prepare(&self, nodes: &[&LayerNode]) -> Result<()> {
        let any_initiator = nodes.iter().any(|n| {
            matches!(n.payload(), LayerPayload::Nvme(p) if p.role == NvmeRole::Initiator)
        });
        if !any_initiator {
            return Ok(());
        }
        let found = self.scan_controllers().await?;
        debug!(controllers = found.len(), "Scanned nvme fabrics controllers");
        *self.controllers.lock() = found;
        Ok(())
    }

    async fn process(&self, tree: &mut LayerTree, node: LayerNodeId) -> Result<LayerProcessResult> {
        if is_snapshot(tree) {
            return Ok(LayerProcessResult::NoDevicesProvided);
        }
        let params = Self::params(tree, node)?;
        match (params.role, tree.is_deleting()) {
            (NvmeRole::Target, false) => self.configure_target(tree, node, &params).await?,
            (NvmeRole::Target, true) => self.remove_target(tree, node).await?,
            (NvmeRole::Initiator, false) => self.connect_initiator(tree, node, &params).await?,
            (NvmeRole::Initiator, true) => self.disconnect_initiator(tree, node).await?,
        }
        Ok(LayerProcessResult::Success)
    }

    fn clear_cache(&self) {
        self.controllers.lock().clear();
    }
}
