//! DRBD Layer
//!
//! Replication on top of the data child. The layer renders one resource
//! file per resource, creates metadata where `drbdmeta` finds none and lets
//! `drbdadm adjust` bring the kernel state in line with the file.
//!
//! # Metadata
//!
//! Internal metadata lives at the end of the data device. External metadata
//! uses the `.meta` child as a flexible-size external metadata device.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::exec::{CommandRunnerRef, ExtCommand};
use crate::kinds::{DeviceLayerKind, SUFFIX_DATA, SUFFIX_DRBD_META};
use crate::layers::{child_device, is_snapshot, DeviceLayer, LayerProcessResult, LayerServices};
use crate::observer::{
    ConnectionState, DiskState, ObserverBridge, ReplicationEvent, ReplicationEventKind,
    ReplicationObserver, ReplicationRole,
};
use crate::tree::layer_tree::LayerTree;
use crate::tree::node::{DrbdParams, LayerNode, LayerNodeId};
use crate::tree::volume::VolumeNumber;

/// Placeholder disk of peers; only the local host section is acted upon
const PEER_DISK_PLACEHOLDER: &str = "/dev/drbd/this/is/not/used";

// =============================================================================
// drbdsetup status --json
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ResourceStatus {
    name: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    suspended: bool,
    #[serde(default)]
    devices: Vec<DeviceStatus>,
    #[serde(default)]
    connections: Vec<ConnectionStatus>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DeviceStatus {
    volume: VolumeNumber,
    #[serde(default)]
    disk_state: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ConnectionStatus {
    #[serde(default)]
    peer_node_id: u16,
    #[serde(default)]
    name: String,
    #[serde(default)]
    connection_state: String,
}

impl ResourceStatus {
    fn events(&self) -> Vec<ReplicationEvent> {
        let mut events = vec![ReplicationEvent::new(
            &self.name,
            ReplicationEventKind::ResourceChanged {
                role: ReplicationRole::parse(&self.role),
                suspended: self.suspended,
            },
        )];
        for device in &self.devices {
            events.push(ReplicationEvent::new(
                &self.name,
                ReplicationEventKind::DiskStateChanged {
                    volume: device.volume,
                    disk_state: DiskState::parse(&device.disk_state),
                },
            ));
        }
        for conn in &self.connections {
            let peer = if conn.name.is_empty() {
                conn.peer_node_id.to_string()
            } else {
                conn.name.clone()
            };
            events.push(ReplicationEvent::new(
                &self.name,
                ReplicationEventKind::ConnectionChanged {
                    peer,
                    state: ConnectionState::parse(&conn.connection_state),
                },
            ));
        }
        events
    }
}

// =============================================================================
// Layer
// =============================================================================

/// Local disk setup of one volume
#[derive(Debug, Clone, PartialEq, Eq)]
enum VolumeDisk {
    None,
    Internal { data: String },
    External { data: String, meta: String },
}

pub struct DrbdLayer {
    runner: CommandRunnerRef,
    observer: Arc<ObserverBridge>,
    resource_dir: PathBuf,
    address: String,
    node_name: String,
    dry_run: bool,
    /// Resources the kernel knows, filled by prepare
    active: Mutex<HashMap<String, ResourceStatus>>,
}

impl DrbdLayer {
    pub fn new(services: &LayerServices) -> Self {
        Self {
            runner: services.runner.clone(),
            observer: services.observer.clone(),
            resource_dir: services.config.drbd_resource_dir.clone(),
            address: services.config.drbd_address.clone(),
            node_name: services.config.node_name.clone(),
            dry_run: services.dry_run,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn params(tree: &LayerTree, node: LayerNodeId) -> Result<DrbdParams> {
        tree.node(node)?.drbd().cloned().ok_or_else(|| {
            Error::Implementation(format!("drbd layer asked to process node {}", node))
        })
    }

    fn parse_status(stdout: &str) -> Result<Vec<ResourceStatus>> {
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(stdout)?)
    }

    fn res_file(&self, name: &str) -> PathBuf {
        self.resource_dir.join(format!("{}.res", name))
    }

    fn minor(params: &DrbdParams, vlm: VolumeNumber) -> Result<u32> {
        params
            .minors
            .get(&vlm)
            .copied()
            .ok_or_else(|| Error::InvalidLayerParameter {
                layer: DeviceLayerKind::Drbd.tag().to_string(),
                reason: format!("volume {} has no minor number", vlm),
            })
    }

    fn volume_disk(
        tree: &LayerTree,
        node: LayerNodeId,
        params: &DrbdParams,
        vlm: VolumeNumber,
    ) -> Result<VolumeDisk> {
        if params.diskless || params.skip_disk {
            return Ok(VolumeDisk::None);
        }
        let data = child_device(tree, node, SUFFIX_DATA, vlm)?;
        if tree.child_by_suffix(node, SUFFIX_DRBD_META).is_some() {
            let meta = child_device(tree, node, SUFFIX_DRBD_META, vlm)?;
            Ok(VolumeDisk::External { data, meta })
        } else {
            Ok(VolumeDisk::Internal { data })
        }
    }

    fn address_line(address: &str) -> String {
        let family = if address.starts_with('[') { "ipv6" } else { "ipv4" };
        format!("address {} {};", family, address)
    }

    /// Render the resource file of one resource
    fn render(
        &self,
        name: &str,
        params: &DrbdParams,
        volumes: &[(VolumeNumber, u32, VolumeDisk)],
    ) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# generated by layerstack, changes are overwritten");
        let _ = writeln!(out, "resource \"{}\"\n{{", name);

        let _ = writeln!(out, "    on \"{}\"\n    {{", self.node_name);
        let _ = writeln!(out, "        node-id {};", params.node_id);
        if let Some(port) = params.port {
            let local = format!("{}:{}", self.address, port);
            let _ = writeln!(out, "        {}", Self::address_line(&local));
        }
        for (vlm, minor, disk) in volumes {
            let _ = writeln!(out, "        volume {}\n        {{", vlm);
            let _ = writeln!(out, "            device minor {};", minor);
            match disk {
                VolumeDisk::None => {
                    let _ = writeln!(out, "            disk none;");
                }
                VolumeDisk::Internal { data } => {
                    let _ = writeln!(out, "            disk {};", data);
                    let _ = writeln!(out, "            meta-disk internal;");
                }
                VolumeDisk::External { data, meta } => {
                    let _ = writeln!(out, "            disk {};", data);
                    let _ = writeln!(out, "            meta-disk {};", meta);
                }
            }
            let _ = writeln!(out, "        }}");
        }
        let _ = writeln!(out, "    }}");

        for peer in &params.peers {
            let _ = writeln!(out, "\n    on \"{}\"\n    {{", peer.name);
            let _ = writeln!(out, "        node-id {};", peer.node_id);
            let _ = writeln!(out, "        {}", Self::address_line(&peer.address));
            for (vlm, minor, _) in volumes {
                let _ = writeln!(out, "        volume {}\n        {{", vlm);
                let _ = writeln!(out, "            device minor {};", minor);
                let _ = writeln!(out, "            disk {};", PEER_DISK_PLACEHOLDER);
                let _ = writeln!(out, "            meta-disk internal;");
                let _ = writeln!(out, "        }}");
            }
            let _ = writeln!(out, "    }}");
        }

        if !params.peers.is_empty() {
            let hosts: Vec<String> = std::iter::once(&self.node_name)
                .chain(params.peers.iter().map(|p| &p.name))
                .map(|h| format!("\"{}\"", h))
                .collect();
            let _ = writeln!(out, "\n    connection-mesh\n    {{");
            let _ = writeln!(out, "        hosts {};", hosts.join(" "));
            let _ = writeln!(out, "    }}");
        }
        let _ = writeln!(out, "}}");
        out
    }

    async fn write_res_file(&self, name: &str, content: &str) -> Result<()> {
        let path = self.res_file(name);
        if tokio::fs::read_to_string(&path).await.ok().as_deref() == Some(content) {
            return Ok(());
        }
        if self.dry_run {
            info!(path = %path.display(), "[dry-run] write resource file");
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.resource_dir).await?;
        tokio::fs::write(&path, content).await?;
        debug!(path = %path.display(), "Wrote resource file");
        Ok(())
    }

    async fn remove_res_file(&self, name: &str) -> Result<()> {
        let path = self.res_file(name);
        if self.dry_run {
            info!(path = %path.display(), "[dry-run] remove resource file");
            return Ok(());
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn has_metadata(&self, minor: u32, disk: &VolumeDisk, node_id: u16) -> Result<bool> {
        let (device, kind) = match disk {
            VolumeDisk::None => return Ok(true),
            VolumeDisk::Internal { data } => (data, "internal"),
            VolumeDisk::External { meta, .. } => (meta, "flex-external"),
        };
        let output = self
            .runner
            .run(&ExtCommand::new("drbdmeta").args([
                "--force".to_string(),
                minor.to_string(),
                "v09".to_string(),
                device.clone(),
                kind.to_string(),
                "get-gi".to_string(),
                "--node-id".to_string(),
                node_id.to_string(),
            ]))
            .await?;
        Ok(output.success())
    }

    async fn create_metadata(&self, name: &str, vlm: VolumeNumber, params: &DrbdParams) -> Result<()> {
        self.runner
            .run_checked(&ExtCommand::new("drbdadm").args([
                "create-md".to_string(),
                format!("--max-peers={}", params.peer_slots),
                format!("--al-stripes={}", params.al_stripes),
                format!("--al-stripe-size-kB={}", params.al_stripe_size_kib),
                "--force".to_string(),
                format!("{}/{}", name, vlm),
            ]))
            .await?;
        info!(resource = %name, volume = vlm, "Created DRBD metadata");
        Ok(())
    }

    async fn drbdadm(&self, action: &str, name: &str) -> Result<()> {
        self.runner
            .run_checked(&ExtCommand::new("drbdadm").args([action, name]))
            .await?;
        Ok(())
    }

    async fn bring_down(&self, tree: &mut LayerTree, node: LayerNodeId, name: &str) -> Result<()> {
        let active = self.active.lock().contains_key(name);
        if active {
            self.drbdadm("down", name).await?;
            self.active.lock().remove(name);
            self.observer
                .publish(ReplicationEvent::new(name, ReplicationEventKind::ResourceDestroyed));
            info!(resource = %name, "Brought DRBD resource down");
        }
        self.remove_res_file(name).await?;
        let volumes = tree.node(node)?.volume_numbers();
        for vlm in volumes {
            tree.volume_mut(node, vlm)?.set_device(None, false);
        }
        Ok(())
    }

    async fn adjust(&self, tree: &mut LayerTree, node: LayerNodeId, name: &str) -> Result<()> {
        let params = Self::params(tree, node)?;
        let numbers = tree.node(node)?.volume_numbers();

        let mut volumes = Vec::with_capacity(numbers.len());
        for vlm in &numbers {
            let minor = Self::minor(&params, *vlm)?;
            let disk = Self::volume_disk(tree, node, &params, *vlm)?;
            volumes.push((*vlm, minor, disk));
        }

        let content = self.render(name, &params, &volumes);
        self.write_res_file(name, &content).await?;

        for (vlm, minor, disk) in &volumes {
            if !self.has_metadata(*minor, disk, params.node_id).await? {
                self.create_metadata(name, *vlm, &params).await?;
            }
        }
        self.drbdadm("adjust", name).await?;

        let known = self.active.lock().contains_key(name);
        if !known {
            self.active.lock().insert(
                name.to_string(),
                ResourceStatus {
                    name: name.to_string(),
                    role: String::new(),
                    suspended: false,
                    devices: Vec::new(),
                    connections: Vec::new(),
                },
            );
            info!(resource = %name, volumes = volumes.len(), "Brought DRBD resource up");
        }

        for (vlm, minor, _) in volumes {
            tree.volume_mut(node, vlm)?
                .set_device(Some(format!("/dev/drbd{}", minor)), true);
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceLayer for DrbdLayer {
    fn kind(&self) -> DeviceLayerKind {
        DeviceLayerKind::Drbd
    }

    async fn prepare(&self, nodes: &[&LayerNode]) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let output = self
            .runner
            .run_checked(&ExtCommand::new("drbdsetup").args(["status", "--json"]))
            .await?;
        let statuses = Self::parse_status(&output.stdout)?;
        let mut active = HashMap::with_capacity(statuses.len());
        for status in statuses {
            for event in status.events() {
                self.observer.publish(event);
            }
            active.insert(status.name.clone(), status);
        }
        debug!(resources = active.len(), "Read DRBD status");
        *self.active.lock() = active;
        Ok(())
    }

    async fn process(&self, tree: &mut LayerTree, node: LayerNodeId) -> Result<LayerProcessResult> {
        if is_snapshot(tree) {
            return Ok(LayerProcessResult::NoDevicesProvided);
        }
        let name = tree.node(node)?.suffixed_name();
        if tree.is_deleting() {
            self.bring_down(tree, node, &name).await?;
        } else {
            self.adjust(tree, node, &name).await?;
        }
        Ok(LayerProcessResult::Success)
    }

    fn clear_cache(&self) {
        self.active.lock().clear();
    }

    async fn suspend_io(&self, tree: &LayerTree, node: LayerNodeId) -> Result<()> {
        let name = tree.node(node)?.suffixed_name();
        self.drbdadm("suspend-io", &name).await
    }

    async fn resume_io(&self, tree: &LayerTree, node: LayerNodeId) -> Result<()> {
        let name = tree.node(node)?.suffixed_name();
        self.drbdadm("resume-io", &name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SatelliteConfig;
    use crate::exec::scripted::ScriptedRunner;
    use crate::layers::testing::services;
    use crate::tree::node::{LayerPayload, ResourceRef};
    use crate::tree::spec::DrbdPeer;
    use crate::tree::volume::VolumeLayerData;
    use std::collections::BTreeMap;
    use std::path::Path;

    fn params() -> DrbdParams {
        DrbdParams {
            peer_slots: 7,
            al_stripes: 1,
            al_stripe_size_kib: 32,
            diskless: false,
            skip_disk: false,
            node_id: 0,
            port: Some(7000),
            peers: vec![DrbdPeer {
                name: "node-b".into(),
                node_id: 1,
                address: "10.0.0.2:7000".into(),
            }],
            minors: BTreeMap::from([(0, 1000)]),
        }
    }

    fn drbd_tree(params: DrbdParams, external_meta: bool) -> LayerTree {
        let mut tree = LayerTree::new(
            ResourceRef::resource("r0"),
            LayerPayload::Drbd(params),
            vec![VolumeLayerData::new(0, None)],
        );
        let root = tree.root();
        let mut children = vec![(SUFFIX_DATA, "/dev/vg0/r0_00000")];
        if external_meta {
            children.push((SUFFIX_DRBD_META, "/dev/vg0/r0.meta_00000"));
        }
        for (suffix, device) in children {
            let child = tree
                .insert_child(root, suffix, LayerPayload::Storage, vec![VolumeLayerData::new(0, None)])
                .unwrap();
            tree.volume_mut(child, 0)
                .unwrap()
                .set_device(Some(device.into()), true);
        }
        tree
    }

    fn layer(runner: Arc<ScriptedRunner>, dir: &Path) -> DrbdLayer {
        let config = SatelliteConfig {
            node_name: "node-a".into(),
            drbd_resource_dir: dir.to_path_buf(),
            drbd_address: "10.0.0.1".into(),
            ..Default::default()
        };
        DrbdLayer::new(&services(runner, config))
    }

    #[tokio::test]
    async fn test_new_resource_gets_metadata_and_adjust() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("drbdmeta", 255, "No valid meta data found");
        let layer = layer(runner.clone(), dir.path());
        let mut tree = drbd_tree(params(), false);
        let root = tree.root();
        layer.prepare(&[tree.node(root).unwrap()]).await.unwrap();
        layer.process(&mut tree, root).await.unwrap();

        assert_eq!(
            runner.commands(),
            vec![
                "drbdsetup status --json",
                "drbdmeta --force 1000 v09 /dev/vg0/r0_00000 internal get-gi --node-id 0",
                "drbdadm create-md --max-peers=7 --al-stripes=1 --al-stripe-size-kB=32 --force r0/0",
                "drbdadm adjust r0",
            ]
        );
        assert_eq!(tree.device_path(root, 0).as_deref(), Some("/dev/drbd1000"));

        let res = std::fs::read_to_string(dir.path().join("r0.res")).unwrap();
        assert!(res.contains("on \"node-a\""));
        assert!(res.contains("address ipv4 10.0.0.1:7000;"));
        assert!(res.contains("disk /dev/vg0/r0_00000;"));
        assert!(res.contains("meta-disk internal;"));
        assert!(res.contains("address ipv4 10.0.0.2:7000;"));
        assert!(res.contains("hosts \"node-a\" \"node-b\";"));
    }

    #[tokio::test]
    async fn test_existing_metadata_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let layer = layer(runner.clone(), dir.path());
        let mut tree = drbd_tree(params(), true);
        let root = tree.root();
        layer.process(&mut tree, root).await.unwrap();

        assert_eq!(runner.count("drbdadm create-md"), 0);
        assert_eq!(
            runner.count("drbdmeta --force 1000 v09 /dev/vg0/r0.meta_00000 flex-external"),
            1
        );
        let res = std::fs::read_to_string(dir.path().join("r0.res")).unwrap();
        assert!(res.contains("meta-disk /dev/vg0/r0.meta_00000;"));
    }

    #[tokio::test]
    async fn test_diskless_volume_skips_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let layer = layer(runner.clone(), dir.path());
        let mut p = params();
        p.diskless = true;
        let mut tree = drbd_tree(p, false);
        let root = tree.root();
        layer.process(&mut tree, root).await.unwrap();

        assert_eq!(runner.count("drbdmeta"), 0);
        assert_eq!(runner.commands(), vec!["drbdadm adjust r0"]);
        let res = std::fs::read_to_string(dir.path().join("r0.res")).unwrap();
        assert!(res.contains("disk none;"));
        assert!(tree.volume(root, 0).unwrap().exists());
    }

    #[tokio::test]
    async fn test_missing_minor_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let layer = layer(runner.clone(), dir.path());
        let mut p = params();
        p.minors.clear();
        let mut tree = drbd_tree(p, false);
        let root = tree.root();
        let err = layer.process(&mut tree, root).await.unwrap_err();
        assert!(matches!(err, Error::InvalidLayerParameter { .. }));
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_publishes_status() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "drbdsetup status",
            r#"[{"name":"r0","node-id":0,"role":"Primary","suspended":true,
                "devices":[{"volume":0,"minor":1000,"disk-state":"Failed"}],
                "connections":[{"peer-node-id":1,"name":"node-b","connection-state":"Connecting"}]}]"#,
        );
        let layer = layer(runner.clone(), dir.path());
        let tree = drbd_tree(params(), false);
        layer.prepare(&[tree.node(tree.root()).unwrap()]).await.unwrap();

        let state = layer.observer.resource_state("r0").unwrap();
        assert_eq!(state.role, ReplicationRole::Primary);
        assert!(state.suspended);
        assert_eq!(state.disks[&0], DiskState::Failed);
        assert_eq!(state.connections["node-b"], ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_delete_brings_resource_down() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("r0.res"), "resource \"r0\" {}").unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("drbdsetup status", r#"[{"name":"r0","role":"Secondary"}]"#);
        let layer = layer(runner.clone(), dir.path());
        let mut tree = drbd_tree(params(), false);
        tree.set_deleting(true);
        let root = tree.root();
        layer.prepare(&[tree.node(root).unwrap()]).await.unwrap();
        layer.process(&mut tree, root).await.unwrap();

        assert_eq!(runner.count("drbdadm down r0"), 1);
        assert!(!dir.path().join("r0.res").exists());
        assert!(layer.observer.resource_state("r0").is_none());
    }

    #[tokio::test]
    async fn test_suspend_and_resume_io() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let layer = layer(runner.clone(), dir.path());
        let tree = drbd_tree(params(), false);
        layer.suspend_io(&tree, tree.root()).await.unwrap();
        layer.resume_io(&tree, tree.root()).await.unwrap();
        assert_eq!(
            runner.commands(),
            vec!["drbdadm suspend-io r0", "drbdadm resume-io r0"]
        );
    }
}
